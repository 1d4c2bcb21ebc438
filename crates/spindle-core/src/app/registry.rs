use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::domain::{BoxError, RegistryError, Task, TaskId};

/// What a handler knows about the task it is running, besides the task itself.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    queue: String,
    shutdown: watch::Receiver<bool>,
}

impl TaskContext {
    pub fn new(task_id: TaskId, queue: impl Into<String>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            task_id,
            queue: queue.into(),
            shutdown,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// True once the server has been asked to stop. Long handlers may bail early.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves when the server is asked to stop.
    pub async fn shutdown_requested(&mut self) {
        // a dropped sender counts as shutdown as well
        let _ = self.shutdown.wait_for(|stop| *stop).await;
    }
}

/// A handler for one task type.
///
/// Returning `Err` completes the task as failed.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn process_task(&self, ctx: TaskContext, task: Task) -> Result<(), BoxError>;
}

/// Adapts a plain async function into a `Handler`.
pub struct HandlerFn<F> {
    f: F,
}

impl<F> HandlerFn<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(TaskContext, Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn process_task(&self, ctx: TaskContext, task: Task) -> Result<(), BoxError> {
        (self.f)(ctx, task).await
    }
}

/// Registry of handlers (task_type -> handler).
///
/// Built before the server starts, read-only afterwards, so no locks.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler object for a task type.
    pub fn handle<H>(
        &mut self,
        task_type: impl Into<String>,
        handler: H,
    ) -> Result<(), RegistryError>
    where
        H: Handler + 'static,
    {
        self.insert(task_type.into(), Arc::new(handler))
    }

    /// Register an async function for a task type.
    pub fn handle_fn<F, Fut>(
        &mut self,
        task_type: impl Into<String>,
        f: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(TaskContext, Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.insert(task_type.into(), Arc::new(HandlerFn::new(f)))
    }

    fn insert(
        &mut self,
        task_type: String,
        handler: Arc<dyn Handler>,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::DuplicateHandler(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
