//! Producer client.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::domain::{BrokerError, Task, TaskId, TaskInfo, TaskMessage};
use crate::ports::Broker;

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Per-enqueue overrides. Unset fields fall back to `default` queue,
/// 24h retention and a fresh ULID.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    queue: Option<String>,
    retention: Option<Duration>,
    task_id: Option<TaskId>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn task_id(mut self, id: impl Into<TaskId>) -> Self {
        self.task_id = Some(id.into());
        self
    }
}

pub struct Client {
    broker: Arc<dyn Broker>,
}

impl Client {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    pub async fn enqueue(&self, task: Task, opts: EnqueueOptions) -> Result<TaskInfo, BrokerError> {
        let msg = TaskMessage::new(
            opts.task_id.unwrap_or_else(TaskId::generate),
            task,
            opts.queue.unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
            opts.retention.unwrap_or(DEFAULT_RETENTION),
        );

        self.broker.enqueue(&msg).await?;
        info!(task_id = %msg.id, queue = %msg.queue, task_type = %msg.task_type, "task enqueued");
        Ok(TaskInfo::from(&msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskState;
    use crate::impls::InMemoryBroker;

    #[tokio::test]
    async fn enqueue_applies_defaults() {
        let broker = Arc::new(InMemoryBroker::new());
        let client = Client::new(broker.clone());

        let info = client
            .enqueue(Task::new("email:deliver", b"{}".to_vec()), EnqueueOptions::new())
            .await
            .unwrap();

        assert_eq!(info.queue, DEFAULT_QUEUE);
        assert_eq!(info.retention, DEFAULT_RETENTION);
        assert_eq!(info.task_type, "email:deliver");

        let record = broker.lookup(DEFAULT_QUEUE, &info.id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Queued);
    }

    #[tokio::test]
    async fn enqueue_honours_overrides_and_rejects_duplicates() {
        let broker = Arc::new(InMemoryBroker::new());
        let client = Client::new(broker);
        let opts = EnqueueOptions::new()
            .queue("critical")
            .retention(Duration::from_secs(30))
            .task_id("report-2024-01");

        let info = client
            .enqueue(Task::new("report:build", Vec::new()), opts.clone())
            .await
            .unwrap();
        assert_eq!(info.id, TaskId::new("report-2024-01"));
        assert_eq!(info.queue, "critical");
        assert_eq!(info.retention, Duration::from_secs(30));

        let err = client
            .enqueue(Task::new("report:build", Vec::new()), opts)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::AlreadyExists { .. }));
    }
}
