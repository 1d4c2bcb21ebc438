//! Dispatch server: claims tasks by queue priority and runs their handlers
//! under a concurrency cap.

use std::any::Any;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::priority::QueuePriority;
use super::registry::{HandlerRegistry, TaskContext};
use crate::config::ServerConfig;
use crate::domain::{BrokerError, ConfigError, TaskMessage, TaskState};
use crate::ports::clock::add_duration;
use crate::ports::{Broker, Clock, SystemClock};

/// Handle to a server started with [`Server::start`].
/// - dropping it stops the loop as well
/// - `shutdown()` waits for the loop, including the drain of in-flight tasks
pub struct ServerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop claiming new tasks. Does not wait.
    pub fn request_shutdown(&self) {
        // ignore send error: the loop may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop and wait for the loop to return.
    pub async fn shutdown(self) {
        self.request_shutdown();
        if let Err(e) = self.join.await {
            error!(error = %e, "server loop ended abnormally");
        }
    }
}

/// Everything an execution unit needs, shared by all units.
struct Executor {
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
}

impl Executor {
    /// Run the handler, then record the outcome. The permit is held until the
    /// completion call returns and is released on every path by drop.
    async fn execute(
        &self,
        ctx: TaskContext,
        msg: TaskMessage,
        _permit: OwnedSemaphorePermit,
    ) {
        let outcome = self.run_handler(ctx, &msg).await;
        let expire_at = add_duration(self.clock.now(), msg.retention);

        match self
            .broker
            .complete(&msg.queue, &msg.id, outcome, expire_at)
            .await
        {
            Ok(()) => {
                info!(task_id = %msg.id, queue = %msg.queue, state = %outcome, "task completed");
            }
            Err(err @ (BrokerError::NotFound { .. } | BrokerError::AlreadyExists { .. })) => {
                warn!(
                    task_id = %msg.id,
                    queue = %msg.queue,
                    error = %err,
                    "completion already resolved elsewhere"
                );
            }
            Err(err) => {
                error!(
                    task_id = %msg.id,
                    queue = %msg.queue,
                    error = %err,
                    "failed to record completion"
                );
            }
        }
    }

    /// Handler faults (error, panic, no handler) all map to `Failed`.
    async fn run_handler(&self, ctx: TaskContext, msg: &TaskMessage) -> TaskState {
        let Some(handler) = self.registry.get(&msg.task_type) else {
            warn!(task_id = %msg.id, task_type = %msg.task_type, "handler not found");
            return TaskState::Failed;
        };

        // Own task per handler: a panic ends up in the JoinError instead of
        // unwinding through this unit.
        let task = msg.task();
        let run = tokio::spawn(async move { handler.process_task(ctx, task).await });

        match run.await {
            Ok(Ok(())) => TaskState::Succeeded,
            Ok(Err(err)) => {
                warn!(task_id = %msg.id, task_type = %msg.task_type, error = %err, "task failed");
                TaskState::Failed
            }
            Err(join_err) if join_err.is_panic() => {
                let panic = panic_message(join_err.into_panic());
                error!(
                    task_id = %msg.id,
                    task_type = %msg.task_type,
                    panic = %panic,
                    "handler panicked"
                );
                TaskState::Failed
            }
            Err(join_err) => {
                error!(
                    task_id = %msg.id,
                    task_type = %msg.task_type,
                    error = %join_err,
                    "handler cancelled"
                );
                TaskState::Failed
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

pub struct Server {
    executor: Arc<Executor>,
    priority: QueuePriority,
    config: ServerConfig,
}

impl Server {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: HandlerRegistry,
        config: ServerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            executor: Arc::new(Executor {
                broker,
                registry: Arc::new(registry),
                clock: Arc::new(SystemClock),
            }),
            priority: QueuePriority::new(&config.queues, config.priority),
            config,
        })
    }

    /// Swap the time source used for expiry (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.executor = Arc::new(Executor {
            broker: Arc::clone(&self.executor.broker),
            registry: Arc::clone(&self.executor.registry),
            clock,
        });
        self
    }

    /// Replace the priority policy, e.g. one with a seeded RNG.
    pub fn with_priority(mut self, priority: QueuePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Spawn the loop on the current runtime.
    pub fn start(self) -> ServerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        ServerHandle { shutdown_tx, join }
    }

    /// Run until `shutdown` flips to true (or its sender is dropped), then
    /// drain in-flight tasks for up to `shutdown_timeout`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let permits = Arc::new(Semaphore::new(self.config.concurrency));
        let mut in_flight: JoinSet<()> = JoinSet::new();

        info!(
            concurrency = self.config.concurrency,
            queues = ?self.config.queues,
            mode = ?self.priority.mode(),
            "server running"
        );

        loop {
            reap_finished(&mut in_flight);

            if *shutdown.borrow() {
                break;
            }

            // Blocks while `concurrency` handlers are running.
            let permit = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let order = self.priority.order();
            match self.executor.broker.dequeue(&order).await {
                Ok(msg) => {
                    debug!(
                        task_id = %msg.id,
                        queue = %msg.queue,
                        task_type = %msg.task_type,
                        "task claimed"
                    );
                    let executor = Arc::clone(&self.executor);
                    let ctx =
                        TaskContext::new(msg.id.clone(), msg.queue.clone(), shutdown.clone());
                    in_flight.spawn(async move { executor.execute(ctx, msg, permit).await });
                }
                Err(BrokerError::EmptyQueue) => {
                    drop(permit);
                    self.back_off(&mut shutdown).await;
                }
                Err(err) => {
                    drop(permit);
                    if err.is_transient() {
                        warn!(error = %err, "dequeue failed, retrying after backoff");
                    } else {
                        error!(error = %err, "dequeue task error");
                    }
                    self.back_off(&mut shutdown).await;
                }
            }
        }

        info!(in_flight = in_flight.len(), "stop server");
        self.drain(in_flight).await;
    }

    /// Sleep before the next attempt, cut short by shutdown.
    async fn back_off(&self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.empty_queue_backoff) => {}
            _ = shutdown.changed() => {}
        }
    }

    async fn drain(&self, mut in_flight: JoinSet<()>) {
        if in_flight.is_empty() {
            return;
        }

        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while let Some(res) = in_flight.join_next().await {
                log_unit_result(res);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                abandoned = in_flight.len(),
                timeout = ?self.config.shutdown_timeout,
                "shutdown timeout elapsed, leaving in-flight tasks running"
            );
            in_flight.detach_all();
        }
    }
}

fn reap_finished(in_flight: &mut JoinSet<()>) {
    while let Some(res) = in_flight.try_join_next() {
        log_unit_result(res);
    }
}

fn log_unit_result(res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        error!(error = %e, "execution unit ended abnormally");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::time::{Instant, sleep};

    use chrono::{TimeZone, Utc};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use crate::app::client::{Client, EnqueueOptions};
    use crate::app::priority::PriorityMode;
    use crate::domain::{BoxError, Task, TaskId};
    use crate::impls::InMemoryBroker;
    use crate::ports::FixedClock;

    fn fast_config(concurrency: usize) -> ServerConfig {
        ServerConfig {
            concurrency,
            empty_queue_backoff: Duration::from_millis(5),
            shutdown_timeout: Duration::from_secs(2),
            ..ServerConfig::default()
        }
    }

    async fn enqueue(broker: &Arc<InMemoryBroker>, task_type: &str, queue: &str) -> TaskId {
        let client = Client::new(broker.clone());
        client
            .enqueue(Task::new(task_type, b"{}".to_vec()), EnqueueOptions::new().queue(queue))
            .await
            .unwrap()
            .id
    }

    async fn wait_for_state(broker: &InMemoryBroker, queue: &str, id: &TaskId, want: TaskState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let current = broker.lookup(queue, id).await.unwrap().map(|m| m.state);
            if current == Some(want) {
                return;
            }
            assert!(Instant::now() < deadline, "task {id} stuck in {current:?}, want {want}");
            sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn panic_payloads_are_readable() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(42_u8)), "non-string panic payload");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = ServerConfig {
            concurrency: 0,
            ..ServerConfig::default()
        };
        let broker = Arc::new(crate::impls::InMemoryBroker::new());
        assert!(Server::new(broker, HandlerRegistry::new(), config).is_err());
    }

    #[tokio::test]
    async fn outcomes_follow_handler_result() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut registry = HandlerRegistry::new();
        registry
            .handle_fn("email:deliver", |_ctx, _task| async { Ok::<(), BoxError>(()) })
            .unwrap();
        registry
            .handle_fn("email:bounce", |_ctx, _task| async {
                Err(BoxError::from("mailbox full"))
            })
            .unwrap();
        registry
            .handle_fn("image:resize", |_ctx, _task| async {
                if true {
                    panic!("decoder blew up");
                }
                Ok::<(), BoxError>(())
            })
            .unwrap();

        let ok = enqueue(&broker, "email:deliver", "default").await;
        let failed = enqueue(&broker, "email:bounce", "default").await;
        let panicked = enqueue(&broker, "image:resize", "default").await;
        let unknown = enqueue(&broker, "video:encode", "default").await;

        let handle = Server::new(broker.clone(), registry, fast_config(4))
            .unwrap()
            .start();

        wait_for_state(&broker, "default", &ok, TaskState::Succeeded).await;
        wait_for_state(&broker, "default", &failed, TaskState::Failed).await;
        wait_for_state(&broker, "default", &panicked, TaskState::Failed).await;
        wait_for_state(&broker, "default", &unknown, TaskState::Failed).await;

        // the loop survived the panic and keeps serving
        let late = enqueue(&broker, "email:deliver", "default").await;
        wait_for_state(&broker, "default", &late, TaskState::Succeeded).await;

        handle.shutdown().await;
        assert!(broker.counts("default").await.unwrap().is_idle());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_cap_is_never_exceeded() {
        let broker = Arc::new(InMemoryBroker::new());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut registry = HandlerRegistry::new();
        {
            let running = running.clone();
            let peak = peak.clone();
            registry
                .handle_fn("report:build", move |_ctx, _task| {
                    let running = running.clone();
                    let peak = peak.clone();
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        sleep(Duration::from_millis(30)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<(), BoxError>(())
                    }
                })
                .unwrap();
        }

        let mut ids = Vec::new();
        for _ in 0..6 {
            ids.push(enqueue(&broker, "report:build", "default").await);
        }

        let handle = Server::new(broker.clone(), registry, fast_config(2))
            .unwrap()
            .start();
        for id in &ids {
            wait_for_state(&broker, "default", id, TaskState::Succeeded).await;
        }
        handle.shutdown().await;

        let peak = peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak concurrency was {peak}");
    }

    #[tokio::test]
    async fn strict_priority_drains_heavier_queue_first() {
        let broker = Arc::new(InMemoryBroker::new());
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let mut registry = HandlerRegistry::new();
        {
            let seen = seen.clone();
            registry
                .handle_fn("job", move |ctx: TaskContext, _task| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push(ctx.queue().to_string());
                        Ok::<(), BoxError>(())
                    }
                })
                .unwrap();
        }

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(("low", enqueue(&broker, "job", "low").await));
        }
        for _ in 0..3 {
            ids.push(("critical", enqueue(&broker, "job", "critical").await));
        }

        let config = ServerConfig {
            queues: BTreeMap::from([("critical".to_string(), 6), ("low".to_string(), 1)]),
            priority: PriorityMode::Strict,
            ..fast_config(1)
        };
        let handle = Server::new(broker.clone(), registry, config).unwrap().start();
        for (queue, id) in &ids {
            wait_for_state(&broker, queue, id, TaskState::Succeeded).await;
        }
        handle.shutdown().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["critical", "critical", "critical", "low", "low", "low"]
        );
    }

    #[tokio::test]
    async fn unlisted_queues_are_never_served() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut registry = HandlerRegistry::new();
        registry.handle_fn("job", |_ctx, _task| async { Ok::<(), BoxError>(()) }).unwrap();

        let id = enqueue(&broker, "job", "other").await;
        let handle = Server::new(broker.clone(), registry, fast_config(1))
            .unwrap()
            .start();
        sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;

        let msg = broker.lookup("other", &id).await.unwrap().unwrap();
        assert_eq!(msg.state, TaskState::Queued);
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_handler() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut registry = HandlerRegistry::new();
        registry
            .handle_fn("job", |mut ctx: TaskContext, _task| async move {
                ctx.shutdown_requested().await;
                sleep(Duration::from_millis(20)).await;
                Ok::<(), BoxError>(())
            })
            .unwrap();

        let id = enqueue(&broker, "job", "default").await;
        let handle = Server::new(broker.clone(), registry, fast_config(1))
            .unwrap()
            .start();
        wait_for_state(&broker, "default", &id, TaskState::Running).await;

        handle.shutdown().await;

        let msg = broker.lookup("default", &id).await.unwrap().unwrap();
        assert_eq!(msg.state, TaskState::Succeeded);
    }

    #[tokio::test]
    async fn shutdown_gives_up_after_timeout() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut registry = HandlerRegistry::new();
        registry
            .handle_fn("job", |_ctx, _task| async {
                sleep(Duration::from_secs(30)).await;
                Ok::<(), BoxError>(())
            })
            .unwrap();

        let id = enqueue(&broker, "job", "default").await;
        let config = ServerConfig {
            shutdown_timeout: Duration::from_millis(50),
            ..fast_config(1)
        };
        let handle = Server::new(broker.clone(), registry, config).unwrap().start();
        wait_for_state(&broker, "default", &id, TaskState::Running).await;

        let started = Instant::now();
        handle.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(5));

        let msg = broker.lookup("default", &id).await.unwrap().unwrap();
        assert_eq!(msg.state, TaskState::Running);
    }

    #[tokio::test]
    async fn completed_record_is_kept_for_its_retention() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(t0));
        let broker = Arc::new(InMemoryBroker::with_clock(clock.clone()));

        let mut registry = HandlerRegistry::new();
        registry
            .handle_fn("job", |_ctx, _task| async { Ok::<(), BoxError>(()) })
            .unwrap();

        let client = Client::new(broker.clone());
        let id = client
            .enqueue(
                Task::new("job", Vec::new()),
                EnqueueOptions::new().retention(Duration::from_secs(300)),
            )
            .await
            .unwrap()
            .id;

        let handle = Server::new(broker.clone(), registry, fast_config(1))
            .unwrap()
            .with_clock(clock.clone())
            .start();
        wait_for_state(&broker, "default", &id, TaskState::Succeeded).await;
        handle.shutdown().await;

        clock.set(t0 + chrono::Duration::seconds(299));
        assert!(broker.lookup("default", &id).await.unwrap().is_some());

        clock.set(t0 + chrono::Duration::seconds(300));
        assert!(broker.lookup("default", &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn injected_priority_replaces_configured_policy() {
        let broker = Arc::new(InMemoryBroker::new());
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let mut registry = HandlerRegistry::new();
        {
            let seen = seen.clone();
            registry
                .handle_fn("job", move |ctx: TaskContext, _task| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push(ctx.queue().to_string());
                        Ok::<(), BoxError>(())
                    }
                })
                .unwrap();
        }

        let mut ids = Vec::new();
        for _ in 0..2 {
            ids.push(("low", enqueue(&broker, "job", "low").await));
        }
        for _ in 0..2 {
            ids.push(("critical", enqueue(&broker, "job", "critical").await));
        }

        // configured weights favour "low" heavily; the injected policy does not
        let config = ServerConfig {
            queues: BTreeMap::from([("critical".to_string(), 1), ("low".to_string(), 1000)]),
            ..fast_config(1)
        };
        let strict = QueuePriority::with_rng(
            &BTreeMap::from([("critical".to_string(), 6), ("low".to_string(), 1)]),
            PriorityMode::Strict,
            StdRng::seed_from_u64(7),
        );
        let handle = Server::new(broker.clone(), registry, config)
            .unwrap()
            .with_priority(strict)
            .start();
        for (queue, id) in &ids {
            wait_for_state(&broker, queue, id, TaskState::Succeeded).await;
        }
        handle.shutdown().await;

        assert_eq!(*seen.lock().unwrap(), vec!["critical", "critical", "low", "low"]);
    }
}
