//! In-memory broker.
//!
//! Same contract as the Redis broker, with one mutex standing in for the
//! store's script atomicity. Useful for tests and single-process setups;
//! nothing is shared across processes.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{BrokerError, TaskId, TaskMessage, TaskState};
use crate::observability::QueueCounts;
use crate::ports::broker::ensure_terminal;
use crate::ports::{Broker, Clock, SystemClock};

/// A record plus its absolute expiry (set on completion).
#[derive(Debug, Clone)]
struct StoredRecord {
    msg: TaskMessage,
    expire_at: Option<DateTime<Utc>>,
}

/// One queue: records + pending/active sets.
///
/// The sets hold `(score, id)` so iteration order matches a sorted set:
/// by score, ties broken by ID.
#[derive(Debug, Default)]
struct QueueState {
    records: HashMap<TaskId, StoredRecord>,
    pending: BTreeSet<(i64, TaskId)>,
    active: BTreeSet<(i64, TaskId)>,
}

impl QueueState {
    /// Drop records whose expiry has passed, the way the store would.
    fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.records
            .retain(|_, record| record.expire_at.is_none_or(|at| at > now));
    }

    fn active_entry(&self, id: &TaskId) -> Option<(i64, TaskId)> {
        self.active.iter().find(|(_, member)| member == id).cloned()
    }
}

pub struct InMemoryBroker {
    queues: Arc<Mutex<HashMap<String, QueueState>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, msg: &TaskMessage) -> Result<(), BrokerError> {
        let now = self.clock.now();
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(msg.queue.clone()).or_default();
        queue.purge_expired(now);

        if queue.records.contains_key(&msg.id) {
            return Err(BrokerError::AlreadyExists {
                queue: msg.queue.clone(),
                id: msg.id.clone(),
            });
        }

        let mut record = msg.clone();
        record.state = TaskState::Queued;
        queue.records.insert(
            msg.id.clone(),
            StoredRecord {
                msg: record,
                expire_at: None,
            },
        );
        queue.pending.insert((now.timestamp_micros(), msg.id.clone()));
        Ok(())
    }

    async fn dequeue(&self, queues: &[String]) -> Result<TaskMessage, BrokerError> {
        let now = self.clock.now();
        let mut state = self.queues.lock().await;

        for name in queues {
            let Some(queue) = state.get_mut(name) else {
                continue;
            };
            queue.purge_expired(now);

            let Some((_, id)) = queue.pending.pop_first() else {
                continue;
            };
            let record = queue.records.get_mut(&id).ok_or_else(|| {
                BrokerError::Decode(format!("record for task {id} in queue {name} is missing"))
            })?;
            record.msg.state = TaskState::Running;
            queue.active.insert((now.timestamp_micros(), id));
            return Ok(record.msg.clone());
        }

        Err(BrokerError::EmptyQueue)
    }

    async fn complete(
        &self,
        queue: &str,
        id: &TaskId,
        outcome: TaskState,
        expire_at: DateTime<Utc>,
    ) -> Result<(), BrokerError> {
        ensure_terminal(outcome)?;

        let now = self.clock.now();
        let mut state = self.queues.lock().await;
        let not_found = || BrokerError::NotFound {
            queue: queue.to_string(),
            id: id.clone(),
        };

        let q = state.get_mut(queue).ok_or_else(not_found)?;
        q.purge_expired(now);
        let entry = q.active_entry(id).ok_or_else(not_found)?;
        q.active.remove(&entry);

        // A record that vanished while active is not recreated.
        if let Some(record) = q.records.get_mut(id) {
            record.msg.state = outcome;
            record.expire_at = Some(expire_at);
        }
        Ok(())
    }

    async fn lookup(&self, queue: &str, id: &TaskId) -> Result<Option<TaskMessage>, BrokerError> {
        let now = self.clock.now();
        let mut state = self.queues.lock().await;
        let Some(q) = state.get_mut(queue) else {
            return Ok(None);
        };
        q.purge_expired(now);
        Ok(q.records.get(id).map(|record| record.msg.clone()))
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, BrokerError> {
        let state = self.queues.lock().await;
        Ok(state
            .get(queue)
            .map(|q| QueueCounts {
                pending: q.pending.len(),
                active: q.active.len(),
            })
            .unwrap_or_default())
    }
}
