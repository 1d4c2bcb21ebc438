//! Broker port: the task lifecycle engine.
//!
//! Every mutating operation is a single atomic step against the shared store,
//! so any number of producers and servers (possibly in other processes) can
//! call these concurrently without client-side locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{BrokerError, TaskId, TaskMessage, TaskState};
use crate::observability::QueueCounts;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Create the record in `Queued` state and append its ID to the queue's
    /// pending set, scored by the current time.
    ///
    /// Fails with `AlreadyExists` (writing nothing) if a record with this ID
    /// is already present in `msg.queue`.
    async fn enqueue(&self, msg: &TaskMessage) -> Result<(), BrokerError>;

    /// Claim the oldest pending task from the first non-empty queue in
    /// `queues`, moving it to the active set and marking it `Running`.
    ///
    /// Returns `EmptyQueue` when every listed queue is empty.
    async fn dequeue(&self, queues: &[String]) -> Result<TaskMessage, BrokerError>;

    /// Remove an active task, record its terminal `outcome` and schedule the
    /// record to expire at `expire_at`.
    ///
    /// Returns `NotFound` if the task is not in the queue's active set.
    async fn complete(
        &self,
        queue: &str,
        id: &TaskId,
        outcome: TaskState,
        expire_at: DateTime<Utc>,
    ) -> Result<(), BrokerError>;

    /// Read a record without changing it. `None` once purged.
    async fn lookup(&self, queue: &str, id: &TaskId) -> Result<Option<TaskMessage>, BrokerError>;

    async fn counts(&self, queue: &str) -> Result<QueueCounts, BrokerError>;
}

/// Shared precondition for `complete` implementations.
pub(crate) fn ensure_terminal(outcome: TaskState) -> Result<(), BrokerError> {
    if outcome.is_terminal() {
        Ok(())
    } else {
        Err(BrokerError::InvalidOutcome(outcome))
    }
}
