//! Error types.

use thiserror::Error;

use super::{TaskId, TaskState};

/// Boxed error returned by handlers and carried by transport failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors returned by `Broker` operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// A record for this ID already exists in the queue. Nothing was written.
    #[error("task {id} already exists in queue {queue}")]
    AlreadyExists { queue: String, id: TaskId },

    /// Every queue in the try-order had an empty pending set.
    /// Expected; callers back off and retry.
    #[error("empty queue")]
    EmptyQueue,

    /// The task is not in the active set (already completed, never dequeued, or purged).
    #[error("task {id} is not active in queue {queue}")]
    NotFound { queue: String, id: TaskId },

    /// A stored record is missing a field or has a malformed one.
    #[error("decode task record: {0}")]
    Decode(String),

    /// Completion was requested with a non-terminal state.
    #[error("cannot complete a task as {0}")]
    InvalidOutcome(TaskState),

    /// The store is unreachable or a script failed.
    #[error("store transport: {0}")]
    Transport(#[source] BoxError),
}

impl BrokerError {
    /// Conditions the dispatch loop treats as transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::EmptyQueue | BrokerError::Transport(_))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for BrokerError {
    fn from(err: redis::RedisError) -> Self {
        BrokerError::Transport(Box::new(err))
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate handler for task_type={0}")]
    DuplicateHandler(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
