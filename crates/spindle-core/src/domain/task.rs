use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use ulid::Ulid;

use super::TaskState;

/// Identifier of a task.
///
/// Producers may pick their own IDs; otherwise `generate()` hands out a ULID,
/// which sorts by creation time and needs no coordination between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Task type + payload, the part a handler sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    task_type: String,
    payload: Vec<u8>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            task_type: task_type.into(),
            payload: payload.into(),
        }
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// The full task record as kept by a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMessage {
    pub id: TaskId,
    pub task_type: String,
    pub payload: Vec<u8>,
    pub queue: String,
    /// How long the record survives after completion.
    pub retention: Duration,
    pub state: TaskState,
}

impl TaskMessage {
    /// A fresh record in the `Queued` state.
    pub fn new(id: TaskId, task: Task, queue: impl Into<String>, retention: Duration) -> Self {
        Self {
            id,
            task_type: task.task_type,
            payload: task.payload,
            queue: queue.into(),
            retention,
            state: TaskState::Queued,
        }
    }

    /// Handler view of this record.
    pub fn task(&self) -> Task {
        Task::new(self.task_type.clone(), self.payload.clone())
    }
}

/// What the producer gets back from a successful enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub task_type: String,
    pub queue: String,
    pub retention: Duration,
}

impl From<&TaskMessage> for TaskInfo {
    fn from(msg: &TaskMessage) -> Self {
        Self {
            id: msg.id.clone(),
            task_type: msg.task_type.clone(),
            queue: msg.queue.clone(),
            retention: msg.retention,
        }
    }
}
