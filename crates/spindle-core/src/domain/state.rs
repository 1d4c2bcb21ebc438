//! Task state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Task state.
///
/// State transitions:
/// - Queued -> Running (dequeue)
/// - Running -> Succeeded | Failed (complete)
///
/// There is no path back to Queued: a failed task is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in the pending set.
    Queued,

    /// Claimed by a worker, present in the active set.
    Running,

    /// Handler returned Ok.
    Succeeded,

    /// Handler returned an error, panicked, or was not registered.
    Failed,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }

    /// Wire name used in store records.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskState::Queued),
            "running" => Ok(TaskState::Running),
            "succeeded" => Ok(TaskState::Succeeded),
            "failed" => Ok(TaskState::Failed),
            other => Err(format!("unknown task state '{other}'")),
        }
    }
}
