use serde::{Deserialize, Serialize};

/// Sizes of a queue's two collections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub active: usize,
}

impl QueueCounts {
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.active == 0
    }
}
