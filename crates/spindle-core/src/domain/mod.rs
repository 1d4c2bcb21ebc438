//! Domain model (task records, IDs, states, errors).

pub mod errors;
pub mod state;
pub mod task;

pub use errors::{BoxError, BrokerError, ConfigError, RegistryError};
pub use state::TaskState;
pub use task::{Task, TaskId, TaskInfo, TaskMessage};
