//! App layer: wires ports together.
//!
//! - **Client**: producer side, builds messages and enqueues them
//! - **QueuePriority**: try-order of queues per dequeue attempt
//! - **HandlerRegistry**: task type -> handler
//! - **Server**: dispatch loop (dequeue -> handle -> complete)

pub mod client;
pub mod priority;
pub mod registry;
pub mod server;

pub use self::client::{Client, DEFAULT_QUEUE, DEFAULT_RETENTION, EnqueueOptions};
pub use self::priority::{PriorityMode, QueuePriority};
pub use self::registry::{Handler, HandlerFn, HandlerRegistry, TaskContext};
pub use self::server::{Server, ServerHandle};
