//! spindle-core
//!
//! Building blocks for a Redis-backed, priority-aware task queue.
//!
//! - **domain**: task model, states, errors
//! - **ports**: `Broker` and `Clock` abstractions
//! - **impls**: `RedisBroker` (feature `redis`) and `InMemoryBroker`
//! - **app**: client, priority policy, handler registry, dispatch server
//! - **config**: typed configuration from `SPINDLE_*` variables

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;

pub use app::{
    Client, EnqueueOptions, Handler, HandlerRegistry, PriorityMode, QueuePriority, Server,
    ServerHandle, TaskContext,
};
pub use config::{Config, ServerConfig};
pub use domain::{BoxError, BrokerError, Task, TaskId, TaskInfo, TaskMessage, TaskState};
pub use ports::{Broker, Clock};

// Callers need `ExposeSecret` to read `Config::redis_url`.
pub use secrecy;
