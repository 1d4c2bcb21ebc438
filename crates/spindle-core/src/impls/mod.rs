//! Broker implementations.
//!
//! - **RedisBroker**: shared store for multi-process deployments (feature `redis`)
//! - **InMemoryBroker**: single-process, for tests and local runs

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_broker;

pub use self::memory::InMemoryBroker;
#[cfg(feature = "redis")]
pub use self::redis_broker::RedisBroker;
