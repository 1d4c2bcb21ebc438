//! Ports: seams to the outside world.
//!
//! - `Broker`: the shared store holding task records and queue collections.
//! - `Clock`: time source for scores and expiry.

pub mod broker;
pub mod clock;

pub use self::broker::Broker;
pub use self::clock::{Clock, FixedClock, SystemClock};
