//! Forwarding core.
//!
//! [`ForwardController`] owns the accept loops that carry bytes between
//! local TCP sockets and named overlay streams, [`HealthChecker`] probes
//! whether a peer accepts streams, and [`CircuitFallback`] establishes a
//! relayed connection when the direct path is down.

mod circuit;
mod controller;
mod error;
mod health;

pub use circuit::CircuitFallback;
pub use controller::{ForwardController, CONNECT_TIMEOUT};
pub use error::ForwardError;
pub use health::{HealthChecker, HEALTH_CHECK_TIMEOUT};
