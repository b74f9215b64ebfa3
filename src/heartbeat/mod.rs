//! Liveness for long-lived connections.
//!
//! A [`Link`] owns one connection at a time. Both ends pulse heartbeats, a
//! pump task drains the socket continuously, and a watchdog task trips the
//! connection's cancellation token after a full timeout with nothing
//! received. Only inbound bytes count, so a side's own traffic never hides a
//! silent peer. The watchdog runs on its own task so a wedged read cannot
//! delay detection.

pub mod connector;
pub mod link;
pub mod watchdog;

pub use connector::{Acceptor, Connector, Resolver};
pub use link::Link;
pub use watchdog::Metered;
