//! Connection handlers for the three roles: queue server, builder agent,
//! and client.

pub mod builder;
pub mod client;
pub mod queue;

pub use builder::{run_session, BuilderServer};
pub use client::{fetch_status, run_build, BuildJob};
pub use queue::{serve_connection, QueueServer};
