pub mod broker;
pub mod build;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod heartbeat;
pub mod protocol;
pub mod provision;
pub mod session;
pub mod shutdown;
