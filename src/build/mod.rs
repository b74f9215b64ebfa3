//! Container build backends run on a builder machine.

pub mod backend;
pub mod process;

pub use backend::{BackendKind, BuildBackend, BuildRequest};
pub use process::BuildProcess;
