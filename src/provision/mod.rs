//! Backends that create and destroy builder machines.
//!
//! The broker never calls a backend directly from its state machine; the
//! broker service dispatches each request onto its own task and feeds the
//! outcome back as a message.

pub mod command;
pub mod static_pool;

pub use command::CommandProvisioner;
pub use static_pool::StaticProvisioner;

use async_trait::async_trait;

use crate::broker::Resource;
use crate::error::Result;

#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Every machine the backend currently considers alive.
    async fn list_active(&self) -> Result<Vec<Resource>>;

    /// Bring one new machine up and return it once it accepts connections.
    async fn create_one(&self) -> Result<Resource>;

    /// Tear down the machine with the given id.
    async fn destroy(&self, id: &str) -> Result<()>;

    /// Whether [`create_one`](Self::create_one) can ever succeed.
    fn can_create(&self) -> bool {
        true
    }
}
