//! The resource broker: a FIFO queue of reservations matched against a pool
//! of builder machines, kept within total and reserve bounds.

pub mod backoff;
pub mod handle;
pub mod reservation;
pub mod resource;
pub mod service;
pub mod state;

pub use handle::{BrokerHandle, ReservationHandle};
pub use reservation::{Reservation, ReservationId, ReservationStatus};
pub use resource::Resource;
pub use service::{BrokerMessage, BrokerService};
pub use state::{BrokerStatus, Provision, ResourceBroker};
