use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::broker::resource::Resource;

pub type ReservationId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// Waiting in the queue for a builder.
    Pending,
    /// Holding a builder.
    Active,
    /// The holder is done; the builder may be released.
    RequestComplete,
    /// The builder is being destroyed or returned.
    Cleanup,
    /// The builder is gone; the reservation can be dropped.
    Finalized,
    /// Left the queue before ever receiving a builder.
    Withdrawn,
}

impl ReservationStatus {
    pub fn holds_resource(self) -> bool {
        matches!(
            self,
            ReservationStatus::Active | ReservationStatus::RequestComplete | ReservationStatus::Cleanup
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ReservationStatus::Finalized | ReservationStatus::Withdrawn)
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReservationStatus::Pending => write!(f, "pending"),
            ReservationStatus::Active => write!(f, "active"),
            ReservationStatus::RequestComplete => write!(f, "request_complete"),
            ReservationStatus::Cleanup => write!(f, "cleanup"),
            ReservationStatus::Finalized => write!(f, "finalized"),
            ReservationStatus::Withdrawn => write!(f, "withdrawn"),
        }
    }
}

/// A claim on at most one builder.
///
/// The resource is present exactly while the status holds one; every
/// transition below keeps that true and rejects out-of-order calls.
#[derive(Debug)]
pub struct Reservation {
    pub id: ReservationId,
    pub created_at: DateTime<Utc>,
    status: ReservationStatus,
    resource: Option<Resource>,
    ready_tx: Option<oneshot::Sender<Resource>>,
}

impl Reservation {
    /// Create a pending reservation and the receiver that fires when it is
    /// assigned a builder.
    pub fn new() -> (Self, oneshot::Receiver<Resource>) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let reservation = Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            status: ReservationStatus::Pending,
            resource: None,
            ready_tx: Some(ready_tx),
        };
        (reservation, ready_rx)
    }

    pub fn status(&self) -> ReservationStatus {
        self.status
    }

    pub fn resource(&self) -> Option<&Resource> {
        self.resource.as_ref()
    }

    /// Time since the reservation was made.
    pub fn waited(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }

    /// pending -> active. Delivers the builder to the waiting holder.
    pub fn ready(&mut self, resource: Resource) -> bool {
        if self.status != ReservationStatus::Pending {
            return false;
        }
        self.status = ReservationStatus::Active;
        self.resource = Some(resource.clone());
        if let Some(tx) = self.ready_tx.take() {
            if tx.send(resource).is_err() {
                tracing::debug!(reservation_id = %self.id, "Reservation holder stopped waiting");
            }
        }
        true
    }

    /// active -> request_complete.
    pub fn request_complete(&mut self) -> bool {
        if self.status != ReservationStatus::Active {
            return false;
        }
        self.status = ReservationStatus::RequestComplete;
        true
    }

    /// request_complete -> cleanup. Returns the builder to release.
    pub fn begin_cleanup(&mut self) -> Option<Resource> {
        if self.status != ReservationStatus::RequestComplete {
            return None;
        }
        self.status = ReservationStatus::Cleanup;
        self.resource.clone()
    }

    /// cleanup -> finalized. Gives up the builder.
    pub fn finalize(&mut self) -> Option<Resource> {
        if self.status != ReservationStatus::Cleanup {
            return None;
        }
        self.status = ReservationStatus::Finalized;
        self.resource.take()
    }

    /// pending -> withdrawn.
    pub fn withdraw(&mut self) -> bool {
        if self.status != ReservationStatus::Pending {
            return false;
        }
        self.status = ReservationStatus::Withdrawn;
        self.ready_tx = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> Resource {
        Resource::new("vm-1", "10.0.0.1", "8080")
    }

    #[test]
    fn waited_counts_from_creation() {
        let (mut reservation, _rx) = Reservation::new();
        reservation.created_at = Utc::now() - chrono::Duration::seconds(90);
        assert!(reservation.waited() >= chrono::Duration::seconds(90));
        assert!(reservation.waited() < chrono::Duration::seconds(120));
    }

    #[test]
    fn full_lifecycle_keeps_resource_while_holding() {
        let (mut reservation, mut rx) = Reservation::new();
        assert_eq!(reservation.status(), ReservationStatus::Pending);
        assert!(reservation.resource().is_none());

        assert!(reservation.ready(builder()));
        assert_eq!(rx.try_recv().unwrap(), builder());
        assert_eq!(reservation.status(), ReservationStatus::Active);
        assert!(reservation.resource().is_some());

        assert!(reservation.request_complete());
        assert!(reservation.resource().is_some());

        assert_eq!(reservation.begin_cleanup(), Some(builder()));
        assert_eq!(reservation.status(), ReservationStatus::Cleanup);
        assert!(reservation.resource().is_some());

        assert_eq!(reservation.finalize(), Some(builder()));
        assert_eq!(reservation.status(), ReservationStatus::Finalized);
        assert!(reservation.resource().is_none());
    }

    #[test]
    fn out_of_order_transitions_are_rejected() {
        let (mut reservation, _rx) = Reservation::new();
        assert!(!reservation.request_complete());
        assert!(reservation.begin_cleanup().is_none());
        assert!(reservation.finalize().is_none());

        assert!(reservation.ready(builder()));
        assert!(!reservation.ready(Resource::new("vm-2", "h", "1")));
        assert!(!reservation.withdraw());
        assert_eq!(reservation.resource().unwrap().id, "vm-1");
    }

    #[test]
    fn withdrawn_reservation_never_holds_a_resource() {
        let (mut reservation, mut rx) = Reservation::new();
        assert!(reservation.withdraw());
        assert_eq!(reservation.status(), ReservationStatus::Withdrawn);
        assert!(reservation.status().is_terminal());
        assert!(!reservation.ready(builder()));
        assert!(reservation.resource().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn ready_survives_a_dropped_receiver() {
        let (mut reservation, rx) = Reservation::new();
        drop(rx);
        assert!(reservation.ready(builder()));
        assert_eq!(reservation.status(), ReservationStatus::Active);
    }
}
