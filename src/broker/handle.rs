use tokio::sync::{mpsc, oneshot};

use crate::broker::reservation::{Reservation, ReservationId};
use crate::broker::resource::Resource;
use crate::broker::service::BrokerMessage;
use crate::broker::state::BrokerStatus;
use crate::error::{BuildfarmError, Result};

/// Cloneable entry point to a running [`BrokerService`](crate::broker::BrokerService).
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    message_tx: mpsc::UnboundedSender<BrokerMessage>,
}

impl BrokerHandle {
    pub(crate) fn new(message_tx: mpsc::UnboundedSender<BrokerMessage>) -> Self {
        Self { message_tx }
    }

    fn send(&self, msg: BrokerMessage) -> Result<()> {
        self.message_tx
            .send(msg)
            .map_err(|_| BuildfarmError::BrokerStopped)
    }

    /// Join the queue. The reservation leaves the broker when the returned
    /// handle is released or dropped.
    pub fn reserve(&self) -> Result<ReservationHandle> {
        let (reservation, ready_rx) = Reservation::new();
        let id = reservation.id;
        self.send(BrokerMessage::Enter { reservation })?;
        Ok(ReservationHandle {
            id,
            broker: self.clone(),
            ready_rx: Some(ready_rx),
            resource: None,
            exited: false,
        })
    }

    pub fn add_resource(&self, resource: Resource) -> Result<()> {
        self.send(BrokerMessage::AddResource { resource })
    }

    pub fn report_resources(&self, resources: Vec<Resource>) -> Result<()> {
        self.send(BrokerMessage::ReportResources {
            resources,
            listed_at: None,
        })
    }

    pub async fn status(&self) -> Result<BrokerStatus> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(BrokerMessage::Status { response_tx })?;
        response_rx.await.map_err(|_| BuildfarmError::BrokerStopped)
    }

    fn exit(&self, reservation_id: ReservationId) {
        if self
            .send(BrokerMessage::Exit { reservation_id })
            .is_err()
        {
            tracing::debug!(reservation_id = %reservation_id, "Broker gone before reservation exit");
        }
    }
}

/// A holder's claim on a queued or assigned builder.
///
/// Dropping the handle exits the reservation: a pending one is withdrawn and
/// an active one releases its builder.
#[derive(Debug)]
pub struct ReservationHandle {
    id: ReservationId,
    broker: BrokerHandle,
    ready_rx: Option<oneshot::Receiver<Resource>>,
    resource: Option<Resource>,
    exited: bool,
}

impl ReservationHandle {
    pub fn id(&self) -> ReservationId {
        self.id
    }

    /// The assigned builder, if [`wait_ready`](Self::wait_ready) has returned.
    pub fn resource(&self) -> Option<&Resource> {
        self.resource.as_ref()
    }

    /// Wait until a builder is assigned. Returns immediately if one already was.
    pub async fn wait_ready(&mut self) -> Result<Resource> {
        if let Some(resource) = &self.resource {
            return Ok(resource.clone());
        }
        let Some(rx) = self.ready_rx.as_mut() else {
            return Err(BuildfarmError::BrokerStopped);
        };

        let received = match rx.try_recv() {
            Ok(resource) => Ok(resource),
            Err(oneshot::error::TryRecvError::Empty) => rx.await.map_err(|_| ()),
            Err(oneshot::error::TryRecvError::Closed) => Err(()),
        };
        self.ready_rx = None;

        match received {
            Ok(resource) => {
                self.resource = Some(resource.clone());
                Ok(resource)
            }
            Err(()) => Err(BuildfarmError::BrokerStopped),
        }
    }

    /// Exit the reservation now.
    pub fn release(mut self) {
        self.exit();
    }

    fn exit(&mut self) {
        if !self.exited {
            self.exited = true;
            self.broker.exit(self.id);
        }
    }
}

impl Drop for ReservationHandle {
    fn drop(&mut self) {
        self.exit();
    }
}
