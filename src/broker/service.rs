use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::backoff::create_backoff;
use crate::broker::handle::BrokerHandle;
use crate::broker::reservation::{Reservation, ReservationId};
use crate::broker::resource::Resource;
use crate::broker::state::{BrokerStatus, Provision, ResourceBroker};
use crate::config::BrokerConfig;
use crate::error::{BuildfarmError, Result};
use crate::provision::ProvisioningBackend;

/// Message types for the broker event loop
#[derive(Debug)]
pub enum BrokerMessage {
    /// Queue a new pending reservation
    Enter { reservation: Reservation },
    /// A holder is done with its reservation
    Exit { reservation_id: ReservationId },
    /// A machine is known to be alive and unclaimed
    AddResource { resource: Resource },
    /// Full list of live machines from the backend. `listed_at` is the
    /// broker epoch when the listing was requested; `None` means now.
    ReportResources {
        resources: Vec<Resource>,
        listed_at: Option<u64>,
    },
    CreateCompleted { result: Result<Resource> },
    DestroyCompleted {
        reservation_id: ReservationId,
        resource: Resource,
        result: Result<()>,
    },
    /// Create backoff elapsed
    ResumeProvisioning,
    Status {
        response_tx: oneshot::Sender<BrokerStatus>,
    },
}

/// Owns the [`ResourceBroker`] and serializes every mutation through one
/// message loop. Provisioning calls run on their own tasks and report back
/// as messages, so the loop never waits on a backend.
pub struct BrokerService {
    broker: ResourceBroker,
    backend: Arc<dyn ProvisioningBackend>,
    message_tx: mpsc::UnboundedSender<BrokerMessage>,
    message_rx: mpsc::UnboundedReceiver<BrokerMessage>,
    resume_scheduled: bool,
    reconcile_task: Option<JoinHandle<()>>,
}

impl BrokerService {
    /// A backend that cannot create machines gets no reserve target, so the
    /// broker only hands out the builders it adopts.
    pub fn new(config: BrokerConfig, backend: Arc<dyn ProvisioningBackend>) -> (Self, BrokerHandle) {
        let config = if backend.can_create() || config.max_reserve_resources == 0 {
            config
        } else {
            tracing::info!(
                max_reserve = config.max_reserve_resources,
                "Backend cannot create builders, disabling the reserve target"
            );
            BrokerConfig {
                max_reserve_resources: 0,
                ..config
            }
        };
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let handle = BrokerHandle::new(message_tx.clone());
        let service = Self {
            broker: ResourceBroker::new(config),
            backend,
            message_tx,
            message_rx,
            resume_scheduled: false,
            reconcile_task: None,
        };
        (service, handle)
    }

    /// Start the service on its own task.
    pub fn spawn(
        config: BrokerConfig,
        backend: Arc<dyn ProvisioningBackend>,
        shutdown: CancellationToken,
    ) -> (BrokerHandle, JoinHandle<()>) {
        let (service, handle) = Self::new(config, backend);
        let task = tokio::spawn(service.run(shutdown));
        (handle, task)
    }

    /// Run the broker main loop until `shutdown` is cancelled.
    ///
    /// On startup the backend's live machines are listed before the first
    /// tick, so existing builders are adopted instead of duplicated.
    pub async fn run(mut self, shutdown: CancellationToken) {
        match self.backend.list_active().await {
            Ok(resources) => {
                tracing::info!(count = resources.len(), "Adopting live builders");
                let actions = self.broker.report_resources(resources);
                self.dispatch(actions);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Initial builder listing failed");
                let actions = self.broker.tick();
                self.dispatch(actions);
            }
        }

        let reconcile_interval = self.broker.config().reconcile_interval_ms;
        let mut reconcile = tokio::time::interval(Duration::from_millis(
            reconcile_interval.unwrap_or(3_600_000).max(1),
        ));
        reconcile.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately and startup already listed.
        reconcile.tick().await;

        loop {
            tokio::select! {
                Some(msg) = self.message_rx.recv() => {
                    self.handle_message(msg);
                }

                _ = reconcile.tick(), if reconcile_interval.is_some() => {
                    self.spawn_reconcile();
                }

                _ = shutdown.cancelled() => {
                    tracing::info!(
                        pending = self.broker.pending_count(),
                        active = self.broker.active_count(),
                        "Broker shutting down"
                    );
                    break;
                }
            }
        }

        if let Some(task) = self.reconcile_task.take() {
            task.abort();
        }
    }

    fn handle_message(&mut self, msg: BrokerMessage) {
        let actions = match msg {
            BrokerMessage::Enter { reservation } => self.broker.enter(reservation),
            BrokerMessage::Exit { reservation_id } => match self.broker.exit(reservation_id) {
                Ok(actions) => actions,
                Err(e) => {
                    tracing::warn!(reservation_id = %reservation_id, error = %e, "Ignoring exit");
                    Vec::new()
                }
            },
            BrokerMessage::AddResource { resource } => self.broker.add_resource(resource),
            BrokerMessage::ReportResources {
                resources,
                listed_at,
            } => match listed_at {
                Some(epoch) => self.broker.report_listing(epoch, resources),
                None => self.broker.report_resources(resources),
            },
            BrokerMessage::CreateCompleted { result } => {
                let failed = result.is_err();
                let actions = self.broker.create_completed(result);
                if failed {
                    self.schedule_resume();
                }
                actions
            }
            BrokerMessage::DestroyCompleted {
                reservation_id,
                resource,
                result,
            } => self
                .broker
                .destroy_completed(reservation_id, resource, result),
            BrokerMessage::ResumeProvisioning => {
                self.resume_scheduled = false;
                self.broker.resume_provisioning()
            }
            BrokerMessage::Status { response_tx } => {
                let _ = response_tx.send(self.broker.status());
                Vec::new()
            }
        };

        if cfg!(debug_assertions) {
            if let Err(e) = self.broker.check_invariants() {
                tracing::error!(error = %e, "Broker state is inconsistent");
            }
        }
        self.dispatch(actions);
    }

    fn dispatch(&self, actions: Vec<Provision>) {
        for action in actions {
            match action {
                Provision::Create => self.spawn_create(),
                Provision::Destroy {
                    reservation_id,
                    resource,
                } => self.spawn_destroy(reservation_id, resource),
            }
        }
    }

    fn spawn_create(&self) {
        let backend = self.backend.clone();
        let guard = CreateGuard::new(self.message_tx.clone());
        let create_timeout = Duration::from_millis(self.broker.config().create_timeout_ms);

        tokio::spawn(async move {
            let result = match tokio::time::timeout(create_timeout, backend.create_one()).await {
                Ok(result) => result,
                Err(_) => Err(BuildfarmError::Provisioning(format!(
                    "create did not finish within {}ms",
                    create_timeout.as_millis()
                ))),
            };
            guard.complete(result);
        });
    }

    fn spawn_destroy(&self, reservation_id: ReservationId, resource: Resource) {
        let backend = self.backend.clone();
        let message_tx = self.message_tx.clone();

        tokio::spawn(async move {
            let result = backend.destroy(&resource.id).await;
            let _ = message_tx.send(BrokerMessage::DestroyCompleted {
                reservation_id,
                resource,
                result,
            });
        });
    }

    fn schedule_resume(&mut self) {
        if self.resume_scheduled {
            return;
        }
        self.resume_scheduled = true;

        let config = self.broker.config();
        let delay = create_backoff(
            self.broker.create_failures(),
            config.create_backoff_base_ms,
            config.create_backoff_max_ms,
        );
        tracing::info!(
            delay_ms = delay.as_millis() as u64,
            consecutive_failures = self.broker.create_failures(),
            "Provisioning suspended"
        );

        let message_tx = self.message_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = message_tx.send(BrokerMessage::ResumeProvisioning);
        });
    }

    fn spawn_reconcile(&mut self) {
        if let Some(task) = &self.reconcile_task {
            if !task.is_finished() {
                tracing::debug!("Previous reconcile still running");
                return;
            }
        }

        let backend = self.backend.clone();
        let message_tx = self.message_tx.clone();
        let listed_at = self.broker.listing_epoch();
        self.reconcile_task = Some(tokio::spawn(async move {
            match backend.list_active().await {
                Ok(resources) => {
                    let _ = message_tx.send(BrokerMessage::ReportResources {
                        resources,
                        listed_at: Some(listed_at),
                    });
                }
                Err(e) => tracing::warn!(error = %e, "Builder listing failed"),
            }
        }));
    }
}

/// Reports a create outcome exactly once, even if the create task is
/// cancelled or panics before finishing.
struct CreateGuard {
    message_tx: mpsc::UnboundedSender<BrokerMessage>,
    reported: bool,
}

impl CreateGuard {
    fn new(message_tx: mpsc::UnboundedSender<BrokerMessage>) -> Self {
        Self {
            message_tx,
            reported: false,
        }
    }

    fn complete(mut self, result: Result<Resource>) {
        self.reported = true;
        let _ = self
            .message_tx
            .send(BrokerMessage::CreateCompleted { result });
    }
}

impl Drop for CreateGuard {
    fn drop(&mut self) {
        if !self.reported {
            let _ = self.message_tx.send(BrokerMessage::CreateCompleted {
                result: Err(BuildfarmError::Provisioning(
                    "create task ended without a result".to_string(),
                )),
            });
        }
    }
}
