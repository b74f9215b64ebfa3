use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broker::reservation::{Reservation, ReservationId, ReservationStatus};
use crate::broker::resource::Resource;
use crate::config::{BrokerConfig, ReleasePolicy};
use crate::error::{BuildfarmError, Result};

/// Work requested from the provisioning backend by a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provision {
    Create,
    Destroy {
        reservation_id: ReservationId,
        resource: Resource,
    },
}

/// Snapshot of the broker's pool, reported to status requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStatus {
    /// Builders held by reservations.
    pub active: Vec<Resource>,
    /// Idle builders in the free pool.
    pub reserve: Vec<Resource>,
    pub destroying: Vec<Resource>,
    /// Builders whose destroy failed; never reused.
    pub abandoned: Vec<Resource>,
    pub pending_reservations: usize,
    /// When the reservation at the head of the queue was made.
    #[serde(default)]
    pub oldest_pending_since: Option<DateTime<Utc>>,
    pub in_flight_creates: usize,
}

/// The matching state machine.
///
/// Every mutating call leaves the state consistent and returns the
/// provisioning work it wants performed; nothing here suspends. The caller
/// dispatches that work and reports completions back through
/// [`create_completed`](Self::create_completed) and
/// [`destroy_completed`](Self::destroy_completed).
#[derive(Debug)]
pub struct ResourceBroker {
    config: BrokerConfig,
    free_pool: BTreeSet<Resource>,
    pending_queue: VecDeque<ReservationId>,
    reservations: HashMap<ReservationId, Reservation>,
    in_flight_creates: usize,
    in_flight_destroys: BTreeSet<Resource>,
    abandoned: BTreeSet<Resource>,
    create_failures: u32,
    provisioning_suspended: bool,
    /// Bumped whenever a builder is created, added or destroyed.
    epoch: u64,
    /// Epoch of each builder's latest membership change, kept until a
    /// listing taken after it has been applied.
    changed_at: HashMap<String, u64>,
}

impl ResourceBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            free_pool: BTreeSet::new(),
            pending_queue: VecDeque::new(),
            reservations: HashMap::new(),
            in_flight_creates: 0,
            in_flight_destroys: BTreeSet::new(),
            abandoned: BTreeSet::new(),
            create_failures: 0,
            provisioning_suspended: false,
            epoch: 0,
            changed_at: HashMap::new(),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Queue a pending reservation behind every earlier one.
    pub fn enter(&mut self, reservation: Reservation) -> Vec<Provision> {
        let id = reservation.id;
        if reservation.status() != ReservationStatus::Pending {
            tracing::warn!(reservation_id = %id, status = %reservation.status(), "Ignoring non-pending reservation");
            return Vec::new();
        }
        if self.reservations.contains_key(&id) {
            tracing::warn!(reservation_id = %id, "Reservation entered twice");
            return Vec::new();
        }

        self.reservations.insert(id, reservation);
        self.pending_queue.push_back(id);
        tracing::info!(
            reservation_id = %id,
            position = self.pending_queue.len(),
            "Reservation entered queue"
        );
        self.tick()
    }

    /// Leave the broker. Safe at any status; unknown ids are reported as an
    /// invariant violation for the caller to log.
    pub fn exit(&mut self, id: ReservationId) -> Result<Vec<Provision>> {
        let reservation = self.reservations.get_mut(&id).ok_or_else(|| {
            BuildfarmError::BrokerInvariant(format!("exit called for unknown reservation {}", id))
        })?;

        match reservation.status() {
            ReservationStatus::Pending => {
                reservation.withdraw();
                self.pending_queue.retain(|pending| *pending != id);
                self.reservations.remove(&id);
                tracing::info!(reservation_id = %id, "Pending reservation withdrawn");
                Ok(Vec::new())
            }
            ReservationStatus::Active => {
                reservation.request_complete();
                tracing::info!(reservation_id = %id, "Reservation complete");
                Ok(self.tick())
            }
            ReservationStatus::RequestComplete | ReservationStatus::Cleanup => {
                tracing::debug!(reservation_id = %id, "Reservation already exiting");
                Ok(Vec::new())
            }
            status @ (ReservationStatus::Finalized | ReservationStatus::Withdrawn) => {
                Err(BuildfarmError::BrokerInvariant(format!(
                    "reservation {} still tracked in terminal status {}",
                    id, status
                )))
            }
        }
    }

    /// A machine is known to be alive and unclaimed.
    pub fn add_resource(&mut self, resource: Resource) -> Vec<Provision> {
        if self.is_known(&resource) {
            tracing::debug!(resource = %resource, "Builder already tracked");
            return Vec::new();
        }
        tracing::info!(resource = %resource, "Builder added to free pool");
        self.record_change(&resource);
        self.free_pool.insert(resource);
        self.tick()
    }

    /// Reconcile with a listing of live machines taken just now.
    pub fn report_resources(&mut self, live: Vec<Resource>) -> Vec<Provision> {
        self.report_listing(self.epoch, live)
    }

    /// Epoch to stamp a backend listing with before it is requested.
    pub fn listing_epoch(&self) -> u64 {
        self.epoch
    }

    /// Reconcile with a listing taken at epoch `listed_at`.
    ///
    /// Unknown machines join the free pool and idle machines the listing no
    /// longer reports are dropped. Held and destroying machines are left
    /// alone, as is any machine created, added or destroyed after the
    /// listing was taken.
    pub fn report_listing(&mut self, listed_at: u64, live: Vec<Resource>) -> Vec<Provision> {
        let live: HashSet<Resource> = live.into_iter().collect();
        let changes = std::mem::take(&mut self.changed_at);
        let changed_since = |resource: &Resource| {
            changes
                .get(&resource.id)
                .is_some_and(|&epoch| epoch > listed_at)
        };

        let vanished: Vec<Resource> = self
            .free_pool
            .iter()
            .filter(|r| !live.contains(*r) && !changed_since(r))
            .cloned()
            .collect();
        for resource in vanished {
            tracing::warn!(resource = %resource, "Idle builder no longer reported by backend");
            self.free_pool.remove(&resource);
        }
        self.abandoned.retain(|r| live.contains(r) || changed_since(r));

        for resource in live {
            if changed_since(&resource) {
                tracing::debug!(resource = %resource, "Skipping builder changed after listing");
            } else if !self.is_known(&resource) {
                tracing::info!(resource = %resource, "Discovered builder");
                self.free_pool.insert(resource);
            }
        }

        self.changed_at = changes
            .into_iter()
            .filter(|(_, epoch)| *epoch > listed_at)
            .collect();
        self.tick()
    }

    fn record_change(&mut self, resource: &Resource) {
        self.epoch += 1;
        self.changed_at.insert(resource.id.clone(), self.epoch);
    }

    /// A create request finished. Always frees its in-flight slot.
    pub fn create_completed(&mut self, result: Result<Resource>) -> Vec<Provision> {
        self.in_flight_creates = self.in_flight_creates.saturating_sub(1);
        match result {
            Ok(resource) => {
                self.create_failures = 0;
                if self.is_known(&resource) {
                    tracing::warn!(resource = %resource, "Backend created a builder that is already tracked");
                } else {
                    tracing::info!(resource = %resource, "Builder created");
                    self.record_change(&resource);
                    self.free_pool.insert(resource);
                }
            }
            Err(e) => {
                self.create_failures += 1;
                self.provisioning_suspended = true;
                tracing::warn!(
                    error = %e,
                    consecutive_failures = self.create_failures,
                    "Builder create failed"
                );
            }
        }
        self.tick()
    }

    /// Lift the suspension applied after a failed create.
    pub fn resume_provisioning(&mut self) -> Vec<Provision> {
        self.provisioning_suspended = false;
        self.tick()
    }

    /// A destroy request finished. A failed destroy abandons the machine.
    pub fn destroy_completed(
        &mut self,
        reservation_id: ReservationId,
        resource: Resource,
        result: Result<()>,
    ) -> Vec<Provision> {
        self.in_flight_destroys.remove(&resource);
        self.record_change(&resource);
        match result {
            Ok(()) => tracing::info!(resource = %resource, "Builder destroyed"),
            Err(e) => {
                tracing::error!(
                    resource = %resource,
                    error = %e,
                    "Builder destroy failed, abandoning it"
                );
                self.abandoned.insert(resource);
            }
        }

        match self.reservations.get_mut(&reservation_id) {
            Some(reservation) => {
                reservation.finalize();
                self.reservations.remove(&reservation_id);
                tracing::debug!(reservation_id = %reservation_id, "Reservation finalized");
            }
            None => {
                tracing::warn!(reservation_id = %reservation_id, "Destroy completed for unknown reservation");
            }
        }
        self.tick()
    }

    /// Match pending reservations to free builders, release completed
    /// reservations, then request new builders for any open slots.
    pub fn tick(&mut self) -> Vec<Provision> {
        let mut actions = Vec::new();
        loop {
            self.assign_free_resources();
            if !self.release_completed(&mut actions) {
                break;
            }
        }

        let creates = self.open_create_slots();
        for _ in 0..creates {
            self.in_flight_creates += 1;
            actions.push(Provision::Create);
        }
        if creates > 0 {
            tracing::debug!(
                requested = creates,
                in_flight_creates = self.in_flight_creates,
                "Requesting new builders"
            );
        }
        actions
    }

    fn assign_free_resources(&mut self) {
        while !self.free_pool.is_empty() {
            let Some(id) = self.pending_queue.pop_front() else {
                break;
            };
            let Some(reservation) = self.reservations.get_mut(&id) else {
                continue;
            };
            if reservation.status() != ReservationStatus::Pending {
                continue;
            }
            // Smallest id first, so assignment is deterministic.
            let Some(resource) = self.free_pool.pop_first() else {
                break;
            };
            tracing::info!(
                reservation_id = %id,
                resource = %resource,
                waited_ms = reservation.waited().num_milliseconds(),
                "Reservation assigned builder"
            );
            reservation.ready(resource);
        }
    }

    /// Returns true if a builder was recycled into the free pool.
    fn release_completed(&mut self, actions: &mut Vec<Provision>) -> bool {
        let completed: Vec<ReservationId> = self
            .reservations
            .values()
            .filter(|r| r.status() == ReservationStatus::RequestComplete)
            .map(|r| r.id)
            .collect();

        let mut recycled = false;
        for id in completed {
            let Some(reservation) = self.reservations.get_mut(&id) else {
                continue;
            };
            let Some(resource) = reservation.begin_cleanup() else {
                continue;
            };
            match self.config.release_policy {
                ReleasePolicy::Destroy => {
                    tracing::info!(reservation_id = %id, resource = %resource, "Destroying builder");
                    self.in_flight_destroys.insert(resource.clone());
                    actions.push(Provision::Destroy {
                        reservation_id: id,
                        resource,
                    });
                }
                ReleasePolicy::Recycle => {
                    reservation.finalize();
                    self.reservations.remove(&id);
                    tracing::info!(reservation_id = %id, resource = %resource, "Builder returned to free pool");
                    self.free_pool.insert(resource);
                    recycled = true;
                }
            }
        }
        recycled
    }

    fn open_create_slots(&self) -> usize {
        if self.provisioning_suspended {
            return 0;
        }
        let available = self.free_pool.len();
        let open_slots = self
            .config
            .max_total_resources
            .saturating_sub(available + self.holding_count() + self.in_flight_creates);
        let open_reserve_slots = self
            .config
            .max_reserve_resources
            .saturating_sub(available + self.in_flight_creates);
        open_slots.min(open_reserve_slots)
    }

    fn is_known(&self, resource: &Resource) -> bool {
        self.free_pool.contains(resource)
            || self.in_flight_destroys.contains(resource)
            || self.abandoned.contains(resource)
            || self
                .reservations
                .values()
                .any(|r| r.resource() == Some(resource))
    }

    fn holding_count(&self) -> usize {
        self.reservations
            .values()
            .filter(|r| r.status().holds_resource())
            .count()
    }

    /// Reservations holding a builder that has not yet been handed to cleanup.
    pub fn active_count(&self) -> usize {
        self.reservations
            .values()
            .filter(|r| {
                matches!(
                    r.status(),
                    ReservationStatus::Active | ReservationStatus::RequestComplete
                )
            })
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.pending_queue.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_pool.len()
    }

    pub fn in_flight_creates(&self) -> usize {
        self.in_flight_creates
    }

    pub fn in_flight_destroy_count(&self) -> usize {
        self.in_flight_destroys.len()
    }

    pub fn abandoned_count(&self) -> usize {
        self.abandoned.len()
    }

    pub fn create_failures(&self) -> u32 {
        self.create_failures
    }

    pub fn is_provisioning_suspended(&self) -> bool {
        self.provisioning_suspended
    }

    pub fn reservation_status(&self, id: &ReservationId) -> Option<ReservationStatus> {
        self.reservations.get(id).map(|r| r.status())
    }

    /// Total counted against `max_total_resources`.
    pub fn accounted_resources(&self) -> usize {
        self.free_pool.len()
            + self.active_count()
            + self.in_flight_creates
            + self.in_flight_destroys.len()
    }

    pub fn status(&self) -> BrokerStatus {
        let mut active: Vec<Resource> = self
            .reservations
            .values()
            .filter(|r| {
                matches!(
                    r.status(),
                    ReservationStatus::Active | ReservationStatus::RequestComplete
                )
            })
            .filter_map(|r| r.resource().cloned())
            .collect();
        active.sort();

        BrokerStatus {
            active,
            reserve: self.free_pool.iter().cloned().collect(),
            destroying: self.in_flight_destroys.iter().cloned().collect(),
            abandoned: self.abandoned.iter().cloned().collect(),
            pending_reservations: self.pending_queue.len(),
            oldest_pending_since: self
                .pending_queue
                .front()
                .and_then(|id| self.reservations.get(id))
                .map(|r| r.created_at),
            in_flight_creates: self.in_flight_creates,
        }
    }

    /// Verify that every builder sits in exactly one place and that
    /// reservations hold a builder exactly when their status says so.
    pub fn check_invariants(&self) -> Result<()> {
        let violation = |msg: String| Err(BuildfarmError::BrokerInvariant(msg));

        let mut seen: HashSet<&Resource> = HashSet::new();
        for resource in self
            .free_pool
            .iter()
            .chain(self.in_flight_destroys.iter())
            .chain(self.abandoned.iter())
        {
            if !seen.insert(resource) {
                return violation(format!("builder {} tracked twice", resource));
            }
        }

        for reservation in self.reservations.values() {
            let status = reservation.status();
            match (status.holds_resource(), reservation.resource()) {
                (true, None) => {
                    return violation(format!(
                        "reservation {} is {} without a builder",
                        reservation.id, status
                    ))
                }
                (false, Some(resource)) => {
                    return violation(format!(
                        "reservation {} is {} but holds {}",
                        reservation.id, status, resource
                    ))
                }
                _ => {}
            }
            if let Some(resource) = reservation.resource() {
                let destroying = status == ReservationStatus::Cleanup
                    && self.in_flight_destroys.contains(resource);
                if !destroying && !seen.insert(resource) {
                    return violation(format!("builder {} held while tracked elsewhere", resource));
                }
            }
        }

        for id in &self.pending_queue {
            match self.reservations.get(id).map(|r| r.status()) {
                Some(ReservationStatus::Pending) => {}
                other => {
                    return violation(format!("queued reservation {} has status {:?}", id, other))
                }
            }
        }
        Ok(())
    }
}
