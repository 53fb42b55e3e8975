//! Pool member controller
//!
//! Runs on every process, leader included. Claims exactly one member slot
//! and keeps renewing it. Once a slot has been granted the process is
//! pinned to that index: after a lost renewal only the same slot is
//! reclaimed, so its identity is never swapped for another index.
//!
//! A renewal that fails on a store error keeps the slot until the last
//! successful renewal expires. Only a lease that is gone, held by someone
//! else, or expired without renewal counts as lost.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::gate::{GrantedSlot, MemberLeaseCoordinator, SlotEvent, SlotEventKind};
use crate::identity::ProcessIdentity;
use crate::lease::{member_lease_name, parse_member_index, Lease, LeaseOutcome, LeaseService};
use crate::metrics::PoolMetrics;
use crate::runtime::{PeriodicTask, TickGuard};

/// Slot claiming for one process in one pool
pub struct PoolMemberController {
    leases: Arc<LeaseService>,
    identity: ProcessIdentity,
    coordinator: Arc<MemberLeaseCoordinator>,
    enabled: bool,
    held: Mutex<Option<GrantedSlot>>,
    /// Expiry of the last successfully renewed member lease
    valid_until: Mutex<Option<DateTime<Utc>>>,
    pinned: Mutex<Option<u32>>,
    running: AtomicBool,
    metrics: Arc<PoolMetrics>,
}

impl PoolMemberController {
    pub fn new(
        leases: Arc<LeaseService>,
        identity: ProcessIdentity,
        coordinator: Arc<MemberLeaseCoordinator>,
        enabled: bool,
        metrics: Arc<PoolMetrics>,
    ) -> Self {
        Self {
            leases,
            identity,
            coordinator,
            enabled,
            held: Mutex::new(None),
            valid_until: Mutex::new(None),
            pinned: Mutex::new(None),
            running: AtomicBool::new(false),
            metrics,
        }
    }

    /// Slot currently held
    pub fn held(&self) -> Option<GrantedSlot> {
        self.held.lock().clone()
    }

    pub fn has_lease(&self) -> bool {
        self.held.lock().is_some()
    }

    fn slot_for(&self, lease: &Lease) -> Option<GrantedSlot> {
        let index = parse_member_index(self.leases.pool(), &lease.name)?;
        Some(GrantedSlot {
            pool: self.leases.pool().to_string(),
            index,
            lease_name: lease.name.clone(),
            holder: self.identity.name.clone(),
        })
    }

    fn publish(&self, kind: SlotEventKind, slot: GrantedSlot) {
        self.coordinator.on_event(SlotEvent { kind, slot });
    }

    fn lease_still_valid(&self) -> bool {
        let valid_until = *self.valid_until.lock();
        valid_until.map_or(false, |deadline| self.leases.now() <= deadline)
    }

    fn record_lost(&self, slot: GrantedSlot) {
        warn!("{} lost member lease {}", self.identity.name, slot.lease_name);
        *self.held.lock() = None;
        *self.valid_until.lock() = None;
        self.metrics.slots_lost.inc();
        self.metrics.granted_slot.set(-1);
        self.publish(SlotEventKind::Lost, slot);
    }

    fn record_acquired(&self, slot: GrantedSlot) {
        info!(
            "{} claimed member slot {} of pool '{}'",
            self.identity.name,
            slot.index,
            self.leases.pool()
        );
        *self.held.lock() = Some(slot.clone());
        *self.pinned.lock() = Some(slot.index);
        self.metrics.slots_claimed.inc();
        self.metrics.granted_slot.set(i64::from(slot.index));
        self.publish(SlotEventKind::Acquired, slot);
    }

    /// One claim-or-renew pass; true while a slot is held afterwards
    pub async fn acquire_lease(&self) -> bool {
        let holder = self.identity.name.clone();

        let held = self.held();
        if let Some(slot) = held {
            match self.leases.renew(&slot.lease_name, &holder).await {
                LeaseOutcome::Held(lease) => {
                    debug!("Renewed member lease {} for {}", slot.lease_name, holder);
                    *self.valid_until.lock() = lease.expires_at();
                    return true;
                }
                LeaseOutcome::Transient => {
                    self.metrics.renew_failures.inc();
                    if self.lease_still_valid() {
                        warn!(
                            "{} could not renew member lease {}, keeping it until it expires",
                            holder, slot.lease_name
                        );
                        return true;
                    }
                    self.record_lost(slot);
                    return false;
                }
                LeaseOutcome::Lost => {
                    self.metrics.renew_failures.inc();
                    self.record_lost(slot);
                    return false;
                }
            }
        }

        let pinned = *self.pinned.lock();
        let claimed = match pinned {
            Some(index) => {
                let name = member_lease_name(self.leases.pool(), index);
                self.leases.renew(&name, &holder).await.into_lease()
            }
            None => self.leases.try_acquire_member_lease(&holder).await,
        };

        let granted = claimed.and_then(|lease| Some((self.slot_for(&lease)?, lease)));
        match granted {
            Some((slot, lease)) => {
                *self.valid_until.lock() = lease.expires_at();
                self.record_acquired(slot);
                true
            }
            None => {
                debug!(
                    "No member slot available for {} in pool '{}' yet",
                    holder,
                    self.leases.pool()
                );
                false
            }
        }
    }

    /// Release the held slot, if any
    pub async fn release(&self) -> bool {
        let Some(slot) = self.held.lock().take() else {
            return false;
        };
        *self.valid_until.lock() = None;
        let released = self.leases.release(&slot.lease_name, &self.identity.name).await;
        if released {
            debug!(
                "Lease {} has been released by {}",
                slot.lease_name, self.identity.name
            );
        }
        self.metrics.granted_slot.set(-1);
        self.publish(SlotEventKind::Released, slot);
        released
    }
}

#[async_trait]
impl PeriodicTask for PoolMemberController {
    fn name(&self) -> String {
        format!("pool-member-scheduler-{}", self.leases.pool())
    }

    async fn tick(&self) {
        if !self.enabled {
            return;
        }
        let Some(_running) = TickGuard::try_acquire(&self.running) else {
            return;
        };
        self.acquire_lease().await;
    }

    async fn on_shutdown(&self) {
        self.release().await;
    }
}
