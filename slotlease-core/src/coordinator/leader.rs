//! Pool leader controller
//!
//! Runs on every process. Whoever holds the pool's leader lease makes sure
//! a member lease exists for every desired slot. Growth only: leases past
//! the desired size are left alone when the pool shrinks.
//!
//! A renewal that fails on a store error does not end leadership while the
//! last renewed lease is still within its TTL; only a lost lease does.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::identity::ProcessIdentity;
use crate::lease::{
    member_lease_name, parse_member_index, LeaseOutcome, LeaseService, MAX_POOL_SLOTS,
};
use crate::metrics::PoolMetrics;
use crate::runtime::{PeriodicTask, TickGuard};

/// Leadership as seen by this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    NotLeader,
    Leader,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Desired slot count after clamping, `None` if unresolved
    pub desired: Option<u32>,
    /// Member leases created in this pass
    pub created: Vec<String>,
    /// Existing leases whose managed fields were brought up to date
    pub updated: Vec<String>,
}

/// Leader election and member-lease sizing for one pool
pub struct PoolLeaderController {
    leases: Arc<LeaseService>,
    identity: ProcessIdentity,
    enabled: bool,
    state: Mutex<LeaderState>,
    /// Expiry of the last successfully renewed leader lease
    valid_until: Mutex<Option<DateTime<Utc>>>,
    running: AtomicBool,
    metrics: Arc<PoolMetrics>,
}

impl PoolLeaderController {
    pub fn new(
        leases: Arc<LeaseService>,
        identity: ProcessIdentity,
        enabled: bool,
        metrics: Arc<PoolMetrics>,
    ) -> Self {
        Self {
            leases,
            identity,
            enabled,
            state: Mutex::new(LeaderState::NotLeader),
            valid_until: Mutex::new(None),
            running: AtomicBool::new(false),
            metrics,
        }
    }

    /// Current leadership state
    pub fn state(&self) -> LeaderState {
        *self.state.lock()
    }

    pub fn is_leader(&self) -> bool {
        self.state() == LeaderState::Leader
    }

    fn lease_still_valid(&self) -> bool {
        let valid_until = *self.valid_until.lock();
        self.is_leader() && valid_until.map_or(false, |deadline| self.leases.now() <= deadline)
    }

    fn transition(&self, next: LeaderState) {
        let previous = std::mem::replace(&mut *self.state.lock(), next);
        if previous == next {
            return;
        }
        match next {
            LeaderState::Leader => {
                info!(
                    "{} became leader of pool '{}'",
                    self.identity.name,
                    self.leases.pool()
                );
                self.metrics.leader_acquired.inc();
                self.metrics.is_leader.set(1);
            }
            LeaderState::NotLeader => {
                info!(
                    "{} is no longer leader of pool '{}'",
                    self.identity.name,
                    self.leases.pool()
                );
                self.metrics.leader_lost.inc();
                self.metrics.is_leader.set(0);
            }
        }
    }

    /// Acquire or renew leadership and, while leader, size the member set
    ///
    /// Returns `None` when another process leads the pool, and when a
    /// failed renewal leaves leadership unconfirmed for this pass.
    pub async fn reconcile(&self) -> Option<ReconcileReport> {
        match self.leases.leader_lease_outcome(&self.identity.name).await {
            LeaseOutcome::Held(lease) => {
                *self.valid_until.lock() = lease.expires_at();
                self.transition(LeaderState::Leader);
            }
            LeaseOutcome::Transient if self.lease_still_valid() => {
                warn!(
                    "{} could not renew the leader lease of pool '{}', still leader until it expires",
                    self.identity.name,
                    self.leases.pool()
                );
                return None;
            }
            LeaseOutcome::Lost | LeaseOutcome::Transient => {
                *self.valid_until.lock() = None;
                self.transition(LeaderState::NotLeader);
                return None;
            }
        }

        let pool = self.leases.pool().to_string();
        let mut report = ReconcileReport::default();

        let Some(mut desired) = self.leases.desired_replicas().await else {
            warn!("Desired size of pool '{}' unknown, skipping member reconcile", pool);
            return Some(report);
        };
        if desired > MAX_POOL_SLOTS {
            warn!(
                "Pool '{}' wants {} members, capping at {}",
                pool, desired, MAX_POOL_SLOTS
            );
            desired = MAX_POOL_SLOTS;
        }
        report.desired = Some(desired);

        let roster = self.leases.list_by_label(false).await;
        let mut present = HashSet::new();
        for lease in &roster {
            let Some(index) = parse_member_index(&pool, &lease.name) else {
                continue;
            };
            present.insert(index);
            if index < desired && !self.leases.member_fields_current(lease) {
                if self.leases.ensure_member_lease(&lease.name).await.is_some() {
                    report.updated.push(lease.name.clone());
                }
            }
        }

        for index in (0..desired).filter(|i| !present.contains(i)) {
            let name = member_lease_name(&pool, index);
            match self.leases.ensure_member_lease(&name).await {
                Some(_) => {
                    debug!("Member lease {} reconciled for pool '{}'", name, pool);
                    self.metrics.member_leases_created.inc();
                    report.created.push(name);
                }
                None => warn!("Failed to reconcile lease {} for pool '{}'", name, pool),
            }
        }

        if !report.created.is_empty() {
            info!(
                "Pool '{}' grown to {} member leases (created {:?})",
                pool,
                present.len() + report.created.len(),
                report.created
            );
        }
        Some(report)
    }

    /// Give up leadership, if held
    pub async fn release(&self) -> bool {
        if !self.is_leader() {
            return false;
        }
        let name = self.leases.leader_lease_name();
        let released = self.leases.release(&name, &self.identity.name).await;
        if released {
            debug!("Lease {} has been released by {}", name, self.identity.name);
        }
        *self.valid_until.lock() = None;
        self.transition(LeaderState::NotLeader);
        released
    }
}

#[async_trait]
impl PeriodicTask for PoolLeaderController {
    fn name(&self) -> String {
        format!("pool-leader-scheduler-{}", self.leases.pool())
    }

    async fn tick(&self) {
        if !self.enabled {
            return;
        }
        let Some(_running) = TickGuard::try_acquire(&self.running) else {
            debug!("Leader reconcile still running, skipping tick");
            return;
        };

        if self.reconcile().await.is_none() {
            debug!(
                "{} did not reconcile pool '{}' this tick",
                self.identity.name,
                self.leases.pool()
            );
        }
    }

    async fn on_shutdown(&self) {
        self.release().await;
    }
}
