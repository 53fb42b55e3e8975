//! Lease operations used by the pool controllers
//!
//! Every mutation goes through the store's atomic create or versioned
//! replace, so a concurrent writer makes the whole operation fail instead
//! of being overwritten. Platform errors are logged and absorbed here: the
//! controllers see `false`/`None` and retry on their next tick. Renewals
//! report a `LeaseOutcome` so callers can tell a lost lease from a failed
//! call.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::record::{
    leader_lease_name, parse_member_index, pool_labels, LabelSelector, Lease, OwnerReference,
};
use super::store::LeaseStore;
use crate::clock::Clock;
use crate::config::PoolConfig;
use crate::error::{Result, SlotLeaseError};
use crate::topology::PoolTopologyResolver;

/// Result of an acquire or renew attempt on one lease
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseOutcome {
    /// The write went through; `holder` holds the returned record
    Held(Lease),
    /// The lease is gone or another holder has it
    Lost,
    /// The store failed or a concurrent write interfered; nothing is known
    /// about the holder and the attempt can be retried
    Transient,
}

impl LeaseOutcome {
    pub fn is_held(&self) -> bool {
        matches!(self, LeaseOutcome::Held(_))
    }

    /// The held record, if any
    pub fn into_lease(self) -> Option<Lease> {
        match self {
            LeaseOutcome::Held(lease) => Some(lease),
            LeaseOutcome::Lost | LeaseOutcome::Transient => None,
        }
    }
}

/// Lease operations scoped to one pool and namespace
pub struct LeaseService {
    store: Arc<dyn LeaseStore>,
    topology: Arc<dyn PoolTopologyResolver>,
    clock: Arc<dyn Clock>,
    namespace: String,
    pool: String,
    leader_ttl: Duration,
    member_ttl: Duration,
    owners: RwLock<Option<Vec<OwnerReference>>>,
}

impl LeaseService {
    /// Create a service for `config.pool_name` in `namespace`
    pub fn new(
        store: Arc<dyn LeaseStore>,
        topology: Arc<dyn PoolTopologyResolver>,
        clock: Arc<dyn Clock>,
        namespace: impl Into<String>,
        config: &PoolConfig,
    ) -> Self {
        Self {
            store,
            topology,
            clock,
            namespace: namespace.into(),
            pool: config.pool_name.clone(),
            leader_ttl: config.leader_lease.ttl,
            member_ttl: config.member_lease.ttl,
            owners: RwLock::new(None),
        }
    }

    /// Pool name
    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Namespace of the pool's leases
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Current time according to the service clock
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Name of this pool's leader lease
    pub fn leader_lease_name(&self) -> String {
        leader_lease_name(&self.pool)
    }

    /// Atomically acquire, renew or take over an expired lease
    ///
    /// Creates the lease held by `holder` if absent. Returns false if a
    /// different holder renewed within the TTL, if a concurrent writer won,
    /// or if the store failed.
    pub async fn try_acquire_or_renew(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        labels: BTreeMap<String, String>,
        owners: Vec<OwnerReference>,
    ) -> bool {
        self.acquire_or_renew_outcome(name, holder, ttl, labels, owners)
            .await
            .is_held()
    }

    /// Same as `try_acquire_or_renew`, telling a lost lease from a failure
    pub async fn acquire_or_renew_outcome(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        labels: BTreeMap<String, String>,
        owners: Vec<OwnerReference>,
    ) -> LeaseOutcome {
        let result = self.acquire_or_renew(name, holder, ttl, labels, owners).await;
        if let Ok(lease) = &result {
            debug!(
                "Lease {} held by {} (version {})",
                lease.name, holder, lease.resource_version
            );
        }
        self.outcome(name, result)
    }

    async fn acquire_or_renew(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        labels: BTreeMap<String, String>,
        owners: Vec<OwnerReference>,
    ) -> Result<Lease> {
        let now = self.clock.now();

        let Some(mut lease) = self.store.get(&self.namespace, name).await? else {
            let mut lease = Lease::new(name, &self.namespace, ttl)
                .with_labels(labels)
                .with_owners(owners);
            lease.claim(holder, now);
            debug!("Creating lease {} held by {}", name, holder);
            return self.store.create(lease).await;
        };

        if !lease.is_available_to(holder, now) {
            return Err(SlotLeaseError::LostRace {
                name: name.to_string(),
                holder: lease.holder().unwrap_or_default().to_string(),
            });
        }

        let previous = lease.holder().map(str::to_owned);
        lease.claim(holder, now);
        lease.ttl = ttl;
        lease.labels.extend(labels);
        if lease.owner_references.is_empty() {
            lease.owner_references = owners;
        }

        let stored = self.store.replace(lease).await?;
        if let Some(previous) = previous.filter(|p| p != holder) {
            info!("Lease {} taken over from {} by {}", name, previous, holder);
        }
        Ok(stored)
    }

    /// Acquire or renew this pool's leader lease for `holder`
    pub async fn try_acquire_leader_lease(&self, holder: &str) -> bool {
        self.leader_lease_outcome(holder).await.is_held()
    }

    /// Acquire or renew the leader lease, reporting why it is not held
    pub async fn leader_lease_outcome(&self, holder: &str) -> LeaseOutcome {
        let owners = self.owner_references().await;
        self.acquire_or_renew_outcome(
            &self.leader_lease_name(),
            holder,
            self.leader_ttl,
            pool_labels(&self.pool, true),
            owners,
        )
        .await
    }

    /// Make sure an unclaimed-or-claimed member lease `name` exists
    ///
    /// Creates it unclaimed if absent. An existing lease keeps its holder;
    /// only its labels and TTL are brought in line with the configuration,
    /// and nothing is written when they already match.
    pub async fn ensure_member_lease(&self, name: &str) -> Option<Lease> {
        match self.ensure_member_lease_inner(name).await {
            Ok(lease) => Some(lease),
            Err(e) => {
                self.absorb(name, &e);
                None
            }
        }
    }

    async fn ensure_member_lease_inner(&self, name: &str) -> Result<Lease> {
        let labels = pool_labels(&self.pool, false);

        let existing = match self.store.get(&self.namespace, name).await? {
            Some(existing) => existing,
            None => {
                let lease = Lease::new(name, &self.namespace, self.member_ttl)
                    .with_labels(labels)
                    .with_owners(self.owner_references().await);
                debug!("Creating member lease {} in {}", name, self.namespace);
                return match self.store.create(lease).await {
                    Err(SlotLeaseError::Conflict { .. }) => self.get_required(name).await,
                    other => other,
                };
            }
        };

        let mut merged = existing.labels.clone();
        merged.extend(labels);
        if merged == existing.labels && existing.ttl == self.member_ttl {
            return Ok(existing);
        }

        debug!("Reconciling managed fields of lease {}", name);
        let mut updated = existing;
        updated.labels = merged;
        updated.ttl = self.member_ttl;
        match self.store.replace(updated).await {
            Err(SlotLeaseError::Conflict { .. }) => self.get_required(name).await,
            other => other,
        }
    }

    async fn get_required(&self, name: &str) -> Result<Lease> {
        self.store
            .get(&self.namespace, name)
            .await?
            .ok_or_else(|| SlotLeaseError::LeaseNotFound {
                name: name.to_string(),
            })
    }

    /// Check whether a member lease already carries the managed labels and TTL
    pub fn member_fields_current(&self, lease: &Lease) -> bool {
        lease.ttl == self.member_ttl
            && pool_labels(&self.pool, false)
                .iter()
                .all(|(k, v)| lease.labels.get(k) == Some(v))
    }

    /// Renew an existing lease for `holder`
    ///
    /// Never creates the lease. `Lost` when it does not exist or another
    /// holder has it; `Transient` when the store failed or a concurrent
    /// write got in first.
    pub async fn renew(&self, name: &str, holder: &str) -> LeaseOutcome {
        let result = match self.store.get(&self.namespace, name).await {
            Ok(Some(lease)) => self.claim_existing(lease, holder).await,
            Ok(None) => Err(SlotLeaseError::LeaseNotFound {
                name: name.to_string(),
            }),
            Err(e) => Err(e),
        };
        self.outcome(name, result)
    }

    async fn claim_existing(&self, mut lease: Lease, holder: &str) -> Result<Lease> {
        let now = self.clock.now();
        if !lease.is_available_to(holder, now) {
            return Err(SlotLeaseError::LostRace {
                holder: lease.holder().unwrap_or_default().to_string(),
                name: lease.name,
            });
        }
        lease.claim(holder, now);
        self.store.replace(lease).await
    }

    /// Claim one member slot of this pool for `holder`
    ///
    /// A lease already held by `holder` is renewed first. Otherwise the
    /// roster is scanned in ascending slot order and the first available
    /// lease is taken; a lost race moves on to the next candidate.
    pub async fn try_acquire_member_lease(&self, holder: &str) -> Option<Lease> {
        let mut roster = self.list_by_label(false).await;
        roster.retain(|l| parse_member_index(&self.pool, &l.name).is_some());
        if roster.is_empty() {
            debug!("No member leases in pool {} yet", self.pool);
            return None;
        }

        for lease in roster.iter().filter(|l| l.is_held_by(holder)) {
            match self.claim_existing(lease.clone(), holder).await {
                Ok(renewed) => return Some(renewed),
                Err(e) => self.absorb(&lease.name, &e),
            }
        }

        let now = self.clock.now();
        for lease in roster.into_iter().filter(|l| l.is_available_to(holder, now)) {
            let name = lease.name.clone();
            match self.claim_existing(lease, holder).await {
                Ok(claimed) => return Some(claimed),
                Err(e) => self.absorb(&name, &e),
            }
        }

        None
    }

    /// Release `name` if `holder` holds it
    ///
    /// An absent lease, or one held by someone else, counts as released.
    pub async fn release(&self, name: &str, holder: &str) -> bool {
        match self.release_inner(name, holder).await {
            Ok(()) => true,
            Err(e) => {
                self.absorb(name, &e);
                false
            }
        }
    }

    async fn release_inner(&self, name: &str, holder: &str) -> Result<()> {
        let Some(mut lease) = self.store.get(&self.namespace, name).await? else {
            return Ok(());
        };
        if !lease.is_held_by(holder) {
            return Ok(());
        }
        lease.vacate();
        self.store.replace(lease).await?;
        Ok(())
    }

    /// Leases of this pool with the given role, ordered by slot index
    pub async fn list_by_label(&self, is_leader: bool) -> Vec<Lease> {
        let selector = LabelSelector::pool(&self.pool, is_leader);
        match self.store.list(&self.namespace, &selector).await {
            Ok(mut leases) => {
                leases.sort_by(|a, b| {
                    let ia = parse_member_index(&self.pool, &a.name).unwrap_or(u32::MAX);
                    let ib = parse_member_index(&self.pool, &b.name).unwrap_or(u32::MAX);
                    ia.cmp(&ib).then_with(|| a.name.cmp(&b.name))
                });
                leases
            }
            Err(e) => {
                warn!("Failed to list leases matching {}: {}", selector, e);
                Vec::new()
            }
        }
    }

    /// Plain read of one lease
    pub async fn get(&self, name: &str) -> Option<Lease> {
        match self.store.get(&self.namespace, name).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!("Failed to read lease {}: {}", name, e);
                None
            }
        }
    }

    /// Desired pool size, `None` if it cannot be resolved right now
    pub async fn desired_replicas(&self) -> Option<u32> {
        match self.topology.desired_replicas().await {
            Ok(replicas) => replicas,
            Err(e) => {
                warn!("Failed to resolve desired replicas for pool {}: {}", self.pool, e);
                None
            }
        }
    }

    /// Desired pool size, required to be known
    ///
    /// Fails with a configuration error when the topology cannot answer.
    /// Checked once at startup by processes that may lead the pool.
    pub async fn resolve_desired_replicas(&self) -> Result<u32> {
        let unresolved = |detail: String| SlotLeaseError::Configuration {
            reason: format!(
                "replica count of pool '{}' cannot be resolved{}",
                self.pool, detail
            ),
        };
        match self.topology.desired_replicas().await {
            Ok(Some(replicas)) => Ok(replicas),
            Ok(None) => Err(unresolved(String::new())),
            Err(e) => Err(unresolved(format!(": {}", e))),
        }
    }

    /// Owner references for new leases, cached once resolved
    async fn owner_references(&self) -> Vec<OwnerReference> {
        let cached = self.owners.read().clone();
        if let Some(owners) = cached {
            return owners;
        }
        match self.topology.owner_references().await {
            Ok(owners) => {
                *self.owners.write() = Some(owners.clone());
                owners
            }
            Err(e) => {
                warn!("Creating ownerless leases, owner unresolved: {}", e);
                Vec::new()
            }
        }
    }

    fn outcome(&self, name: &str, result: Result<Lease>) -> LeaseOutcome {
        match result {
            Ok(lease) => LeaseOutcome::Held(lease),
            Err(SlotLeaseError::LeaseNotFound { .. }) => {
                debug!("Lease {} does not exist", name);
                LeaseOutcome::Lost
            }
            Err(e @ SlotLeaseError::LostRace { .. }) => {
                self.absorb(name, &e);
                LeaseOutcome::Lost
            }
            Err(e) => {
                self.absorb(name, &e);
                LeaseOutcome::Transient
            }
        }
    }

    fn absorb(&self, name: &str, error: &SlotLeaseError) {
        if error.is_lost_race() {
            debug!("Lost race on lease {}: {}", name, error);
        } else {
            warn!("Lease operation on {} failed: {}", name, error);
        }
    }
}
