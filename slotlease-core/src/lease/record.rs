//! Lease records, naming and labels
//!
//! Lease names and labels are part of the interoperability contract between
//! processes of the same pool and must stay bit-exact.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Label carrying the pool name
pub const POOL_NAME_LABEL: &str = "pool-name";

/// Label distinguishing the leader lease from member leases
pub const POOL_IS_LEADER_LABEL: &str = "pool-is-leader";

/// Labels stamped on every lease this crate creates
pub const BASE_LABELS: [(&str, &str); 2] = [
    ("app.kubernetes.io/managed-by", "slotlease"),
    ("app.kubernetes.io/component", "pool"),
];

/// Highest number of member slots a pool can address with 2-digit names
pub const MAX_POOL_SLOTS: u32 = 100;

const LEADER_PREFIX: &str = "pool-leader-";
const MEMBER_PREFIX: &str = "pool-member-";

/// Name of a pool's leader lease
pub fn leader_lease_name(pool: &str) -> String {
    format!("{}{}", LEADER_PREFIX, pool)
}

/// Name of a pool's member lease for slot `index`
pub fn member_lease_name(pool: &str, index: u32) -> String {
    format!("{}{}-{:02}", MEMBER_PREFIX, pool, index)
}

/// Extract the slot index from a member lease name of `pool`
pub fn parse_member_index(pool: &str, name: &str) -> Option<u32> {
    let suffix = name.strip_prefix(MEMBER_PREFIX)?.strip_prefix(pool)?.strip_prefix('-')?;
    if suffix.len() != 2 || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Labels for a pool lease, base labels included
pub fn pool_labels(pool: &str, is_leader: bool) -> BTreeMap<String, String> {
    let mut labels: BTreeMap<String, String> = BASE_LABELS
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    labels.insert(POOL_NAME_LABEL.into(), pool.into());
    labels.insert(POOL_IS_LEADER_LABEL.into(), is_leader.to_string());
    labels
}

/// Reference to the deployment unit owning a lease
///
/// When the owner is deleted the platform garbage-collects every lease
/// pointing at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    pub controller: bool,
}

/// Equality-based label selector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Empty selector matching everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key=value`
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    /// Selector for a pool's leases of one role
    pub fn pool(pool: &str, is_leader: bool) -> Self {
        Self::new()
            .with(POOL_NAME_LABEL, pool)
            .with(POOL_IS_LEADER_LABEL, is_leader.to_string())
    }

    /// Check a label set against this selector
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

/// A named, TTL'd ownership record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub namespace: String,
    /// Current holder, `None` when unclaimed
    pub holder: Option<String>,
    /// Time after the last renewal at which the lease is considered abandoned
    pub ttl: Duration,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    /// Number of holder changes between distinct non-empty holders
    pub transitions: u32,
    pub labels: BTreeMap<String, String>,
    pub owner_references: Vec<OwnerReference>,
    /// Fencing token maintained by the store; 0 for records never written
    pub resource_version: u64,
}

impl Lease {
    /// New unclaimed lease
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            holder: None,
            ttl,
            acquire_time: None,
            renew_time: None,
            transitions: 0,
            labels: BTreeMap::new(),
            owner_references: Vec::new(),
            resource_version: 0,
        }
    }

    /// Set labels
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Set owner references
    pub fn with_owners(mut self, owners: Vec<OwnerReference>) -> Self {
        self.owner_references = owners;
        self
    }

    /// Holder identity, treating blank as unclaimed
    pub fn holder(&self) -> Option<&str> {
        self.holder.as_deref().filter(|h| !h.trim().is_empty())
    }

    /// Check if `holder` currently holds this lease (expiry not considered)
    pub fn is_held_by(&self, holder: &str) -> bool {
        self.holder() == Some(holder)
    }

    /// Last instant at which the current holder's claim is still valid
    ///
    /// `None` when never renewed or when the deadline is unrepresentable.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let renewed = self.renew_time?;
        ChronoDuration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| renewed.checked_add_signed(ttl))
    }

    /// Check whether the holder failed to renew within the TTL
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.renew_time {
            // an unrepresentable deadline never expires
            Some(_) => self.expires_at().map_or(false, |deadline| deadline < now),
            None => true,
        }
    }

    /// Check whether `holder` may acquire or renew this lease at `now`
    pub fn is_available_to(&self, holder: &str, now: DateTime<Utc>) -> bool {
        match self.holder() {
            None => true,
            Some(current) if current == holder => true,
            Some(_) => self.is_expired(now),
        }
    }

    /// Take or refresh ownership for `holder` at `now`
    pub fn claim(&mut self, holder: &str, now: DateTime<Utc>) {
        let previous = self.holder().map(str::to_owned);
        match previous.as_deref() {
            Some(prev) if prev == holder => {}
            Some(_) => {
                self.transitions += 1;
                self.acquire_time = Some(now);
            }
            None => self.acquire_time = Some(now),
        }
        self.holder = Some(holder.to_string());
        self.renew_time = Some(now);
    }

    /// Drop ownership
    pub fn vacate(&mut self) {
        self.holder = None;
        self.renew_time = None;
    }
}
