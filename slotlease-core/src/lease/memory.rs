//! In-memory lease store
//!
//! Reference `LeaseStore` with the same write semantics as the platform
//! store: versioned compare-and-swap, label selection and owner-reference
//! garbage collection. Used by tests and the simulator.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use super::record::{LabelSelector, Lease};
use super::store::LeaseStore;
use crate::error::{Result, SlotLeaseError};

#[derive(Default)]
struct StoreState {
    leases: BTreeMap<(String, String), Lease>,
    next_version: u64,
    fail_next: u32,
    conflict_next: u32,
    stall_next: Option<Duration>,
}

impl StoreState {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    fn injected_failure(&mut self, op: &str) -> Result<()> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(SlotLeaseError::Store {
                message: format!("injected failure on {}", op),
            });
        }
        Ok(())
    }
}

/// Thread-safe in-memory lease store
#[derive(Default)]
pub struct MemoryLeaseStore {
    state: Mutex<StoreState>,
}

impl MemoryLeaseStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations fail with a store error
    pub fn fail_next(&self, count: u32) {
        self.state.lock().fail_next = count;
    }

    /// Make the next `count` replaces fail with a conflict, as if another
    /// writer got there first
    pub fn conflict_next(&self, count: u32) {
        self.state.lock().conflict_next = count;
    }

    /// Make the next operation hang for `by` before it runs, as a slow
    /// platform API would
    pub fn stall_next(&self, by: Duration) {
        self.state.lock().stall_next = Some(by);
    }

    async fn stall(&self) {
        let stall = self.state.lock().stall_next.take();
        if let Some(by) = stall {
            debug!("Stalling store operation for {:?}", by);
            tokio::time::sleep(by).await;
        }
    }

    /// Write a record unconditionally, bypassing CAS
    ///
    /// Simulates state left behind by other processes.
    pub fn put(&self, mut lease: Lease) -> Lease {
        let mut state = self.state.lock();
        lease.resource_version = state.bump();
        state
            .leases
            .insert((lease.namespace.clone(), lease.name.clone()), lease.clone());
        lease
    }

    /// Delete a record
    pub fn delete(&self, namespace: &str, name: &str) -> Option<Lease> {
        self.state
            .lock()
            .leases
            .remove(&(namespace.to_string(), name.to_string()))
    }

    /// Cascade-delete every lease owned by the given owner uid
    pub fn collect_owned_by(&self, owner_uid: &str) -> usize {
        let mut state = self.state.lock();
        let before = state.leases.len();
        state
            .leases
            .retain(|_, lease| !lease.owner_references.iter().any(|o| o.uid == owner_uid));
        let removed = before - state.leases.len();
        debug!("Garbage collected {} leases owned by {}", removed, owner_uid);
        removed
    }

    /// All records in a namespace, ordered by name
    pub fn snapshot(&self, namespace: &str) -> Vec<Lease> {
        self.state
            .lock()
            .leases
            .values()
            .filter(|l| l.namespace == namespace)
            .cloned()
            .collect()
    }

    /// Number of stored records across namespaces
    pub fn len(&self) -> usize {
        self.state.lock().leases.len()
    }

    /// Check whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Lease>> {
        self.stall().await;
        let mut state = self.state.lock();
        state.injected_failure("get")?;
        Ok(state
            .leases
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Lease>> {
        self.stall().await;
        let mut state = self.state.lock();
        state.injected_failure("list")?;
        Ok(state
            .leases
            .values()
            .filter(|l| l.namespace == namespace && selector.matches(&l.labels))
            .cloned()
            .collect())
    }

    async fn create(&self, mut lease: Lease) -> Result<Lease> {
        self.stall().await;
        let mut state = self.state.lock();
        state.injected_failure("create")?;
        let key = (lease.namespace.clone(), lease.name.clone());
        if state.leases.contains_key(&key) {
            return Err(SlotLeaseError::Conflict { name: lease.name });
        }
        lease.resource_version = state.bump();
        state.leases.insert(key, lease.clone());
        Ok(lease)
    }

    async fn replace(&self, mut lease: Lease) -> Result<Lease> {
        self.stall().await;
        let mut state = self.state.lock();
        state.injected_failure("replace")?;
        if state.conflict_next > 0 {
            state.conflict_next -= 1;
            return Err(SlotLeaseError::Conflict { name: lease.name });
        }
        let key = (lease.namespace.clone(), lease.name.clone());
        let stored_version = match state.leases.get(&key) {
            Some(stored) => stored.resource_version,
            None => return Err(SlotLeaseError::LeaseNotFound { name: lease.name }),
        };
        if stored_version != lease.resource_version {
            return Err(SlotLeaseError::Conflict { name: lease.name });
        }
        lease.resource_version = state.bump();
        state.leases.insert(key, lease.clone());
        Ok(lease)
    }
}
