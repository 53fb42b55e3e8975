//! Lease store port
//!
//! The coordination backend only needs per-record atomic writes. Every
//! mutation is either a create that fails if the record exists, or a
//! replace guarded by the record's resource version.

use async_trait::async_trait;

use super::record::{LabelSelector, Lease};
use crate::error::Result;

/// Strongly-consistent store of lease records
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Read one lease
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Lease>>;

    /// List leases whose labels match `selector`
    async fn list(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Lease>>;

    /// Create a lease if none exists under its name
    ///
    /// Fails with `Conflict` when the name is taken. Returns the stored
    /// record with its assigned resource version.
    async fn create(&self, lease: Lease) -> Result<Lease>;

    /// Compare-and-swap a lease
    ///
    /// Succeeds only if the stored resource version equals
    /// `lease.resource_version`; otherwise fails with `Conflict`. Returns
    /// the stored record with its new resource version.
    async fn replace(&self, lease: Lease) -> Result<Lease>;
}
