//! Pool topology
//!
//! Desired pool size and the owner of the pool's leases both come from the
//! deployment unit running the fleet.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::error::Result;
use crate::lease::OwnerReference;

/// Resolves the pool's desired size and lease owner
#[async_trait]
pub trait PoolTopologyResolver: Send + Sync {
    /// Desired number of pool members, `None` if unknown
    async fn desired_replicas(&self) -> Result<Option<u32>>;

    /// Owner references to attach to created leases
    async fn owner_references(&self) -> Result<Vec<OwnerReference>>;
}

/// Reference to a deployment unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

impl DeploymentRef {
    /// Reference to an `apps/v1` Deployment
    pub fn deployment(name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            name: name.into(),
            uid: uid.into(),
        }
    }

    /// Non-controlling owner reference pointing at this unit
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: false,
        }
    }
}

/// Reads a deployment unit's replica count from the platform
#[async_trait]
pub trait ReplicaReader: Send + Sync {
    async fn read_replica_count(&self, deployment: &DeploymentRef) -> Result<Option<u32>>;
}

/// Topology backed by a known deployment unit
pub struct DeploymentTopology<R> {
    reader: R,
    deployment: DeploymentRef,
}

impl<R: ReplicaReader> DeploymentTopology<R> {
    pub fn new(reader: R, deployment: DeploymentRef) -> Self {
        Self { reader, deployment }
    }
}

#[async_trait]
impl<R: ReplicaReader> PoolTopologyResolver for DeploymentTopology<R> {
    async fn desired_replicas(&self) -> Result<Option<u32>> {
        let replicas = self.reader.read_replica_count(&self.deployment).await?;
        if replicas.is_none() {
            warn!(
                "Replica count unavailable for {} {}",
                self.deployment.kind, self.deployment.name
            );
        }
        Ok(replicas)
    }

    async fn owner_references(&self) -> Result<Vec<OwnerReference>> {
        Ok(vec![self.deployment.owner_reference()])
    }
}

/// Replica count held in process, adjustable at runtime
///
/// Serves as the `ReplicaReader` for tests and the simulator, where the
/// "deployment" is scaled by calling `set`.
#[derive(Debug, Clone, Default)]
pub struct SharedReplicaCount(Arc<AtomicU32>);

impl SharedReplicaCount {
    pub fn new(replicas: u32) -> Self {
        Self(Arc::new(AtomicU32::new(replicas)))
    }

    /// Scale the deployment
    pub fn set(&self, replicas: u32) {
        self.0.store(replicas, Ordering::SeqCst);
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplicaReader for SharedReplicaCount {
    async fn read_replica_count(&self, _deployment: &DeploymentRef) -> Result<Option<u32>> {
        Ok(Some(self.get()))
    }
}

/// Single-member, ownerless topology for local development
#[derive(Debug, Clone, Copy, Default)]
pub struct DevTopology;

#[async_trait]
impl PoolTopologyResolver for DevTopology {
    async fn desired_replicas(&self) -> Result<Option<u32>> {
        Ok(Some(1))
    }

    async fn owner_references(&self) -> Result<Vec<OwnerReference>> {
        Ok(Vec::new())
    }
}
