//! Readiness derived from member lease ownership
//!
//! A process without a slot has no stable identity, so it reports itself
//! unready instead of running with an undefined one.

use serde::Serialize;
use std::sync::Arc;

use super::gate::MemberLeaseCoordinator;
use crate::identity::ProcessIdentity;

const CHECK_NAME: &str = "Lease Acquisition";

/// Health status reported by the readiness check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down,
}

/// Result of one readiness check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessReport {
    pub name: &'static str,
    pub status: HealthStatus,
    pub lease_enabled: bool,
    pub pool_name: String,
    pub process_name: String,
    pub namespace: String,
    pub lease_acquired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ReadinessReport {
    pub fn is_ready(&self) -> bool {
        self.status == HealthStatus::Up
    }
}

/// Readiness check over the member lease gate
#[derive(Clone)]
pub struct LeaseReadiness {
    coordinator: Arc<MemberLeaseCoordinator>,
    identity: ProcessIdentity,
    pool_name: String,
    lease_enabled: bool,
    require_lease: bool,
}

impl LeaseReadiness {
    pub fn new(
        coordinator: Arc<MemberLeaseCoordinator>,
        identity: ProcessIdentity,
        pool_name: impl Into<String>,
        lease_enabled: bool,
        require_lease: bool,
    ) -> Self {
        Self {
            coordinator,
            identity,
            pool_name: pool_name.into(),
            lease_enabled,
            require_lease,
        }
    }

    pub fn check(&self) -> ReadinessReport {
        let mut report = ReadinessReport {
            name: CHECK_NAME,
            status: HealthStatus::Up,
            lease_enabled: self.lease_enabled,
            pool_name: self.pool_name.clone(),
            process_name: self.identity.name.clone(),
            namespace: self.identity.namespace.clone(),
            lease_acquired: false,
            lease_name: None,
            reason: None,
        };

        if !self.lease_enabled {
            report.reason = Some("Lease member is not enabled".into());
            return report;
        }

        match self.coordinator.current_lease() {
            Some(slot) => {
                report.lease_acquired = true;
                report.lease_name = Some(slot.lease_name);
            }
            None => {
                report.reason = Some("No member lease currently held".into());
                if self.require_lease {
                    report.status = HealthStatus::Down;
                }
            }
        }
        report
    }
}
