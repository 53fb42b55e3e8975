//! Error types for slotlease
//!
//! Covers lease store failures, coordination outcomes, configuration
//! problems, and runtime lifecycle errors.

use std::time::Duration;
use thiserror::Error;

/// Primary error type for all slotlease operations
#[derive(Debug, Error)]
pub enum SlotLeaseError {
    // ========== Store Errors ==========

    /// Store or platform API failure, retried on the next tick
    #[error("Lease store operation failed: {message}")]
    Store { message: String },

    /// A write raced with another writer (stale resource version or duplicate create)
    #[error("Conflicting write on lease {name}")]
    Conflict { name: String },

    /// Lease record does not exist
    #[error("Lease not found: {name}")]
    LeaseNotFound { name: String },

    // ========== Coordination Errors ==========

    /// Another process holds the lease and has renewed within its TTL
    #[error("Lease {name} is held by {holder}")]
    LostRace { name: String, holder: String },

    /// No slot was granted before the caller's deadline
    #[error("Timed out waiting for a member lease after {timeout:?}")]
    SlotAcquisitionTimeout { timeout: Duration },

    // ========== Configuration Errors ==========

    /// Configuration is missing or invalid
    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    /// Process name or namespace could not be resolved
    #[error("Cannot resolve process identity: {reason}")]
    IdentityUnresolved { reason: String },

    // ========== Runtime Errors ==========

    /// Runtime already started
    #[error("Pool runtime already started")]
    AlreadyStarted,

    /// Shutdown in progress
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SlotLeaseError {
    /// Returns true if this error is retryable on the next tick
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SlotLeaseError::Store { .. }
                | SlotLeaseError::Conflict { .. }
                | SlotLeaseError::LostRace { .. }
        )
    }

    /// Returns true if another process won the write
    pub fn is_lost_race(&self) -> bool {
        matches!(
            self,
            SlotLeaseError::Conflict { .. } | SlotLeaseError::LostRace { .. }
        )
    }

    /// Returns true if startup must not proceed
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SlotLeaseError::Configuration { .. } | SlotLeaseError::IdentityUnresolved { .. }
        )
    }
}

/// Result type alias for slotlease operations
pub type Result<T> = std::result::Result<T, SlotLeaseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let conflict = SlotLeaseError::Conflict { name: "pool-leader-a".into() };
        assert!(conflict.is_retryable());
        assert!(conflict.is_lost_race());
        assert!(!conflict.is_fatal());

        let config = SlotLeaseError::Configuration { reason: "pool name".into() };
        assert!(config.is_fatal());
        assert!(!config.is_retryable());

        let timeout = SlotLeaseError::SlotAcquisitionTimeout {
            timeout: Duration::from_secs(1),
        };
        assert!(!timeout.is_retryable());
    }
}
