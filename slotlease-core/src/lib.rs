//! Slotlease Core - lease-based pool membership
//!
//! Gives every process of a horizontally scaled fleet a stable slot index
//! (`00`, `01`, ...) using nothing but leases in a shared store:
//! - Leader election over a per-pool leader lease
//! - Member lease provisioning sized to the desired replica count
//! - Per-process slot claiming, renewal and pinned reacquisition
//! - An in-process gate and readiness check built on the granted slot

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod identity;
pub mod lease;
pub mod metrics;
pub mod runtime;
pub mod topology;

pub use config::PoolConfig;
pub use coordinator::{GrantedSlot, MemberLeaseCoordinator, SlotEvent, SlotEventKind};
pub use error::SlotLeaseError;
pub use lease::{LeaseService, LeaseStore, MemoryLeaseStore};
pub use runtime::{PoolRuntime, PoolRuntimeBuilder};

/// Default lease time-to-live in seconds
pub const DEFAULT_LEASE_TTL_SECS: u64 = 30;

/// Default controller tick interval in seconds; must stay below the TTL
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 10;

/// Default lower bound of the random initial scheduler delay
pub const DEFAULT_INITIAL_DELAY_MIN_SECS: u64 = 5;

/// Default upper bound of the random initial scheduler delay
pub const DEFAULT_INITIAL_DELAY_MAX_SECS: u64 = 11;

/// Default time startup waits for a member slot
pub const DEFAULT_AWAIT_TIMEOUT_SECS: u64 = 30;
