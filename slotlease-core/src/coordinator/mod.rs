//! Pool coordination
//!
//! Leader election and member-lease sizing, per-process slot claiming, and
//! the in-process gate that publishes the granted slot.

pub mod gate;
pub mod leader;
pub mod membership;
pub mod readiness;

pub use gate::{GrantedSlot, MemberLeaseCoordinator, SlotEvent, SlotEventKind};
pub use leader::{LeaderState, PoolLeaderController, ReconcileReport};
pub use membership::PoolMemberController;
pub use readiness::{HealthStatus, LeaseReadiness, ReadinessReport};
