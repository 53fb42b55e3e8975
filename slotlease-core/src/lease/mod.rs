//! Leases: records, the store port, and the operations built on it

pub mod memory;
pub mod record;
pub mod service;
pub mod store;

pub use memory::MemoryLeaseStore;
pub use record::{
    leader_lease_name, member_lease_name, parse_member_index, pool_labels, LabelSelector, Lease,
    OwnerReference, MAX_POOL_SLOTS, POOL_IS_LEADER_LABEL, POOL_NAME_LABEL,
};
pub use service::{LeaseOutcome, LeaseService};
pub use store::LeaseStore;
