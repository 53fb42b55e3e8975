//! Async runtime plumbing for the pool controllers
//!
//! Periodic scheduling, shutdown signalling, and the per-process runtime
//! that ties them to one pool.

pub mod context;
pub mod scheduler;
pub mod shutdown;

pub use context::{PoolRuntime, PoolRuntimeBuilder};
pub use scheduler::{spawn_periodic, PeriodicTask, TickGuard};
pub use shutdown::ShutdownSignal;
