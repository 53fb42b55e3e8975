//! Periodic task scheduling
//!
//! Each controller runs on its own tokio task: a jittered initial delay,
//! then a fixed interval. Missed ticks are skipped rather than bunched, and a
//! tick that outlives its interval is abandoned. The shutdown hook gets one
//! interval to finish.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::shutdown::ShutdownSignal;
use crate::config::SchedulerConfig;
use crate::metrics::PoolMetrics;

/// A unit of periodic work
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    /// Name used in logs
    fn name(&self) -> String;

    /// One self-contained pass; must absorb its own errors
    async fn tick(&self);

    /// Best-effort cleanup once the schedule stops
    async fn on_shutdown(&self) {}
}

/// Marks a tick of one task as in progress
///
/// The flag is cleared on drop, so it is also cleared when the scheduler
/// abandons the tick future.
pub struct TickGuard<'a>(&'a AtomicBool);

impl<'a> TickGuard<'a> {
    /// Set `flag`, or `None` if another tick still holds it
    pub fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn run_shutdown_hook<T: PeriodicTask>(task: &T, name: &str, limit: Duration) {
    if timeout(limit, task.on_shutdown()).await.is_err() {
        warn!("Scheduler '{}' gave up on shutdown hook after {:?}", name, limit);
    }
}

/// Spawn `task` on the current runtime according to `config`
///
/// The loop stops when `shutdown` fires, then runs `on_shutdown`.
pub fn spawn_periodic<T: PeriodicTask>(
    task: Arc<T>,
    config: &SchedulerConfig,
    shutdown: ShutdownSignal,
    metrics: Arc<PoolMetrics>,
) -> JoinHandle<()> {
    let delay = config.initial_delay.pick();
    let every = config.interval;

    tokio::spawn(async move {
        let name = task.name();
        info!("Scheduler '{}' starts in {:?}, every {:?}", name, delay, every);

        let stopped = shutdown.wait();
        tokio::pin!(stopped);

        tokio::select! {
            _ = sleep(delay) => {}
            _ = &mut stopped => {
                run_shutdown_hook(task.as_ref(), &name, every).await;
                info!("Scheduler '{}' stopped before first tick", name);
                return;
            }
        }

        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let start = Instant::now();
                    if timeout(every, task.tick()).await.is_err() {
                        warn!("Scheduler '{}' abandoned a tick after {:?}", name, every);
                        metrics.tick_failures.inc();
                    }
                    metrics.tick_duration.observe_since(start);
                    debug!("Scheduler '{}' tick took {:?}", name, start.elapsed());
                }
                _ = &mut stopped => break,
            }
        }

        run_shutdown_hook(task.as_ref(), &name, every).await;
        info!("Scheduler '{}' stopped", name);
    })
}
