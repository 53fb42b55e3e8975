//! Pool simulator binary
//!
//! Runs several pool processes against one in-memory lease store, then
//! crashes the leader and scales the pool up to show failover and growth.

use slotlease_core::config::InitialDelay;
use slotlease_core::identity::{FixedIdentity, ProcessIdentity};
use slotlease_core::lease::leader_lease_name;
use slotlease_core::topology::{DeploymentRef, DeploymentTopology, SharedReplicaCount};
use slotlease_core::{MemoryLeaseStore, PoolConfig, PoolRuntime};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const NAMESPACE: &str = "default";

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn sim_config(pool: &str, ttl: Duration, interval: Duration) -> PoolConfig {
    let mut config = PoolConfig::new(pool);
    config.leader_lease.ttl = ttl;
    config.member_lease.ttl = ttl;
    for scheduler in [&mut config.leader_scheduler, &mut config.member_scheduler] {
        scheduler.interval = interval;
        scheduler.initial_delay = InitialDelay::Random {
            min: Duration::ZERO,
            max: interval,
        };
    }
    config.await_timeout = ttl * 5;
    config
}

async fn spawn_process(
    index: usize,
    config: &PoolConfig,
    store: &Arc<MemoryLeaseStore>,
    replicas: &SharedReplicaCount,
) -> Result<PoolRuntime, Box<dyn std::error::Error>> {
    let topology = DeploymentTopology::new(
        replicas.clone(),
        DeploymentRef::deployment(config.pool_name.clone(), "sim-deployment-uid"),
    );
    let runtime = PoolRuntime::builder(config.clone(), store.clone(), Arc::new(topology))
        .identity(FixedIdentity(ProcessIdentity::new(
            format!("{}-pod-{}", config.pool_name, index),
            NAMESPACE,
        )))
        .build()?;
    runtime.start().await?;
    Ok(runtime)
}

fn log_roster(store: &MemoryLeaseStore) {
    for lease in store.snapshot(NAMESPACE) {
        info!(
            "  {:<28} holder={:<20} transitions={}",
            lease.name,
            lease.holder().unwrap_or("-"),
            lease.transitions
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let processes: usize = env_or("SIM_PROCESSES", 3);

    // SLOTLEASE_* variables select a production-like configuration
    let config = if std::env::var("SLOTLEASE_POOL_NAME").is_ok() {
        PoolConfig::from_env()?
    } else {
        let ttl = Duration::from_secs(env_or("SIM_TTL_SECS", 3));
        let interval = Duration::from_millis(env_or("SIM_INTERVAL_MILLIS", 1_000));
        sim_config(&std::env::var("SIM_POOL_NAME").unwrap_or_else(|_| "sim".into()), ttl, interval)
    };
    config.validate()?;
    let pool = config.pool_name.clone();
    let ttl = config.member_lease.ttl;
    let interval = config.member_scheduler.interval;

    info!(
        "Simulating pool '{}' with {} processes (ttl {:?}, interval {:?})",
        pool, processes, ttl, interval
    );

    let store = Arc::new(MemoryLeaseStore::new());
    let replicas = SharedReplicaCount::new(processes as u32);

    let mut runtimes = Vec::with_capacity(processes);
    for i in 0..processes {
        runtimes.push(spawn_process(i, &config, &store, &replicas).await?);
    }

    for runtime in &runtimes {
        match runtime.await_lease().await {
            Ok(slot) => info!("{} holds {}", runtime.identity().name, slot),
            Err(e) => error!("{} got no slot: {}", runtime.identity().name, e),
        }
    }
    info!("Roster after startup:");
    log_roster(&store);

    // Crash the leader without releasing anything
    let Some(crashed) = runtimes.iter().position(|r| r.leader().is_leader()) else {
        warn!("No leader elected, stopping");
        for runtime in &runtimes {
            runtime.shutdown().await;
        }
        return Ok(());
    };
    let crashed = runtimes.remove(crashed);
    info!("Crashing leader {}", crashed.identity().name);
    crashed.abort();

    // Scale up so the new leader has work to do
    replicas.set(processes as u32 + 1);
    runtimes.push(spawn_process(processes, &config, &store, &replicas).await?);

    tokio::time::sleep(ttl + interval * 2).await;
    let leader = store
        .snapshot(NAMESPACE)
        .into_iter()
        .find(|l| l.name == leader_lease_name(&pool))
        .and_then(|l| l.holder().map(str::to_owned));
    info!("Leader after failover: {}", leader.as_deref().unwrap_or("none"));

    if let Some(newcomer) = runtimes.last() {
        match newcomer.await_lease().await {
            Ok(slot) => info!("{} joined as {}", newcomer.identity().name, slot),
            Err(e) => error!("{} got no slot: {}", newcomer.identity().name, e),
        }
    }
    info!("Roster after failover and scale-up:");
    log_roster(&store);

    for runtime in &runtimes {
        let report = runtime.readiness();
        info!("{}", serde_json::to_string(&report)?);
    }
    if let Some(runtime) = runtimes.first() {
        info!("Metrics of {}:\n{}", runtime.identity().name, runtime.metrics().export());
    }

    for runtime in &runtimes {
        runtime.shutdown().await;
    }
    info!("Roster after graceful shutdown:");
    log_roster(&store);
    Ok(())
}
