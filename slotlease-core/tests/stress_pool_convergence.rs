//! Stress tests for pool convergence
//!
//! Several runtimes share one store and race for leadership and slots on
//! paused tokio time. Lease expiry follows a manual clock stepped along
//! with tokio time.
//!
//! Run with: cargo test --release --test stress_pool_convergence -- --nocapture

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use slotlease_core::clock::ManualClock;
use slotlease_core::config::InitialDelay;
use slotlease_core::identity::{FixedIdentity, ProcessIdentity};
use slotlease_core::lease::leader_lease_name;
use slotlease_core::topology::{DeploymentRef, DeploymentTopology, SharedReplicaCount};
use slotlease_core::{MemoryLeaseStore, PoolConfig, PoolRuntime};

const NS: &str = "default";
const STEP: Duration = Duration::from_millis(100);

struct Fleet {
    store: Arc<MemoryLeaseStore>,
    clock: Arc<ManualClock>,
    replicas: SharedReplicaCount,
    config: PoolConfig,
}

impl Fleet {
    fn new(replicas: u32) -> Self {
        let mut config = PoolConfig::new("mypool");
        config.leader_lease.ttl = Duration::from_secs(3);
        config.member_lease.ttl = Duration::from_secs(3);
        for scheduler in [&mut config.leader_scheduler, &mut config.member_scheduler] {
            scheduler.interval = Duration::from_secs(1);
            scheduler.initial_delay = InitialDelay::Random {
                min: Duration::ZERO,
                max: Duration::from_secs(1),
            };
        }
        config.await_timeout = Duration::from_secs(15);

        Self {
            store: Arc::new(MemoryLeaseStore::new()),
            clock: Arc::new(ManualClock::default()),
            replicas: SharedReplicaCount::new(replicas),
            config,
        }
    }

    async fn spawn(&self, name: &str) -> PoolRuntime {
        let topology = DeploymentTopology::new(
            self.replicas.clone(),
            DeploymentRef::deployment("workers", "uid-workers"),
        );
        let runtime =
            PoolRuntime::builder(self.config.clone(), self.store.clone(), Arc::new(topology))
                .identity(FixedIdentity(ProcessIdentity::new(name, NS)))
                .clock(self.clock.clone())
                .build()
                .unwrap();
        runtime.start().await.unwrap();
        runtime
    }

    async fn spawn_all(&self, count: u32) -> Vec<PoolRuntime> {
        let mut runtimes = Vec::with_capacity(count as usize);
        for i in 0..count {
            runtimes.push(self.spawn(&format!("pod-{}", i)).await);
        }
        runtimes
    }

    /// Let tokio time and lease time pass together
    async fn run_for(&self, total: Duration) {
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            tokio::time::sleep(STEP).await;
            self.clock.advance(STEP);
            elapsed += STEP;
        }
    }

    fn leader_holder(&self) -> Option<String> {
        let name = leader_lease_name(&self.config.pool_name);
        self.store
            .snapshot(NS)
            .into_iter()
            .find(|l| l.name == name)
            .and_then(|l| l.holder().map(str::to_owned))
    }
}

#[tokio::test(start_paused = true)]
async fn stress_three_processes_converge() {
    let fleet = Fleet::new(3);
    let runtimes = fleet.spawn_all(3).await;

    let mut indexes = HashSet::new();
    for rt in &runtimes {
        let slot = rt.await_lease().await.unwrap();
        assert!(indexes.insert(slot.index), "slot {} granted twice", slot);
    }
    assert_eq!(indexes, HashSet::from([0, 1, 2]));

    fleet.run_for(Duration::from_secs(5)).await;

    let leaders: Vec<&PoolRuntime> = runtimes.iter().filter(|r| r.leader().is_leader()).collect();
    assert_eq!(leaders.len(), 1, "exactly one leader expected");
    assert!(leaders[0].member().has_lease(), "leader must hold a slot too");
    assert_eq!(
        fleet.leader_holder().as_deref(),
        Some(leaders[0].identity().name.as_str())
    );
    assert!(runtimes.iter().all(|r| r.readiness().is_ready()));

    for rt in &runtimes {
        rt.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn stress_leader_crash_failover() {
    let fleet = Fleet::new(3);
    let mut runtimes = fleet.spawn_all(3).await;
    for rt in &runtimes {
        rt.await_lease().await.unwrap();
    }
    fleet.run_for(Duration::from_secs(2)).await;

    let crashed = runtimes
        .iter()
        .position(|r| r.leader().is_leader())
        .unwrap();
    let crashed = runtimes.remove(crashed);
    let crashed_slot = crashed.member().held().unwrap();
    crashed.abort();

    // survivors keep renewing while the crashed leases run out
    fleet.run_for(Duration::from_secs(6)).await;

    let new_leader = fleet.leader_holder().unwrap();
    assert_ne!(new_leader, crashed.identity().name);
    assert_eq!(
        runtimes.iter().filter(|r| r.leader().is_leader()).count(),
        1
    );
    for rt in &runtimes {
        assert!(rt.member().has_lease());
    }

    // the replacement process inherits the crashed slot
    let replacement = fleet.spawn("pod-3").await;
    let slot = replacement.await_lease().await.unwrap();
    assert_eq!(slot.index, crashed_slot.index);

    runtimes.push(replacement);
    for rt in &runtimes {
        rt.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn stress_scale_up_under_churn() {
    let num_processes = 20;
    let fleet = Fleet::new(num_processes);
    let runtimes = fleet.spawn_all(num_processes).await;

    let mut indexes = HashSet::new();
    for rt in &runtimes {
        let slot = rt.await_lease().await.unwrap();
        assert!(indexes.insert(slot.index), "slot {} granted twice", slot);
    }
    assert_eq!(indexes, (0..num_processes).collect::<HashSet<u32>>());

    let leader = runtimes.iter().find(|r| r.leader().is_leader()).unwrap();
    let transitions: u32 = fleet.store.snapshot(NS).iter().map(|l| l.transitions).sum();

    println!("Pool convergence stress test:");
    println!("  Processes: {}", num_processes);
    println!("  Leader: {}", leader.identity().name);
    println!("  Holder transitions: {}", transitions);
    println!("{}", leader.metrics().export());

    // no slot changes hands while every holder keeps renewing
    fleet.run_for(Duration::from_secs(10)).await;
    let after: u32 = fleet.store.snapshot(NS).iter().map(|l| l.transitions).sum();
    assert_eq!(after, transitions);

    for rt in &runtimes {
        rt.shutdown().await;
    }
}
