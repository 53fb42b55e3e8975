//! Unit tests for the pool member controller
//!
//! Tests slot claiming, renewal, loss and pinned reacquisition, plus the
//! events the controller publishes to the member lease gate.

use std::sync::Arc;
use std::time::Duration;

use slotlease_core::clock::ManualClock;
use slotlease_core::config::{InitialDelay, SchedulerConfig};
use slotlease_core::coordinator::{
    LeaseReadiness, MemberLeaseCoordinator, PoolLeaderController, PoolMemberController,
    SlotEventKind,
};
use slotlease_core::identity::ProcessIdentity;
use slotlease_core::lease::{LeaseService, MemoryLeaseStore};
use slotlease_core::metrics::PoolMetrics;
use slotlease_core::runtime::{spawn_periodic, PeriodicTask, ShutdownSignal};
use slotlease_core::topology::{DeploymentRef, DeploymentTopology, SharedReplicaCount};
use slotlease_core::PoolConfig;

const NS: &str = "default";

struct Pool {
    store: Arc<MemoryLeaseStore>,
    clock: Arc<ManualClock>,
    leases: Arc<LeaseService>,
}

struct Member {
    controller: Arc<PoolMemberController>,
    gate: Arc<MemberLeaseCoordinator>,
    metrics: Arc<PoolMetrics>,
}

impl Member {
    fn is_ready(&self) -> bool {
        LeaseReadiness::new(
            self.gate.clone(),
            ProcessIdentity::new("pod", NS),
            "mypool",
            true,
            true,
        )
        .check()
        .is_ready()
    }
}

impl Pool {
    /// Pool whose member leases have already been provisioned
    async fn provisioned(replicas: u32) -> Self {
        let store = Arc::new(MemoryLeaseStore::new());
        let clock = Arc::new(ManualClock::default());
        let topology = DeploymentTopology::new(
            SharedReplicaCount::new(replicas),
            DeploymentRef::deployment("workers", "uid-workers"),
        );
        let leases = Arc::new(LeaseService::new(
            store.clone(),
            Arc::new(topology),
            clock.clone(),
            NS,
            &PoolConfig::new("mypool"),
        ));

        let leader = PoolLeaderController::new(
            leases.clone(),
            ProcessIdentity::new("provisioner", NS),
            true,
            Arc::new(PoolMetrics::new()),
        );
        leader.reconcile().await.unwrap();

        Self {
            store,
            clock,
            leases,
        }
    }

    fn member(&self, name: &str) -> Member {
        let gate = Arc::new(MemberLeaseCoordinator::new());
        let metrics = Arc::new(PoolMetrics::new());
        let controller = Arc::new(PoolMemberController::new(
            self.leases.clone(),
            ProcessIdentity::new(name, NS),
            gate.clone(),
            true,
            metrics.clone(),
        ));
        Member {
            controller,
            gate,
            metrics,
        }
    }

    fn holder_of(&self, name: &str) -> Option<String> {
        self.store
            .snapshot(NS)
            .into_iter()
            .find(|l| l.name == name)
            .and_then(|l| l.holder().map(str::to_owned))
    }
}

#[tokio::test]
async fn test_first_claim_publishes_slot() {
    let pool = Pool::provisioned(3).await;
    let a = pool.member("pod-a");
    let mut events = a.gate.subscribe();

    assert!(a.controller.acquire_lease().await);
    let slot = a.controller.held().unwrap();
    assert_eq!(slot.index, 0);
    assert_eq!(slot.lease_name, "pool-member-mypool-00");
    assert_eq!(slot.holder, "pod-a");

    let event = events.recv().await.unwrap();
    assert_eq!(event.kind, SlotEventKind::Acquired);
    assert_eq!(a.gate.granted(), Some(slot.clone()));
    assert_eq!(a.gate.current_lease(), Some(slot));
    assert_eq!(a.metrics.granted_slot.get(), 0);
    assert_eq!(a.metrics.slots_claimed.get(), 1);
}

#[tokio::test]
async fn test_processes_get_distinct_slots() {
    let pool = Pool::provisioned(3).await;
    let members: Vec<Member> = ["pod-a", "pod-b", "pod-c"]
        .iter()
        .map(|n| pool.member(n))
        .collect();

    for m in &members {
        assert!(m.controller.acquire_lease().await);
    }
    let indexes: Vec<u32> = members
        .iter()
        .map(|m| m.controller.held().unwrap().index)
        .collect();
    assert_eq!(indexes, [0, 1, 2]);

    let extra = pool.member("pod-d");
    assert!(!extra.controller.acquire_lease().await);
    assert!(extra.gate.granted().is_none());
}

#[tokio::test]
async fn test_no_slots_before_provisioning() {
    let store = Arc::new(MemoryLeaseStore::new());
    let leases = Arc::new(LeaseService::new(
        store,
        Arc::new(slotlease_core::topology::DevTopology),
        Arc::new(ManualClock::default()),
        NS,
        &PoolConfig::new("mypool"),
    ));
    let member = PoolMemberController::new(
        leases,
        ProcessIdentity::new("pod-a", NS),
        Arc::new(MemberLeaseCoordinator::new()),
        true,
        Arc::new(PoolMetrics::new()),
    );
    assert!(!member.acquire_lease().await);
    assert!(!member.has_lease());
}

#[tokio::test]
async fn test_renewal_keeps_slot() {
    let pool = Pool::provisioned(2).await;
    let a = pool.member("pod-a");
    let b = pool.member("pod-b");

    assert!(a.controller.acquire_lease().await);
    for _ in 0..5 {
        pool.clock.advance(Duration::from_secs(10));
        assert!(a.controller.acquire_lease().await);
    }
    assert_eq!(a.controller.held().unwrap().index, 0);
    assert_eq!(a.metrics.slots_claimed.get(), 1);

    // 50s have passed but the slot was renewed every 10s
    assert!(b.controller.acquire_lease().await);
    assert_eq!(b.controller.held().unwrap().index, 1);
}

#[tokio::test]
async fn test_transient_renewal_failure_keeps_slot() {
    let pool = Pool::provisioned(2).await;
    let a = pool.member("pod-a");
    let mut events = a.gate.subscribe();

    assert!(a.controller.acquire_lease().await);
    pool.clock.advance(Duration::from_secs(10));
    pool.store.fail_next(1);
    assert!(a.controller.acquire_lease().await);
    pool.store.conflict_next(1);
    assert!(a.controller.acquire_lease().await);

    assert!(a.controller.has_lease());
    assert_eq!(a.gate.current_lease().unwrap().index, 0);
    assert!(a.is_ready());
    assert_eq!(a.metrics.renew_failures.get(), 2);
    assert_eq!(a.metrics.slots_lost.get(), 0);
    assert_eq!(a.metrics.granted_slot.get(), 0);

    assert_eq!(events.recv().await.unwrap().kind, SlotEventKind::Acquired);
    assert!(events.try_recv().is_err());

    // renewals go through again on the next tick
    assert!(a.controller.acquire_lease().await);
    assert_eq!(pool.holder_of("pool-member-mypool-00").as_deref(), Some("pod-a"));
}

#[tokio::test]
async fn test_lost_slot_is_reported_and_reclaimed() {
    let pool = Pool::provisioned(2).await;
    let a = pool.member("pod-a");
    let mut events = a.gate.subscribe();

    assert!(a.controller.acquire_lease().await);
    // renewals kept failing until the lease ran out
    pool.clock.advance(Duration::from_secs(31));
    pool.store.fail_next(1);
    assert!(!a.controller.acquire_lease().await);
    assert!(!a.controller.has_lease());
    assert_eq!(a.gate.current_lease(), None);
    assert!(!a.is_ready());
    assert_eq!(a.metrics.slots_lost.get(), 1);
    assert_eq!(a.metrics.granted_slot.get(), -1);

    assert_eq!(events.recv().await.unwrap().kind, SlotEventKind::Acquired);
    assert_eq!(events.recv().await.unwrap().kind, SlotEventKind::Lost);

    // nobody else took it, so the next tick gets it back
    assert!(a.controller.acquire_lease().await);
    assert_eq!(a.controller.held().unwrap().index, 0);
    assert!(a.is_ready());
    assert_eq!(events.recv().await.unwrap().kind, SlotEventKind::Acquired);
}

#[tokio::test]
async fn test_deleted_lease_is_lost_at_once() {
    let pool = Pool::provisioned(2).await;
    let a = pool.member("pod-a");

    assert!(a.controller.acquire_lease().await);
    pool.store.delete(NS, "pool-member-mypool-00");
    assert!(!a.controller.acquire_lease().await);
    assert_eq!(a.metrics.slots_lost.get(), 1);
    assert_eq!(a.gate.granted().unwrap().index, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_renewal_does_not_wedge_scheduler() {
    let pool = Pool::provisioned(2).await;
    let a = pool.member("pod-a");
    let b = pool.member("pod-b");
    assert!(a.controller.acquire_lease().await);

    let schedule = SchedulerConfig {
        interval: Duration::from_secs(1),
        initial_delay: InitialDelay::Fixed {
            after: Duration::ZERO,
        },
    };
    pool.store.stall_next(Duration::from_secs(60));
    let shutdown = ShutdownSignal::new();
    let handle = spawn_periodic(
        a.controller.clone(),
        &schedule,
        shutdown.clone(),
        a.metrics.clone(),
    );

    // 50s of lease time pass while pod-a keeps renewing every second
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        pool.clock.advance(Duration::from_secs(10));
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(a.metrics.tick_failures.get(), 1);
    assert!(a.controller.has_lease());
    assert!(b.controller.acquire_lease().await);
    assert_eq!(b.controller.held().unwrap().index, 1);

    shutdown.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_reacquire_is_pinned_to_first_slot() {
    let pool = Pool::provisioned(3).await;
    let a = pool.member("pod-a");
    let b = pool.member("pod-b");

    assert!(a.controller.acquire_lease().await);
    // pod-a stalls past its TTL and pod-b takes slot 00 over
    pool.clock.advance(Duration::from_secs(31));
    assert!(b.controller.acquire_lease().await);
    assert_eq!(b.controller.held().unwrap().index, 0);

    assert!(!a.controller.acquire_lease().await);
    // slots 01 and 02 are free, yet pod-a only ever asks for 00
    for _ in 0..3 {
        assert!(!a.controller.acquire_lease().await);
    }
    assert_eq!(pool.holder_of("pool-member-mypool-01"), None);
    assert_eq!(a.gate.granted().unwrap().index, 0);

    // pod-b goes away; pod-a gets its own slot back
    b.controller.release().await;
    assert!(a.controller.acquire_lease().await);
    assert_eq!(a.controller.held().unwrap().index, 0);
}

#[tokio::test]
async fn test_lost_race_moves_to_next_slot() {
    let pool = Pool::provisioned(2).await;
    let a = pool.member("pod-a");

    pool.store.conflict_next(1);
    assert!(a.controller.acquire_lease().await);
    assert_eq!(a.controller.held().unwrap().index, 1);
}

#[tokio::test]
async fn test_shutdown_releases_slot() {
    let pool = Pool::provisioned(1).await;
    let a = pool.member("pod-a");
    let b = pool.member("pod-b");
    let mut events = a.gate.subscribe();

    a.controller.tick().await;
    assert!(a.controller.has_lease());
    a.controller.on_shutdown().await;

    assert!(!a.controller.has_lease());
    assert_eq!(pool.holder_of("pool-member-mypool-00"), None);
    assert_eq!(events.recv().await.unwrap().kind, SlotEventKind::Acquired);
    assert_eq!(events.recv().await.unwrap().kind, SlotEventKind::Released);

    // released slot is free for the next process at once
    assert!(b.controller.acquire_lease().await);
}
