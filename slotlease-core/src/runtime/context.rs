//! Per-process pool runtime
//!
//! Wires one process into one pool: lease service, both controllers, the
//! member lease gate and the two periodic schedules. Everything is owned by
//! the runtime value, so several simulated processes can share one store.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::scheduler::spawn_periodic;
use super::shutdown::ShutdownSignal;
use crate::clock::{Clock, SystemClock};
use crate::config::PoolConfig;
use crate::coordinator::{
    GrantedSlot, LeaseReadiness, MemberLeaseCoordinator, PoolLeaderController,
    PoolMemberController, ReadinessReport,
};
use crate::error::{Result, SlotLeaseError};
use crate::identity::{EnvIdentity, IdentityResolver, ProcessIdentity};
use crate::lease::{LeaseService, LeaseStore};
use crate::metrics::PoolMetrics;
use crate::topology::PoolTopologyResolver;

/// Builder for [`PoolRuntime`]
pub struct PoolRuntimeBuilder {
    config: PoolConfig,
    store: Arc<dyn LeaseStore>,
    topology: Arc<dyn PoolTopologyResolver>,
    identity: Box<dyn IdentityResolver>,
    clock: Arc<dyn Clock>,
}

impl PoolRuntimeBuilder {
    pub fn new(
        config: PoolConfig,
        store: Arc<dyn LeaseStore>,
        topology: Arc<dyn PoolTopologyResolver>,
    ) -> Self {
        Self {
            config,
            store,
            topology,
            identity: Box::new(EnvIdentity::new()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Override how the process name and namespace are resolved
    pub fn identity(mut self, resolver: impl IdentityResolver + 'static) -> Self {
        self.identity = Box::new(resolver);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration and resolve identity
    ///
    /// Both failures are fatal: the process cannot join the pool without
    /// a usable configuration and a stable name.
    pub fn build(self) -> Result<PoolRuntime> {
        if let Err(e) = self.config.validate() {
            error!("Invalid pool configuration: {}", e);
            return Err(e);
        }
        let identity = match self.identity.resolve() {
            Ok(identity) => identity,
            Err(e) => {
                error!("Cannot resolve process identity: {}", e);
                return Err(e);
            }
        };

        let leases = Arc::new(LeaseService::new(
            self.store,
            self.topology,
            self.clock,
            identity.namespace.clone(),
            &self.config,
        ));
        let metrics = Arc::new(PoolMetrics::new());
        let coordinator = Arc::new(MemberLeaseCoordinator::new());

        let leader = Arc::new(PoolLeaderController::new(
            leases.clone(),
            identity.clone(),
            self.config.leader_lease.enabled,
            metrics.clone(),
        ));
        let member = Arc::new(PoolMemberController::new(
            leases.clone(),
            identity.clone(),
            coordinator.clone(),
            self.config.member_lease.enabled,
            metrics.clone(),
        ));
        let readiness = LeaseReadiness::new(
            coordinator.clone(),
            identity.clone(),
            self.config.pool_name.clone(),
            self.config.member_lease.enabled,
            self.config.require_lease,
        );

        info!(
            "{} joining pool '{}' in namespace {}",
            identity.name, self.config.pool_name, identity.namespace
        );

        Ok(PoolRuntime {
            config: self.config,
            identity,
            leases,
            leader,
            member,
            coordinator,
            readiness,
            metrics,
            shutdown: ShutdownSignal::new(),
            handles: Mutex::new(None),
        })
    }
}

/// One process's participation in one pool
pub struct PoolRuntime {
    config: PoolConfig,
    identity: ProcessIdentity,
    leases: Arc<LeaseService>,
    leader: Arc<PoolLeaderController>,
    member: Arc<PoolMemberController>,
    coordinator: Arc<MemberLeaseCoordinator>,
    readiness: LeaseReadiness,
    metrics: Arc<PoolMetrics>,
    shutdown: ShutdownSignal,
    handles: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl PoolRuntime {
    pub fn builder(
        config: PoolConfig,
        store: Arc<dyn LeaseStore>,
        topology: Arc<dyn PoolTopologyResolver>,
    ) -> PoolRuntimeBuilder {
        PoolRuntimeBuilder::new(config, store, topology)
    }

    fn ensure_startable(&self) -> Result<()> {
        if self.shutdown.is_shutdown() {
            return Err(SlotLeaseError::ShutdownInProgress);
        }
        if self.handles.lock().is_some() {
            return Err(SlotLeaseError::AlreadyStarted);
        }
        Ok(())
    }

    /// Spawn the enabled controller schedules on the current tokio runtime
    ///
    /// A process that may lead the pool must be able to resolve the pool's
    /// replica count; failing that, startup is aborted with a configuration
    /// error. Later resolution failures only skip a reconcile pass.
    pub async fn start(&self) -> Result<()> {
        self.ensure_startable()?;
        if self.config.leader_lease.enabled {
            match self.leases.resolve_desired_replicas().await {
                Ok(replicas) => info!(
                    "Pool '{}' wants {} members",
                    self.config.pool_name, replicas
                ),
                Err(e) => {
                    error!("Cannot start pool leader election: {}", e);
                    return Err(e);
                }
            }
        }

        let mut handles = self.handles.lock();
        if handles.is_some() {
            return Err(SlotLeaseError::AlreadyStarted);
        }

        let mut spawned = Vec::with_capacity(2);
        if self.config.leader_lease.enabled {
            spawned.push(spawn_periodic(
                self.leader.clone(),
                &self.config.leader_scheduler,
                self.shutdown.clone(),
                self.metrics.clone(),
            ));
        }
        if self.config.member_lease.enabled {
            spawned.push(spawn_periodic(
                self.member.clone(),
                &self.config.member_scheduler,
                self.shutdown.clone(),
                self.metrics.clone(),
            ));
        }
        if spawned.is_empty() {
            warn!(
                "Both leases disabled for pool '{}', nothing scheduled",
                self.config.pool_name
            );
        }
        *handles = Some(spawned);
        Ok(())
    }

    /// Block until this process has been granted a member slot
    pub async fn await_lease(&self) -> Result<GrantedSlot> {
        let slot = self.coordinator.await_lease(self.config.await_timeout).await;
        if let Err(e) = &slot {
            warn!("{} has no member slot: {}", self.identity.name, e);
        }
        slot
    }

    pub fn readiness(&self) -> ReadinessReport {
        self.readiness.check()
    }

    /// Stop both schedules and release held leases
    pub async fn shutdown(&self) {
        self.shutdown.shutdown();
        let handles = self.handles.lock().take();
        for handle in handles.into_iter().flatten() {
            if let Err(e) = handle.await {
                warn!("Pool scheduler task failed: {}", e);
            }
        }
        info!(
            "{} left pool '{}'",
            self.identity.name, self.config.pool_name
        );
    }

    /// Stop both schedules without releasing anything, as a crash would
    pub fn abort(&self) {
        self.shutdown.shutdown();
        if let Some(handles) = self.handles.lock().take() {
            for handle in handles {
                handle.abort();
            }
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    pub fn leases(&self) -> &Arc<LeaseService> {
        &self.leases
    }

    pub fn leader(&self) -> &Arc<PoolLeaderController> {
        &self.leader
    }

    pub fn member(&self) -> &Arc<PoolMemberController> {
        &self.member
    }

    pub fn coordinator(&self) -> &Arc<MemberLeaseCoordinator> {
        &self.coordinator
    }

    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }
}
