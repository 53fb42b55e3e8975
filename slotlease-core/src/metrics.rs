//! Prometheus-style metrics for pool coordination
//!
//! Metrics live on a per-runtime `PoolMetrics` value rather than in
//! statics, so several pool runtimes can share a process (and a test).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Counter metric (monotonically increasing)
pub struct Counter {
    value: AtomicU64,
    name: String,
    help: String,
}

impl Counter {
    /// Create a new counter
    pub fn new(name: &str, help: &str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by delta
    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Gauge metric (can go up or down)
pub struct Gauge {
    value: AtomicI64,
    name: String,
    help: String,
}

impl Gauge {
    /// Create a new gauge
    pub fn new(name: &str, help: &str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    /// Set value
    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Histogram for tick latency
pub struct Histogram {
    buckets: Vec<(f64, AtomicU64)>,
    sum: AtomicU64,
    count: AtomicU64,
    name: String,
    help: String,
}

impl Histogram {
    /// Create with default buckets
    pub fn new(name: &str, help: &str) -> Self {
        Self::with_buckets(
            name,
            help,
            vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
        )
    }

    /// Create with custom buckets
    pub fn with_buckets(name: &str, help: &str, bounds: Vec<f64>) -> Self {
        let buckets = bounds
            .into_iter()
            .map(|b| (b, AtomicU64::new(0)))
            .collect();

        Self {
            buckets,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    /// Observe a value in seconds
    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);

        // sum kept as micros
        let micros = (value * 1_000_000.0) as u64;
        self.sum.fetch_add(micros, Ordering::Relaxed);

        for (bound, count) in &self.buckets {
            if value <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record the time elapsed since `start`
    pub fn observe_since(&self, start: Instant) {
        self.observe(start.elapsed().as_secs_f64());
    }

    /// Number of observations
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        let mut output = format!(
            "# HELP {} {}\n# TYPE {} histogram\n",
            self.name, self.help, self.name
        );

        for (bound, count) in &self.buckets {
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                self.name,
                bound,
                count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "{}_bucket{{le=\"+Inf\"}} {}\n",
            self.name,
            self.count()
        ));

        let sum_secs = self.sum.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        output.push_str(&format!("{}_sum {}\n", self.name, sum_secs));
        output.push_str(&format!("{}_count {}\n", self.name, self.count()));

        output
    }
}

/// Metrics of one pool runtime
pub struct PoolMetrics {
    pub leader_acquired: Counter,
    pub leader_lost: Counter,
    pub member_leases_created: Counter,
    pub slots_claimed: Counter,
    pub slots_lost: Counter,
    pub renew_failures: Counter,
    pub tick_failures: Counter,
    pub is_leader: Gauge,
    /// Held slot index, -1 when none
    pub granted_slot: Gauge,
    pub tick_duration: Histogram,
}

impl PoolMetrics {
    pub fn new() -> Self {
        let granted_slot = Gauge::new(
            "slotlease_granted_slot",
            "Member slot index held by this process, -1 if none",
        );
        granted_slot.set(-1);

        Self {
            leader_acquired: Counter::new(
                "slotlease_leader_acquired_total",
                "Times this process became pool leader",
            ),
            leader_lost: Counter::new(
                "slotlease_leader_lost_total",
                "Times this process lost pool leadership",
            ),
            member_leases_created: Counter::new(
                "slotlease_member_leases_created_total",
                "Member leases created while leader",
            ),
            slots_claimed: Counter::new(
                "slotlease_slots_claimed_total",
                "Member slots claimed by this process",
            ),
            slots_lost: Counter::new(
                "slotlease_slots_lost_total",
                "Member slots lost to expiry or takeover",
            ),
            renew_failures: Counter::new(
                "slotlease_renew_failures_total",
                "Failed lease renewals",
            ),
            tick_failures: Counter::new(
                "slotlease_tick_failures_total",
                "Controller ticks abandoned for outliving their interval",
            ),
            is_leader: Gauge::new("slotlease_is_leader", "1 while this process leads the pool"),
            granted_slot,
            tick_duration: Histogram::new(
                "slotlease_tick_duration_seconds",
                "Controller tick latency",
            ),
        }
    }

    /// Export all metrics in Prometheus text format
    pub fn export(&self) -> String {
        let mut output = String::new();

        for counter in [
            &self.leader_acquired,
            &self.leader_lost,
            &self.member_leases_created,
            &self.slots_claimed,
            &self.slots_lost,
            &self.renew_failures,
            &self.tick_failures,
        ] {
            output.push_str(&counter.to_prometheus());
        }

        output.push_str(&self.is_leader.to_prometheus());
        output.push_str(&self.granted_slot.to_prometheus());
        output.push_str(&self.tick_duration.to_prometheus());

        output
    }
}

impl Default for PoolMetrics {
    fn default() -> Self {
        Self::new()
    }
}
