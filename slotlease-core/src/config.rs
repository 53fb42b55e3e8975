//! Pool configuration
//!
//! Loaded from environment variables or JSON, then validated once at
//! startup. Invalid configuration is fatal.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, SlotLeaseError};
use crate::lease::member_lease_name;
use crate::{
    DEFAULT_AWAIT_TIMEOUT_SECS, DEFAULT_INITIAL_DELAY_MAX_SECS, DEFAULT_INITIAL_DELAY_MIN_SECS,
    DEFAULT_LEASE_TTL_SECS, DEFAULT_TICK_INTERVAL_SECS,
};

/// Longest lease name the platform accepts
const MAX_LEASE_NAME_LEN: usize = 253;

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Lease settings for one role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Time without renewal after which the lease may be taken over
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
    /// Whether this process takes part in the role at all
    pub enabled: bool,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_LEASE_TTL_SECS),
            enabled: true,
        }
    }
}

/// Delay before a controller's first tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum InitialDelay {
    /// Uniformly random in `[min, max)`, spreading out fleet-wide startup
    Random {
        #[serde(with = "duration_secs")]
        min: Duration,
        #[serde(with = "duration_secs")]
        max: Duration,
    },
    /// Fixed delay
    Fixed {
        #[serde(with = "duration_secs")]
        after: Duration,
    },
}

impl InitialDelay {
    /// Draw the delay for one controller start
    pub fn pick(&self) -> Duration {
        match self {
            InitialDelay::Fixed { after } => *after,
            InitialDelay::Random { min, max } if max > min => {
                let millis = rand::thread_rng().gen_range(min.as_millis()..max.as_millis());
                Duration::from_millis(millis as u64)
            }
            InitialDelay::Random { min, .. } => *min,
        }
    }
}

impl Default for InitialDelay {
    fn default() -> Self {
        InitialDelay::Random {
            min: Duration::from_secs(DEFAULT_INITIAL_DELAY_MIN_SECS),
            max: Duration::from_secs(DEFAULT_INITIAL_DELAY_MAX_SECS),
        }
    }
}

/// Scheduling for one periodic controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Time between ticks
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    pub initial_delay: InitialDelay,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_TICK_INTERVAL_SECS),
            initial_delay: InitialDelay::default(),
        }
    }
}

/// Complete configuration of one process's pool participation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool name; names and labels every lease of the pool
    pub pool_name: String,
    pub leader_lease: LeaseConfig,
    pub member_lease: LeaseConfig,
    pub leader_scheduler: SchedulerConfig,
    pub member_scheduler: SchedulerConfig,
    /// Report unready while no member lease is held
    pub require_lease: bool,
    /// How long startup waits for a slot
    #[serde(with = "duration_secs")]
    pub await_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_name: String::new(),
            leader_lease: LeaseConfig::default(),
            member_lease: LeaseConfig::default(),
            leader_scheduler: SchedulerConfig::default(),
            member_scheduler: SchedulerConfig::default(),
            require_lease: true,
            await_timeout: Duration::from_secs(DEFAULT_AWAIT_TIMEOUT_SECS),
        }
    }
}

fn invalid(reason: impl Into<String>) -> SlotLeaseError {
    SlotLeaseError::Configuration {
        reason: reason.into(),
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(format!("{} has unparseable value {:?}", key, raw))),
        Err(_) => Ok(None),
    }
}

impl PoolConfig {
    /// Defaults for the named pool
    pub fn new(pool_name: impl Into<String>) -> Self {
        Self {
            pool_name: pool_name.into(),
            ..Default::default()
        }
    }

    /// Load from `SLOTLEASE_*` environment variables over the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(name) = parse_env::<String>("SLOTLEASE_POOL_NAME")? {
            config.pool_name = name;
        }
        if let Some(secs) = parse_env::<u64>("SLOTLEASE_LEADER_TTL_SECS")? {
            config.leader_lease.ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64>("SLOTLEASE_MEMBER_TTL_SECS")? {
            config.member_lease.ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64>("SLOTLEASE_LEADER_INTERVAL_SECS")? {
            config.leader_scheduler.interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64>("SLOTLEASE_MEMBER_INTERVAL_SECS")? {
            config.member_scheduler.interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64>("SLOTLEASE_INITIAL_DELAY_SECS")? {
            let fixed = InitialDelay::Fixed {
                after: Duration::from_secs(secs),
            };
            config.leader_scheduler.initial_delay = fixed.clone();
            config.member_scheduler.initial_delay = fixed;
        }
        if let Some(enabled) = parse_env::<bool>("SLOTLEASE_LEADER_ENABLED")? {
            config.leader_lease.enabled = enabled;
        }
        if let Some(enabled) = parse_env::<bool>("SLOTLEASE_MEMBER_ENABLED")? {
            config.member_lease.enabled = enabled;
        }
        if let Some(required) = parse_env::<bool>("SLOTLEASE_REQUIRE_LEASE")? {
            config.require_lease = required;
        }
        if let Some(secs) = parse_env::<u64>("SLOTLEASE_AWAIT_TIMEOUT_SECS")? {
            config.await_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<()> {
        let pool = &self.pool_name;
        if pool.is_empty() {
            return Err(invalid("pool name is required"));
        }
        let valid_chars = pool
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
        if !valid_chars || pool.starts_with('-') || pool.ends_with('-') {
            return Err(invalid(format!(
                "pool name {:?} must be lowercase alphanumerics and '-'",
                pool
            )));
        }
        if member_lease_name(pool, 0).len() > MAX_LEASE_NAME_LEN {
            return Err(invalid(format!("pool name {:?} is too long", pool)));
        }

        for (role, lease, scheduler) in [
            ("leader", &self.leader_lease, &self.leader_scheduler),
            ("member", &self.member_lease, &self.member_scheduler),
        ] {
            if lease.ttl.is_zero() {
                return Err(invalid(format!("{} lease TTL must be positive", role)));
            }
            if scheduler.interval.is_zero() {
                return Err(invalid(format!("{} interval must be positive", role)));
            }
            if scheduler.interval >= lease.ttl {
                return Err(invalid(format!(
                    "{} interval {:?} must be shorter than its lease TTL {:?}",
                    role, scheduler.interval, lease.ttl
                )));
            }
            if let InitialDelay::Random { min, max } = &scheduler.initial_delay {
                if min > max {
                    return Err(invalid(format!("{} initial delay range is inverted", role)));
                }
            }
        }

        if self.await_timeout.is_zero() {
            return Err(invalid("await timeout must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_need_pool_name() {
        assert!(PoolConfig::default().validate().unwrap_err().is_fatal());
        PoolConfig::new("mypool").validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_pool_names() {
        for name in ["MyPool", "-pool", "pool-", "my_pool", "pool.x"] {
            assert!(PoolConfig::new(name).validate().is_err(), "{} accepted", name);
        }
        assert!(PoolConfig::new("a".repeat(250)).validate().is_err());
    }

    #[test]
    fn test_interval_must_undercut_ttl() {
        let mut config = PoolConfig::new("mypool");
        config.member_scheduler.interval = config.member_lease.ttl;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_random_delay_in_range() {
        let delay = InitialDelay::default();
        for _ in 0..100 {
            let d = delay.pick();
            assert!(d >= Duration::from_secs(5) && d < Duration::from_secs(11));
        }
        let fixed = InitialDelay::Fixed {
            after: Duration::from_secs(2),
        };
        assert_eq!(fixed.pick(), Duration::from_secs(2));
    }

    #[test]
    fn test_from_json_partial() {
        let config = PoolConfig::from_json(
            r#"{
                "pool_name": "jobs",
                "member_lease": { "ttl": 15, "enabled": true },
                "member_scheduler": { "interval": 5, "initial_delay": { "mode": "fixed", "after": 0 } }
            }"#,
        )
        .unwrap();
        assert_eq!(config.pool_name, "jobs");
        assert_eq!(config.member_lease.ttl, Duration::from_secs(15));
        assert_eq!(config.member_scheduler.initial_delay.pick(), Duration::ZERO);
        assert_eq!(config.leader_lease, LeaseConfig::default());
        assert!(config.require_lease);
    }
}
