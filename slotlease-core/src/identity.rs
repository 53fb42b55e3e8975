//! Process identity resolution
//!
//! A process is known to the pool by its stable name (the holder identity
//! written into leases) and the namespace its leases live in.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Result, SlotLeaseError};

const PROCESS_NAME_ENV: &str = "POD_NAME";
const NAMESPACE_ENV: &str = "POD_NAMESPACE";
const HOSTNAME_ENV: &str = "HOSTNAME";
const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Stable identity of this process
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessIdentity {
    pub name: String,
    pub namespace: String,
}

impl ProcessIdentity {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

/// Resolves this process's name and namespace
pub trait IdentityResolver: Send + Sync {
    /// Holder identity written into leases
    fn process_name(&self) -> Result<String>;

    /// Namespace the pool's leases live in
    fn namespace(&self) -> Result<String>;

    /// Resolve both at once
    fn resolve(&self) -> Result<ProcessIdentity> {
        Ok(ProcessIdentity {
            name: self.process_name()?,
            namespace: self.namespace()?,
        })
    }
}

/// Identity fixed at construction time
#[derive(Debug, Clone)]
pub struct FixedIdentity(pub ProcessIdentity);

impl IdentityResolver for FixedIdentity {
    fn process_name(&self) -> Result<String> {
        Ok(self.0.name.clone())
    }

    fn namespace(&self) -> Result<String> {
        Ok(self.0.namespace.clone())
    }
}

/// Identity from the environment
///
/// The process name comes from `POD_NAME`, then `HOSTNAME`. The namespace
/// comes from `POD_NAMESPACE`, then the mounted service-account file. In
/// dev mode unresolvable values fall back to `dev-<pid>` and `default`.
#[derive(Debug, Clone)]
pub struct EnvIdentity {
    namespace_file: PathBuf,
    dev_mode: bool,
}

impl EnvIdentity {
    pub fn new() -> Self {
        Self {
            namespace_file: PathBuf::from(SERVICE_ACCOUNT_NAMESPACE),
            dev_mode: false,
        }
    }

    /// Resolver that never fails, for local runs outside a cluster
    pub fn dev() -> Self {
        Self {
            dev_mode: true,
            ..Self::new()
        }
    }

    /// Override the service-account namespace file location
    pub fn with_namespace_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.namespace_file = path.into();
        self
    }

    fn read_namespace_file(path: &Path) -> Option<String> {
        let raw = std::fs::read_to_string(path).ok()?;
        non_blank(raw.trim().to_string())
    }
}

impl Default for EnvIdentity {
    fn default() -> Self {
        Self::new()
    }
}

fn non_blank(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(non_blank)
}

impl IdentityResolver for EnvIdentity {
    fn process_name(&self) -> Result<String> {
        if let Some(name) = env_var(PROCESS_NAME_ENV).or_else(|| env_var(HOSTNAME_ENV)) {
            return Ok(name);
        }
        if self.dev_mode {
            let name = format!("dev-{}", std::process::id());
            info!("No process name in environment, using {}", name);
            return Ok(name);
        }
        Err(SlotLeaseError::IdentityUnresolved {
            reason: format!(
                "set {} (or make {} available) on the deployment",
                PROCESS_NAME_ENV, HOSTNAME_ENV
            ),
        })
    }

    fn namespace(&self) -> Result<String> {
        if let Some(ns) = env_var(NAMESPACE_ENV) {
            return Ok(ns);
        }
        if let Some(ns) = Self::read_namespace_file(&self.namespace_file) {
            debug!("Namespace {} read from {}", ns, self.namespace_file.display());
            return Ok(ns);
        }
        if self.dev_mode {
            return Ok("default".into());
        }
        Err(SlotLeaseError::IdentityUnresolved {
            reason: format!(
                "set {} or mount the service account namespace file at {}",
                NAMESPACE_ENV,
                self.namespace_file.display()
            ),
        })
    }
}
