//! Configuration for the agent.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root node id. Resolved from the store when unset.
    pub root_id: Option<String>,

    /// JSON file of nodes to preload into the store.
    pub seed_file: Option<PathBuf>,

    /// Interval between periodic manager rescans.
    pub scan_interval: Duration,

    /// How long managers wait for clients to stop.
    pub shutdown_grace: Duration,

    /// How long to wait for the store before giving up on startup.
    pub startup_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_id: None,
            seed_file: None,
            scan_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(10),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let secs = |name: &str, default: Duration| -> Result<Duration> {
            match lookup(name) {
                Some(raw) => {
                    let secs: u64 = raw.trim().parse().with_context(|| {
                        format!("{name} must be a whole number of seconds, got {raw:?}")
                    })?;
                    Ok(Duration::from_secs(secs))
                }
                None => Ok(default),
            }
        };

        let root_id = lookup("NODEMESH_ROOT_ID").filter(|s| !s.is_empty());
        let seed_file = lookup("NODEMESH_SEED_FILE")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let scan_interval = secs("NODEMESH_SCAN_INTERVAL_SECS", defaults.scan_interval)?;
        if scan_interval.is_zero() {
            anyhow::bail!("NODEMESH_SCAN_INTERVAL_SECS must be greater than zero");
        }

        Ok(Self {
            root_id,
            seed_file,
            scan_interval,
            shutdown_grace: secs("NODEMESH_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace)?,
            startup_timeout: secs("NODEMESH_STARTUP_TIMEOUT_SECS", defaults.startup_timeout)?,
            log_level: lookup("NODEMESH_LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }
}
