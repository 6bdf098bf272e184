//! Runtime settings read from the environment.
//!
//! The cluster file describes the cluster; these knobs tune how a run
//! talks to it.

use crate::backoff::RetryPolicy;
use crate::error::EngineError;
use pki::{KeyAlgorithm, PkiOptions};
use std::time::Duration;

/// Upper bound on concurrent host tasks
pub const MAX_FAN_OUT: usize = 50;
/// Default readiness timeout for etcd and API servers
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(300);
/// Timeout of a single drain
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(120);

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// `RKE_MAX_PARALLEL`
    pub max_parallel: usize,
    /// `RKE_SSH_PASSPHRASE`
    pub ssh_passphrase: Option<String>,
    /// `RKE_CA_KEY_ALGORITHM` and `RKE_LEAF_KEY_ALGORITHM`
    pub pki: PkiOptions,
    /// `RKE_READY_TIMEOUT` in seconds
    pub ready_timeout: Duration,
    /// Interval between readiness polls
    pub poll_interval: Duration,
    /// Image pull retries
    pub pull_retry: RetryPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel: MAX_FAN_OUT,
            ssh_passphrase: None,
            pki: PkiOptions::default(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            poll_interval: Duration::from_secs(5),
            pull_retry: RetryPolicy::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ConfigInvalid` for malformed values.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ConfigInvalid` for malformed values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
        let mut config = Self::default();

        if let Some(raw) = lookup("RKE_MAX_PARALLEL") {
            let parsed: usize = raw
                .trim()
                .parse()
                .map_err(|e| EngineError::ConfigInvalid(format!("RKE_MAX_PARALLEL={raw}: {e}")))?;
            if parsed == 0 {
                return Err(EngineError::ConfigInvalid("RKE_MAX_PARALLEL must be at least 1".to_string()));
            }
            config.max_parallel = parsed;
        }

        config.ssh_passphrase = lookup("RKE_SSH_PASSPHRASE").filter(|p| !p.is_empty());

        if let Some(raw) = lookup("RKE_CA_KEY_ALGORITHM") {
            config.pki.ca_algorithm = parse_algorithm("RKE_CA_KEY_ALGORITHM", &raw)?;
        }
        if let Some(raw) = lookup("RKE_LEAF_KEY_ALGORITHM") {
            config.pki.leaf_algorithm = parse_algorithm("RKE_LEAF_KEY_ALGORITHM", &raw)?;
        }

        if let Some(raw) = lookup("RKE_READY_TIMEOUT") {
            let secs: u64 = raw
                .trim()
                .parse()
                .map_err(|e| EngineError::ConfigInvalid(format!("RKE_READY_TIMEOUT={raw}: {e}")))?;
            config.ready_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Concurrent host tasks for a cluster of `hosts`
    #[must_use]
    pub fn fan_out(&self, hosts: usize) -> usize {
        hosts.min(self.max_parallel).max(1)
    }
}

fn parse_algorithm(var: &str, raw: &str) -> Result<KeyAlgorithm, EngineError> {
    raw.parse()
        .map_err(|e| EngineError::ConfigInvalid(format!("{var}={raw}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.max_parallel, MAX_FAN_OUT);
        assert_eq!(config.fan_out(3), 3);
        assert_eq!(config.fan_out(200), 50);
        assert_eq!(config.fan_out(0), 1);
        assert!(config.ssh_passphrase.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("RKE_MAX_PARALLEL", "4"),
            ("RKE_SSH_PASSPHRASE", "hunter2"),
            ("RKE_LEAF_KEY_ALGORITHM", "ecdsa-p256"),
            ("RKE_READY_TIMEOUT", "60"),
        ]))
        .unwrap();
        assert_eq!(config.fan_out(10), 4);
        assert_eq!(config.ssh_passphrase.as_deref(), Some("hunter2"));
        assert_eq!(config.pki.leaf_algorithm, KeyAlgorithm::EcdsaP256);
        assert_eq!(config.ready_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(RuntimeConfig::from_lookup(lookup(&[("RKE_MAX_PARALLEL", "0")])).is_err());
        assert!(RuntimeConfig::from_lookup(lookup(&[("RKE_MAX_PARALLEL", "many")])).is_err());
        assert!(RuntimeConfig::from_lookup(lookup(&[("RKE_CA_KEY_ALGORITHM", "dsa")])).is_err());
    }
}
