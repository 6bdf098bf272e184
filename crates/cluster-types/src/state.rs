//! Persisted cluster state
//!
//! The state file (`<stem>.rkestate`) holds the desired and the current
//! `ClusterState`. The current state is also stored in the datastore so a
//! missing state file can be recovered.

use crate::cluster_spec::ClusterSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One certificate, key or kubeconfig of the bundle in its persisted form
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificatePki {
    /// Bundle entry name (`kube-apiserver`, `kube-etcd-10-0-0-1`, ...)
    pub name: String,
    /// PEM certificate; empty for the service-account key
    #[serde(default)]
    pub certificate_pem: String,
    /// PEM private key
    #[serde(default)]
    pub key_pem: String,
    /// Subject common name
    #[serde(default)]
    pub common_name: String,
    /// Subject organization
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ou_name: String,
    /// Host path of the certificate
    #[serde(default)]
    pub path: String,
    /// Host path of the key
    #[serde(default)]
    pub key_path: String,
    /// Rendered kubeconfig, when the entry has one
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config: String,
    /// Host path of the kubeconfig
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config_path: String,
    /// Environment variable carrying the certificate into the deployer
    #[serde(default)]
    pub env_name: String,
    /// Environment variable carrying the key
    #[serde(default)]
    pub key_env_name: String,
    /// Environment variable carrying the kubeconfig
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config_env_name: String,
}

/// A converged (or requested) cluster
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    /// The applied cluster file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rke_config: Option<ClusterSpec>,

    /// Certificates keyed by entry name
    #[serde(default)]
    pub certificates_bundle: BTreeMap<String, CertificatePki>,

    /// Rendered secrets encryption provider file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_config: Option<String>,

    /// Incremented on every successful convergence
    #[serde(default)]
    pub revision: u64,

    /// Time of the convergence that wrote this state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ClusterState {
    /// Whether a cluster has ever been brought up from this state
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.rke_config.is_some() && !self.certificates_bundle.is_empty()
    }
}

/// Contents of the state file
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FullState {
    /// What the last `up` asked for
    #[serde(default)]
    pub desired_state: ClusterState,
    /// What the last successful `up` produced
    #[serde(default)]
    pub current_state: ClusterState,
}

impl FullState {
    /// Parse the JSON state file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::State` for malformed JSON.
    pub fn from_json(input: &str) -> Result<Self, crate::ConfigError> {
        serde_json::from_str(input).map_err(crate::ConfigError::State)
    }

    /// Serialize for the state file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::State` if serialization fails.
    pub fn to_json(&self) -> Result<String, crate::ConfigError> {
        serde_json::to_string_pretty(self).map_err(crate::ConfigError::State)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_file_uses_camel_case_keys() {
        let mut state = FullState::default();
        state.current_state.revision = 3;
        let json = state.to_json().unwrap();
        assert!(json.contains("\"currentState\""));
        assert!(json.contains("\"desiredState\""));
        assert!(json.contains("\"certificatesBundle\""));

        let parsed = FullState::from_json(&json).unwrap();
        assert_eq!(parsed.current_state.revision, 3);
    }

    #[test]
    fn test_empty_state_is_not_installed() {
        assert!(!ClusterState::default().is_installed());
    }
}
