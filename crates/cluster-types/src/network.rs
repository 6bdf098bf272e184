//! Network, DNS, ingress, monitoring and auth sections

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Overlay network plugin
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct NetworkConfig {
    /// `canal`, `flannel`, `calico` or `none`
    #[serde(default)]
    pub plugin: String,

    /// Plugin specific options (e.g. `flannel_iface`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

/// Authentication settings
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct AuthenticationConfig {
    /// Only `x509` is supported
    #[serde(default)]
    pub strategy: String,

    /// Extra SANs for the API server certificate
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sans: Vec<String>,
}

/// Authorization settings
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct AuthorizationConfig {
    /// `rbac` or `none`
    #[serde(default)]
    pub mode: String,
}

impl AuthorizationConfig {
    /// Whether RBAC is enabled
    #[must_use]
    pub fn rbac(&self) -> bool {
        self.mode == "rbac"
    }
}

/// Cluster DNS addon
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct DnsConfig {
    /// `coredns`, `kube-dns` or `none`
    #[serde(default)]
    pub provider: String,

    /// Upstream resolvers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstreamnameservers: Vec<String>,
}

/// Metrics addon
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct MonitoringConfig {
    /// `metrics-server` or `none`
    #[serde(default)]
    pub provider: String,
}

/// Ingress controller addon
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct IngressConfig {
    /// `nginx` or `none`
    #[serde(default)]
    pub provider: String,

    /// Node selector for the controller daemonset
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}
