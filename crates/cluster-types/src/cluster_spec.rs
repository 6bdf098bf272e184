//! Cluster file model
//!
//! `ClusterSpec` is the desired state read from `cluster.yml`. Keys are
//! snake_case; service sections keep their historical dashed names
//! (`kube-api`, `kube-controller`).

use crate::cloud::CloudProviderConfig;
use crate::network::{
    AuthenticationConfig, AuthorizationConfig, DnsConfig, IngressConfig, MonitoringConfig,
    NetworkConfig,
};
use crate::registry::PrivateRegistry;
use crate::services::ServicesConfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Host role within the cluster
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Runs an etcd member
    Etcd,
    /// Runs kube-apiserver, kube-controller-manager and kube-scheduler
    #[serde(rename = "controlplane")]
    ControlPlane,
    /// Runs kubelet and kube-proxy only
    Worker,
}

impl Role {
    /// Stable lowercase name, also used as the role label value
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Etcd => "etcd",
            Role::ControlPlane => "controlplane",
            Role::Worker => "worker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node taint applied when the kubelet registers
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct Taint {
    /// Taint key
    pub key: String,
    /// Taint value
    #[serde(default)]
    pub value: String,
    /// NoSchedule, PreferNoSchedule or NoExecute
    pub effect: String,
}

impl fmt::Display for Taint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}:{}", self.key, self.value, self.effect)
    }
}

/// One host in the cluster file
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct NodeConfig {
    /// Address used for SSH
    pub address: String,

    /// Address used for intra-cluster traffic (defaults to `address`)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub internal_address: String,

    /// Node name registered in Kubernetes (defaults to `address`)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname_override: String,

    /// SSH port
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub port: String,

    /// SSH user
    #[serde(default)]
    pub user: String,

    /// Inline private key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssh_key: String,

    /// Private key path, overrides the cluster level path
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssh_key_path: String,

    /// Remote Docker socket path
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub docker_socket: String,

    /// Roles carried by the host
    #[serde(default)]
    pub role: Vec<Role>,

    /// Kubernetes node labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Kubernetes node taints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
}

impl NodeConfig {
    /// Name used for the Kubernetes node and etcd member
    #[must_use]
    pub fn hostname(&self) -> &str {
        if self.hostname_override.is_empty() {
            &self.address
        } else {
            &self.hostname_override
        }
    }

    /// Address used for peer and API traffic
    #[must_use]
    pub fn internal_ip(&self) -> &str {
        if self.internal_address.is_empty() {
            &self.address
        } else {
            &self.internal_address
        }
    }

    /// Whether the host carries `role`
    #[must_use]
    pub fn has_role(&self, role: Role) -> bool {
        self.role.contains(&role)
    }

    /// Whether the host runs Kubernetes node components (every role does)
    #[must_use]
    pub fn is_kubernetes_node(&self) -> bool {
        !self.role.is_empty()
    }

    /// Worker without control plane, needs the local API proxy
    #[must_use]
    pub fn needs_api_proxy(&self) -> bool {
        !self.has_role(Role::ControlPlane)
    }
}

/// Restore request embedded in the cluster file
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct RestoreConfig {
    /// Restore from `snapshot_name` on the next `up`
    #[serde(default)]
    pub restore: bool,
    /// Snapshot to restore
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snapshot_name: String,
}

/// Certificate rotation request embedded in the cluster file
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct RotateCertificates {
    /// Also regenerate the CA (restarts every component)
    #[serde(default)]
    pub ca_certificates: bool,
    /// Services whose leaves are rotated; empty means all
    #[serde(default)]
    pub services: Vec<String>,
}

/// Desired state of the cluster
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
pub struct ClusterSpec {
    /// Cluster name used in kubeconfigs
    #[serde(default)]
    pub cluster_name: String,

    /// Target Kubernetes version, e.g. `v1.30.4-rancher1-1`
    #[serde(default)]
    pub kubernetes_version: String,

    /// Hosts
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    /// Per-component options
    #[serde(default)]
    pub services: ServicesConfig,

    /// Overlay network
    #[serde(default)]
    pub network: NetworkConfig,

    /// Authentication options
    #[serde(default)]
    pub authentication: AuthenticationConfig,

    /// Authorization options
    #[serde(default)]
    pub authorization: AuthorizationConfig,

    /// Inline user addon manifests
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub addons: String,

    /// Paths of extra addon manifests
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addons_include: Vec<String>,

    /// Seconds to wait for each addon job
    #[serde(default)]
    pub addon_job_timeout: u64,

    /// Cluster DNS provider
    #[serde(default)]
    pub dns: DnsConfig,

    /// Metrics provider
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Ingress controller
    #[serde(default)]
    pub ingress: IngressConfig,

    /// Private registries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub private_registries: Vec<PrivateRegistry>,

    /// Cloud provider integration
    #[serde(default)]
    pub cloud_provider: CloudProviderConfig,

    /// Image overrides keyed by component (`etcd`, `kubernetes`, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub system_images: BTreeMap<String, String>,

    /// Default SSH private key path
    #[serde(default)]
    pub ssh_key_path: String,

    /// Skip the minimum Docker version check
    #[serde(default)]
    pub ignore_docker_version: bool,

    /// Host path prefix for Kubernetes directories
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix_path: String,

    /// Restore request
    #[serde(default)]
    pub restore: RestoreConfig,

    /// Certificate rotation request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotate_certificates: Option<RotateCertificates>,
}

impl ClusterSpec {
    /// Hosts carrying `role`, in file order
    pub fn hosts_with_role(&self, role: Role) -> impl Iterator<Item = &NodeConfig> {
        self.nodes.iter().filter(move |n| n.has_role(role))
    }

    /// Hosts carrying `role`, cloned
    #[must_use]
    pub fn nodes_with_role(&self, role: Role) -> Vec<NodeConfig> {
        self.hosts_with_role(role).cloned().collect()
    }

    /// Look up a host by address
    #[must_use]
    pub fn node(&self, address: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.address == address)
    }

    /// Whether etcd is managed outside this cluster
    #[must_use]
    pub fn uses_external_etcd(&self) -> bool {
        !self.services.etcd.external_urls.is_empty()
    }

    /// Parse a cluster file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` when the document is not valid YAML for
    /// this schema.
    pub fn from_yaml(input: &str) -> Result<Self, crate::ConfigError> {
        Ok(serde_yaml::from_str(input)?)
    }
}
