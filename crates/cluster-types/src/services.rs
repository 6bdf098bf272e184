//! Per-component service options

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Options shared by every component container
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct BaseService {
    /// Image override for this component
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    /// Extra `--key=value` flags; an empty value removes a default flag
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_args: BTreeMap<String, String>,

    /// Extra `host:container[:opts]` binds
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_binds: Vec<String>,

    /// Extra `KEY=value` environment entries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_env: Vec<String>,
}

/// S3 target for snapshot upload
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct S3BackupConfig {
    /// Access key
    #[serde(default)]
    pub access_key: String,
    /// Secret key
    #[serde(default)]
    pub secret_key: String,
    /// Bucket name
    #[serde(default)]
    pub bucket_name: String,
    /// Bucket region
    #[serde(default)]
    pub region: String,
    /// Endpoint, defaults to `s3.amazonaws.com`
    #[serde(default)]
    pub endpoint: String,
    /// Folder inside the bucket
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub folder: String,
}

/// Recurring snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct BackupConfig {
    /// Run the rolling snapshot sidecar
    #[serde(default)]
    pub enabled: bool,
    /// Hours between snapshots
    #[serde(default)]
    pub interval_hours: u32,
    /// Snapshots to keep
    #[serde(default)]
    pub retention: u32,
    /// Optional S3 upload target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_backup_config: Option<S3BackupConfig>,
}

/// etcd options
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct EtcdService {
    /// Shared options
    #[serde(flatten)]
    pub base: BaseService,

    /// Endpoints of an externally managed etcd
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_urls: Vec<String>,

    /// CA for the external etcd
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_cert: String,

    /// Client certificate for the external etcd
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cert: String,

    /// Client key for the external etcd
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,

    /// Key prefix used by the API server
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    /// Recurring snapshots
    #[serde(default)]
    pub backup_config: BackupConfig,
}

/// kube-apiserver options
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct KubeApiService {
    /// Shared options
    #[serde(flatten)]
    pub base: BaseService,

    /// Service network CIDR
    #[serde(default)]
    pub service_cluster_ip_range: String,

    /// NodePort range
    #[serde(default)]
    pub service_node_port_range: String,

    /// Encryption at rest of Secrets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_encryption_config: Option<SecretsEncryptionConfig>,
}

/// Secrets encryption provider settings
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct SecretsEncryptionConfig {
    #[serde(default)]
    pub enabled: bool,

    /// `EncryptionConfiguration` document used verbatim. Without it an
    /// aescbc key is generated once and kept in the cluster state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_config: Option<serde_json::Value>,
}

impl KubeApiService {
    /// Settings when secrets encryption is turned on
    #[must_use]
    pub fn encryption(&self) -> Option<&SecretsEncryptionConfig> {
        self.secrets_encryption_config.as_ref().filter(|c| c.enabled)
    }
}

/// kube-controller-manager options
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct KubeControllerService {
    /// Shared options
    #[serde(flatten)]
    pub base: BaseService,

    /// Pod network CIDR
    #[serde(default)]
    pub cluster_cidr: String,

    /// Service network CIDR
    #[serde(default)]
    pub service_cluster_ip_range: String,
}

/// kubelet options
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct KubeletService {
    /// Shared options
    #[serde(flatten)]
    pub base: BaseService,

    /// Cluster DNS domain
    #[serde(default)]
    pub cluster_domain: String,

    /// Pause image override
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub infra_container_image: String,

    /// Cluster DNS service address
    #[serde(default)]
    pub cluster_dns_server: String,

    /// Refuse to start with swap on
    #[serde(default)]
    pub fail_swap_on: bool,
}

/// All component sections
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct ServicesConfig {
    /// etcd
    #[serde(default)]
    pub etcd: EtcdService,

    /// kube-apiserver
    #[serde(default, rename = "kube-api")]
    pub kube_api: KubeApiService,

    /// kube-controller-manager
    #[serde(default, rename = "kube-controller")]
    pub kube_controller: KubeControllerService,

    /// kube-scheduler
    #[serde(default)]
    pub scheduler: BaseService,

    /// kubelet
    #[serde(default)]
    pub kubelet: KubeletService,

    /// kube-proxy
    #[serde(default)]
    pub kubeproxy: BaseService,
}
