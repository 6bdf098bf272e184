//! Engine error types.
//!
//! Every variant carries enough context (host, component) to be reported on
//! its own. The scheduler decides whether a given error is fatal for the run.

use cluster_types::ConfigError;
use datastore_client::DatastoreError;
use host_driver::HostError;
use k8s_client::KubeApiError;
use pki::PkiError;
use thiserror::Error;

/// Errors surfaced by the reconciliation engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Schema violation or a logical rule such as an even etcd count
    #[error("Invalid cluster configuration: {0}")]
    ConfigInvalid(String),

    #[error("[{component}] host {host} is unreachable: {reason}")]
    HostUnreachable {
        host: String,
        component: String,
        reason: String,
    },

    #[error("[{component}] Docker is unavailable on {host}: {reason}")]
    DockerUnavailable {
        host: String,
        component: String,
        reason: String,
    },

    #[error("[{component}] host {host} is incompatible: {reason}")]
    HostIncompatible {
        host: String,
        component: String,
        reason: String,
    },

    #[error("[{component}] failed to pull {image} on {host}: {reason}")]
    ImagePullFailed {
        host: String,
        component: String,
        image: String,
        reason: String,
    },

    /// Create, start or run failure of a single container
    #[error("[{component}] container failed on {host}: {reason}")]
    ContainerFailed {
        host: String,
        component: String,
        reason: String,
    },

    #[error("Certificate generation failed: {0}")]
    CertGenerationFailed(String),

    #[error("Quorum violation: {0}")]
    QuorumViolation(String),

    #[error("[{component}] not ready on {host} after {secs}s")]
    ComponentNotReady {
        host: String,
        component: String,
        secs: u64,
    },

    /// etcd membership, snapshot or restore failure
    #[error("[{component}] datastore failure: {reason}")]
    Datastore { component: String, reason: String },

    #[error("[addons] failed to apply {addon}: {reason}")]
    AddonApplyFailed { addon: String, reason: String },

    #[error("[worker] deploy failed on {host}: {reason}")]
    WorkerDeployFailed { host: String, reason: String },

    #[error("Kubernetes API error: {0}")]
    Kube(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Operation aborted: {0}")]
    Aborted(String),

    #[error("Run cancelled")]
    Cancelled,
}

impl EngineError {
    /// Attach host and component context to a host driver error
    #[must_use]
    pub fn host(host: &str, component: &str, err: HostError) -> Self {
        let component = component.to_string();
        match err {
            HostError::Unreachable { host, reason } => Self::HostUnreachable { host, component, reason },
            HostError::DockerUnavailable { host, reason } => Self::DockerUnavailable { host, component, reason },
            HostError::Incompatible { host, reason } => Self::HostIncompatible { host, component, reason },
            HostError::ImagePull { image, reason } => Self::ImagePullFailed {
                host: host.to_string(),
                component,
                image,
                reason,
            },
            other => Self::ContainerFailed {
                host: host.to_string(),
                component,
                reason: other.to_string(),
            },
        }
    }

    /// Attach a component to a datastore error
    #[must_use]
    pub fn datastore(component: &str, err: DatastoreError) -> Self {
        match err {
            DatastoreError::QuorumViolation(reason) => Self::QuorumViolation(reason),
            other => Self::Datastore {
                component: component.to_string(),
                reason: other.to_string(),
            },
        }
    }

    /// Host the error happened on
    #[must_use]
    pub fn host_address(&self) -> Option<&str> {
        match self {
            Self::HostUnreachable { host, .. }
            | Self::DockerUnavailable { host, .. }
            | Self::HostIncompatible { host, .. }
            | Self::ImagePullFailed { host, .. }
            | Self::ContainerFailed { host, .. }
            | Self::ComponentNotReady { host, .. }
            | Self::WorkerDeployFailed { host, .. } => Some(host),
            _ => None,
        }
    }

    /// Errors recorded in the summary instead of aborting the run
    #[must_use]
    pub fn is_non_fatal(&self) -> bool {
        matches!(self, Self::AddonApplyFailed { .. } | Self::WorkerDeployFailed { .. })
    }

    /// Whether retrying the same call may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::HostUnreachable { .. } | Self::DockerUnavailable { .. })
    }

    /// Process exit code for this error
    ///
    /// `0` success, `1` user error, `2` host-level failure, `3` datastore
    /// failure, `4` partial success on workers.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigInvalid(_) | Self::Aborted(_) => 1,
            Self::QuorumViolation(_) | Self::Datastore { .. } => 3,
            Self::ComponentNotReady { component, .. } if component == "etcd" => 3,
            Self::AddonApplyFailed { .. } | Self::WorkerDeployFailed { .. } => 4,
            _ => 2,
        }
    }
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        Self::ConfigInvalid(err.to_string())
    }
}

impl From<PkiError> for EngineError {
    fn from(err: PkiError) -> Self {
        match err {
            PkiError::Invalid(msg) => Self::ConfigInvalid(msg),
            other => Self::CertGenerationFailed(other.to_string()),
        }
    }
}

impl From<KubeApiError> for EngineError {
    fn from(err: KubeApiError) -> Self {
        Self::Kube(err.to_string())
    }
}
