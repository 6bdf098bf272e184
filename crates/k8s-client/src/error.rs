//! Kubernetes API errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KubeApiError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid kubeconfig: {0}")]
    Kubeconfig(String),

    #[error("TLS material rejected: {0}")]
    Tls(String),

    #[error("Timed out after {secs}s waiting for {what}")]
    Timeout { what: String, secs: u64 },

    #[error("Job {name} failed: {reason}")]
    JobFailed { name: String, reason: String },

    #[error("Node {0} not found")]
    NodeNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Wait error: {0}")]
    Wait(String),
}

