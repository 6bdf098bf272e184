//! Datastore client errors

use thiserror::Error;

/// Errors that can occur when talking to the etcd ensemble
#[derive(Debug, Error)]
pub enum DatastoreError {
    /// etcd gRPC error
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    /// Health endpoint request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Client certificate material could not be loaded
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// No endpoint answered
    #[error("No etcd endpoint reachable: {0}")]
    Unreachable(String),

    /// The requested change would break quorum
    #[error("Quorum violation: {0}")]
    QuorumViolation(String),

    /// Member or key not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored value could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid request (bad snapshot name, empty endpoint list)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}
