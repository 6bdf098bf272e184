//! PKI errors

use thiserror::Error;

/// Errors raised while generating, loading or verifying certificates
#[derive(Debug, Error)]
pub enum PkiError {
    /// The bundle has no CA (or the named issuing CA) to sign with
    #[error("CA certificate {0} not found in bundle")]
    MissingCa(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate generation or signing failed
    #[error("certificate generation failed for {name}: {reason}")]
    Generation {
        /// Bundle entry name
        name: String,
        /// What failed
        reason: String,
    },

    /// PEM or DER could not be parsed
    #[error("certificate parsing error: {0}")]
    Parse(String),

    /// A leaf does not verify against its CA
    #[error("certificate {name} failed verification: {reason}")]
    Verify {
        /// Bundle entry name
        name: String,
        /// Why verification failed
        reason: String,
    },

    /// Unknown key algorithm or rotation target
    #[error("invalid PKI request: {0}")]
    Invalid(String),

    /// Kubeconfig serialization
    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] serde_yaml::Error),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;
