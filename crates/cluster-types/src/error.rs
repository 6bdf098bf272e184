//! Cluster file errors

use thiserror::Error;

/// Errors raised while loading or validating a cluster file or state file
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The cluster file is not valid YAML for the schema
    #[error("Failed to parse cluster file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The state file is not valid JSON for the schema
    #[error("Failed to parse state file: {0}")]
    State(serde_json::Error),

    /// The cluster file parsed but violates a rule
    #[error("Invalid cluster configuration: {0}")]
    Invalid(String),

    /// A referenced file could not be read
    #[error("Failed to read {path}: {source}")]
    Io {
        /// Offending path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    /// Create a validation error with the given message
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}
