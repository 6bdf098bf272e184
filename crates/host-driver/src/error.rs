//! Host driver errors

use thiserror::Error;

/// Errors that can occur when talking to a cluster host
#[derive(Debug, Error)]
pub enum HostError {
    /// SSH connection or authentication failed
    #[error("Host {host} is unreachable: {reason}")]
    Unreachable {
        /// Host address
        host: String,
        /// What failed
        reason: String,
    },

    /// The Docker daemon did not answer over the tunnel
    #[error("Docker is unavailable on host {host}: {reason}")]
    DockerUnavailable {
        /// Host address
        host: String,
        /// What failed
        reason: String,
    },

    /// Kernel or Docker version below the supported minimum
    #[error("Host {host} is incompatible: {reason}")]
    Incompatible {
        /// Host address
        host: String,
        /// Which check failed
        reason: String,
    },

    /// Docker Engine API error
    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Docker refused a request (also raised by the mock)
    #[error("Docker API error: {0}")]
    Api(String),

    /// Pulling an image failed
    #[error("Failed to pull image {image}: {reason}")]
    ImagePull {
        /// Image reference
        image: String,
        /// Daemon message
        reason: String,
    },

    /// Container does not exist
    #[error("Container not found: {0}")]
    NotFound(String),

    /// Remote shell command exited non-zero
    #[error("Command `{command}` failed on {host} with exit code {code}: {stderr}")]
    Command {
        /// Host address
        host: String,
        /// Command line
        command: String,
        /// Exit code
        code: i64,
        /// Captured stderr
        stderr: String,
    },

    /// Local socket or file error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    /// Whether retrying the same call may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HostError::Unreachable { .. } | HostError::DockerUnavailable { .. } | HostError::Io(_)
        ) || matches!(self, HostError::Docker(bollard::errors::Error::RequestTimeoutError))
    }
}
