//! Docker-facing data types
//!
//! These are the only container shapes the rest of the workspace sees; the
//! bollard types stay inside `client.rs`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Restart policy of a container
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart (one-shot containers)
    #[default]
    No,
    /// Always restart
    Always,
    /// Restart unless stopped by the operator
    UnlessStopped,
    /// Restart on non-zero exit
    OnFailure,
}

impl RestartPolicy {
    /// Docker's name for the policy
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::Always => "always",
            RestartPolicy::UnlessStopped => "unless-stopped",
            RestartPolicy::OnFailure => "on-failure",
        }
    }
}

/// Desired configuration of a named container
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ContainerSpec {
    /// Container name, unique per host
    pub name: String,
    /// Image reference
    pub image: String,
    /// Command (arguments after the entrypoint)
    #[serde(default)]
    pub cmd: Vec<String>,
    /// Entrypoint override
    #[serde(default)]
    pub entrypoint: Vec<String>,
    /// `KEY=value` entries
    #[serde(default)]
    pub env: Vec<String>,
    /// `host:container[:opts]` binds
    #[serde(default)]
    pub binds: Vec<String>,
    /// Added capabilities
    #[serde(default)]
    pub cap_add: Vec<String>,
    /// `host` or empty for the default bridge
    #[serde(default)]
    pub network_mode: String,
    /// `host` or empty
    #[serde(default)]
    pub pid_mode: String,
    /// Run privileged
    #[serde(default)]
    pub privileged: bool,
    /// Restart policy
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// Docker labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Containers whose volumes are mounted
    #[serde(default)]
    pub volumes_from: Vec<String>,
}

/// Observed container
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ContainerInfo {
    /// Container id
    pub id: String,
    /// Container name without the leading `/`
    pub name: String,
    /// Image reference it was created from
    pub image: String,
    /// Command
    #[serde(default)]
    pub cmd: Vec<String>,
    /// Environment
    #[serde(default)]
    pub env: Vec<String>,
    /// Binds
    #[serde(default)]
    pub binds: Vec<String>,
    /// Labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Whether the container is running
    pub running: bool,
    /// Exit code of the last run, if it exited
    #[serde(default)]
    pub exit_code: Option<i64>,
}

/// Daemon facts used for the compatibility check
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DockerInfo {
    /// Docker server version, e.g. `24.0.7`
    pub server_version: String,
    /// Kernel version as seen by the daemon
    pub kernel_version: String,
    /// Host operating system
    pub operating_system: String,
}

/// Credentials for one registry
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegistryAuth {
    /// Username
    pub username: String,
    /// Password or token
    pub password: String,
    /// Registry server address
    pub server_address: String,
}

/// Result of a command run on a host or inside a container
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    /// Exit status
    pub exit_code: i64,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl ExecOutput {
    /// Whether the command exited zero
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
