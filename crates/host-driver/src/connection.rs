//! A live connection to one host
//!
//! Owned by the task servicing the host for the duration of a run and closed
//! unconditionally at the end of it.

use crate::docker_trait::{DockerApi, RemoteShell};
use crate::error::HostError;
use crate::models::{DockerInfo, ExecOutput};
use crate::tunnel::SshTunnel;
use cluster_types::NodeConfig;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Docker client and remote shell bound to one host
pub struct HostConnection {
    node: NodeConfig,
    docker: Arc<dyn DockerApi>,
    shell: Arc<dyn RemoteShell>,
    info: DockerInfo,
    tunnel: Option<SshTunnel>,
}

impl fmt::Debug for HostConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostConnection")
            .field("address", &self.node.address)
            .field("docker_version", &self.info.server_version)
            .finish_non_exhaustive()
    }
}

impl HostConnection {
    /// Assemble a connection from its parts
    pub fn new(
        node: NodeConfig,
        docker: Arc<dyn DockerApi>,
        shell: Arc<dyn RemoteShell>,
        info: DockerInfo,
        tunnel: Option<SshTunnel>,
    ) -> Self {
        Self {
            node,
            docker,
            shell,
            info,
            tunnel,
        }
    }

    /// The node this connection serves
    #[must_use]
    pub fn node(&self) -> &NodeConfig {
        &self.node
    }

    /// SSH address
    #[must_use]
    pub fn address(&self) -> &str {
        &self.node.address
    }

    /// Docker client over the tunnel
    #[must_use]
    pub fn docker(&self) -> &dyn DockerApi {
        self.docker.as_ref()
    }

    /// Daemon facts captured at connect time
    #[must_use]
    pub fn docker_info(&self) -> &DockerInfo {
        &self.info
    }

    /// Run a command on the host
    ///
    /// # Errors
    ///
    /// Returns the transport error from the shell.
    pub async fn run(&self, command: &str) -> Result<ExecOutput, HostError> {
        self.shell.run(command).await
    }

    /// Run a command and fail on a non-zero exit
    ///
    /// # Errors
    ///
    /// Returns `HostError::Command` when the command exits non-zero.
    pub async fn run_checked(&self, command: &str) -> Result<ExecOutput, HostError> {
        let output = self.shell.run(command).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(HostError::Command {
                host: self.node.address.clone(),
                command: command.to_string(),
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    /// Tear down the tunnel and SSH session
    pub async fn close(self) {
        debug!("Closing connection to host {}", self.node.address);
        if let Some(tunnel) = self.tunnel {
            tunnel.close().await;
        }
    }
}
