//! Host driver traits for mocking
//!
//! The engine only talks to hosts through these traits. The SSH/bollard
//! implementations live in `dialer.rs`, `tunnel.rs` and `client.rs`; tests use
//! the in-memory implementations from `mock` (feature `test-util`).

use crate::connection::HostConnection;
use crate::error::HostError;
use crate::models::{ContainerInfo, ContainerSpec, DockerInfo, ExecOutput, RegistryAuth};
use cluster_types::NodeConfig;
use futures::stream::BoxStream;

/// Docker Engine operations used by the container operator
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait DockerApi: Send + Sync {
    /// Daemon version and kernel facts
    async fn info(&self) -> Result<DockerInfo, HostError>;

    /// Inspect a container by name; `None` when it does not exist
    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>, HostError>;

    /// All containers (running or not) carrying the label key `label`
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerInfo>, HostError>;

    /// Whether the image is present locally
    async fn image_exists(&self, image: &str) -> Result<bool, HostError>;

    /// Pull an image, optionally authenticated
    async fn pull_image(&self, image: &str, auth: Option<&RegistryAuth>) -> Result<(), HostError>;

    /// Create a container, returning its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, HostError>;

    /// Start a created or stopped container
    async fn start_container(&self, name: &str) -> Result<(), HostError>;

    /// Stop a running container
    async fn stop_container(&self, name: &str, timeout_secs: i64) -> Result<(), HostError>;

    /// Force-remove a container and its anonymous volumes
    async fn remove_container(&self, name: &str) -> Result<(), HostError>;

    /// Block until the container exits, returning its exit code
    async fn wait_container(&self, name: &str) -> Result<i64, HostError>;

    /// Run a command inside a running container
    async fn exec(&self, container: &str, cmd: &[String]) -> Result<ExecOutput, HostError>;

    /// Stream stdout/stderr lines of a container, last `tail` lines first
    fn logs<'a>(&'a self, name: &'a str, tail: Option<usize>) -> BoxStream<'a, Result<String, HostError>>;
}

/// Short-lived commands on the host itself
#[async_trait::async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `command` through the login shell and capture its output
    async fn run(&self, command: &str) -> Result<ExecOutput, HostError>;
}

/// Opens a `HostConnection` for a node
#[async_trait::async_trait]
pub trait HostDialer: Send + Sync {
    /// Connect to `node`: SSH session, forwarded Docker socket, compatibility check
    async fn connect(&self, node: &NodeConfig) -> Result<HostConnection, HostError>;
}
