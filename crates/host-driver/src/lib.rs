//! Host Driver
//!
//! Opens one SSH session per cluster host, forwards the host's Docker socket
//! through it and exposes the Docker Engine API plus a remote shell over that
//! session.
//!
//! # Example
//!
//! ```no_run
//! use host_driver::{HostDialer, SshDialer, SshOptions};
//! use cluster_types::NodeConfig;
//!
//! # async fn example(node: NodeConfig) -> Result<(), host_driver::HostError> {
//! let dialer = SshDialer::new(SshOptions::default());
//! let conn = dialer.connect(&node).await?;
//! let running = conn.docker().inspect_container("kubelet").await?;
//! println!("kubelet present: {}", running.is_some());
//! conn.close().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod compat;
pub mod connection;
pub mod dialer;
#[path = "trait.rs"]
pub mod docker_trait;
pub mod error;
pub mod models;
pub mod tunnel;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::DockerClient;
pub use connection::HostConnection;
pub use dialer::{SshDialer, SshOptions, expand_home};
pub use docker_trait::{DockerApi, HostDialer, RemoteShell};
pub use error::HostError;
pub use models::*;
#[cfg(feature = "test-util")]
pub use mock::{Journal, JournalEntry, MockDialer, MockDocker, MockShell};
