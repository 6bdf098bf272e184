//! Kubernetes Client
//!
//! The small slice of the Kubernetes API the provisioner needs once an API
//! server is up: node readiness, cordon/drain/uncordon for worker upgrades,
//! and the ConfigMap plus one-shot Job pair that applies each addon.
//!
//! # Example
//!
//! ```no_run
//! use k8s_client::{KubeApi, KubeClient};
//!
//! # async fn example(kubeconfig: &str) -> Result<(), k8s_client::KubeApiError> {
//! let client = KubeClient::from_kubeconfig(kubeconfig).await?;
//! println!("API server {}", client.server_version().await?);
//! client.cordon("worker-1").await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
#[path = "trait.rs"]
pub mod k8s_trait;
pub mod models;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::{KubeClient, KubeClientFactory, KubeTls};
pub use error::KubeApiError;
pub use k8s_trait::{KubeApi, KubeConnector};
pub use models::*;
#[cfg(feature = "test-util")]
pub use mock::MockKubeApi;
