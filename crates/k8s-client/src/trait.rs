//! Kubernetes API traits for mocking

use crate::error::KubeApiError;
use crate::models::{AddonJob, JobInfo, JobState};
use std::sync::Arc;
use std::time::Duration;

/// Operations the provisioner performs against a running cluster
#[async_trait::async_trait]
pub trait KubeApi: Send + Sync {
    /// `gitVersion` reported by the API server
    async fn server_version(&self) -> Result<String, KubeApiError>;

    /// `Some(ready)` for a registered node, `None` if it has not registered
    async fn node_ready(&self, node: &str) -> Result<Option<bool>, KubeApiError>;

    /// Mark a node unschedulable
    async fn cordon(&self, node: &str) -> Result<(), KubeApiError>;

    /// Mark a node schedulable again
    async fn uncordon(&self, node: &str) -> Result<(), KubeApiError>;

    /// Evict every pod on the node except mirror and DaemonSet pods and wait
    /// for them to go away
    async fn drain(&self, node: &str, timeout: Duration) -> Result<(), KubeApiError>;

    /// Create or update the addon ConfigMap in the system namespace
    async fn apply_config_map(&self, name: &str, manifest: &str) -> Result<(), KubeApiError>;

    /// Ensure the addon job service account and its `cluster-admin` binding
    async fn ensure_job_deployer(&self) -> Result<(), KubeApiError>;

    /// Look up a job in the system namespace
    async fn get_job(&self, name: &str) -> Result<Option<JobInfo>, KubeApiError>;

    /// Create an addon job
    async fn create_job(&self, job: &AddonJob) -> Result<(), KubeApiError>;

    /// Delete a job and its pods, waiting until it is gone
    async fn delete_job(&self, name: &str) -> Result<(), KubeApiError>;

    /// Wait for the job to complete or fail
    ///
    /// Returns `Complete` or an error: `JobFailed` when the job failed,
    /// `Timeout` when neither condition appeared in time.
    async fn wait_job(&self, name: &str, timeout: Duration) -> Result<JobState, KubeApiError>;

    /// Replace every Secret unchanged so the API server stores it again with
    /// the current encryption provider; returns how many were written
    async fn rewrite_secrets(&self) -> Result<usize, KubeApiError>;
}

/// Builds `KubeApi` handles and probes API server health
#[async_trait::async_trait]
pub trait KubeConnector: Send + Sync {
    /// Client for the cluster described by `kubeconfig` (YAML)
    async fn connect(&self, kubeconfig: &str) -> Result<Arc<dyn KubeApi>, KubeApiError>;

    /// `GET <server>/healthz` over TLS; `true` when the body is `ok`
    async fn healthz(&self, server: &str) -> Result<bool, KubeApiError>;
}
