//! Container Operator
//!
//! Drives one named container on one host towards a desired `ContainerSpec`.
//! Drift is detected only through the hash label: an equal hash leaves the
//! container alone, a different one replaces it.

pub mod ecr;
pub mod hash;
pub mod registry;

use crate::backoff::RetryPolicy;
use crate::error::EngineError;
use futures::StreamExt;
use futures::stream::BoxStream;
use hash::{HASH_LABEL, labelled};
use host_driver::{ContainerSpec, HostConnection, HostError};
use registry::Registries;
use std::fmt;
use tracing::{debug, info, warn};

pub use hash::{NAME_LABEL, ROLE_LABEL, spec_hash};

/// Seconds a container gets to stop before it is killed
const STOP_TIMEOUT_SECS: i64 = 10;
/// Log lines attached to a failed one-shot container
const FAILURE_LOG_LINES: usize = 50;

/// What `ensure` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// The container did not exist
    Created,
    /// Same hash, but it was stopped
    Started,
    /// Hash differed; replaced
    Updated,
    Unchanged,
}

impl fmt::Display for EnsureOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "Created",
            Self::Started => "Started",
            Self::Updated => "Updated",
            Self::Unchanged => "Unchanged",
        })
    }
}

fn host_error(conn: &HostConnection, component: &str) -> impl Fn(HostError) -> EngineError + use<> {
    let host = conn.address().to_string();
    let component = component.to_string();
    move |e| EngineError::host(&host, &component, e)
}

/// Container lifecycle on hosts
#[derive(Debug, Clone)]
pub struct ContainerOperator {
    registries: Registries,
    retry: RetryPolicy,
}

impl ContainerOperator {
    #[must_use]
    pub fn new(registries: Registries, retry: RetryPolicy) -> Self {
        Self { registries, retry }
    }

    #[must_use]
    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    /// Pull `image` unless present, retrying transient failures
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ImagePullFailed` once retries are exhausted.
    pub async fn pull(&self, conn: &HostConnection, component: &str, image: &str) -> Result<(), EngineError> {
        let to_engine = host_error(conn, component);
        if conn.docker().image_exists(image).await.map_err(&to_engine)? {
            debug!("[{}] Image {} already present on host {}", component, image, conn.address());
            return Ok(());
        }
        let auth = self.registries.auth_for(image).await?;
        info!("[{}] Pulling image {} on host {}", component, image, conn.address());
        let what = format!("pull of {image} on {}", conn.address());
        self.retry
            .run(
                &what,
                |e: &EngineError| e.is_transient() || matches!(e, EngineError::ImagePullFailed { .. }),
                || async { conn.docker().pull_image(image, auth.as_ref()).await.map_err(&to_engine) },
            )
            .await
    }

    /// Whether a container named `name` exists
    ///
    /// # Errors
    ///
    /// Returns a host error if Docker cannot be queried.
    pub async fn exists(&self, conn: &HostConnection, name: &str) -> Result<bool, EngineError> {
        Ok(conn
            .docker()
            .inspect_container(name)
            .await
            .map_err(host_error(conn, name))?
            .is_some())
    }

    /// Whether the container on the host already carries the hash of `spec`
    ///
    /// # Errors
    ///
    /// Returns a host error if the container cannot be inspected.
    pub async fn is_current(&self, conn: &HostConnection, role: &str, spec: &ContainerSpec) -> Result<bool, EngineError> {
        let wanted = spec_hash(&labelled(spec.clone(), role));
        let observed = conn
            .docker()
            .inspect_container(&spec.name)
            .await
            .map_err(host_error(conn, &spec.name))?;
        Ok(observed.is_some_and(|c| c.labels.get(HASH_LABEL) == Some(&wanted)))
    }

    /// Converge `spec` and start it
    ///
    /// # Errors
    ///
    /// Returns the host error of the failing pull, create or start.
    pub async fn ensure(&self, conn: &HostConnection, role: &str, spec: ContainerSpec) -> Result<EnsureOutcome, EngineError> {
        self.converge(conn, role, spec, true).await
    }

    /// Converge `spec` without starting it (sidekick-style containers)
    ///
    /// # Errors
    ///
    /// Returns the host error of the failing pull or create.
    pub async fn ensure_created(
        &self,
        conn: &HostConnection,
        role: &str,
        spec: ContainerSpec,
    ) -> Result<EnsureOutcome, EngineError> {
        self.converge(conn, role, spec, false).await
    }

    async fn converge(
        &self,
        conn: &HostConnection,
        role: &str,
        spec: ContainerSpec,
        start: bool,
    ) -> Result<EnsureOutcome, EngineError> {
        let spec = labelled(spec, role);
        let name = spec.name.clone();
        let to_engine = host_error(conn, &name);
        let observed = conn.docker().inspect_container(&name).await.map_err(&to_engine)?;

        let outcome = match observed {
            None => {
                self.pull(conn, &name, &spec.image).await?;
                conn.docker().create_container(&spec).await.map_err(&to_engine)?;
                if start {
                    conn.docker().start_container(&name).await.map_err(&to_engine)?;
                }
                EnsureOutcome::Created
            }
            Some(current) if current.labels.get(HASH_LABEL) == spec.labels.get(HASH_LABEL) => {
                if start && !current.running {
                    conn.docker().start_container(&name).await.map_err(&to_engine)?;
                    EnsureOutcome::Started
                } else {
                    EnsureOutcome::Unchanged
                }
            }
            Some(current) => {
                self.pull(conn, &name, &spec.image).await?;
                debug!("[{}] Replacing container on host {} (image {} -> {})", role, conn.address(), current.image, spec.image);
                if current.running {
                    conn.docker().stop_container(&name, STOP_TIMEOUT_SECS).await.map_err(&to_engine)?;
                }
                conn.docker().remove_container(&name).await.map_err(&to_engine)?;
                conn.docker().create_container(&spec).await.map_err(&to_engine)?;
                if start {
                    conn.docker().start_container(&name).await.map_err(&to_engine)?;
                }
                EnsureOutcome::Updated
            }
        };
        if outcome != EnsureOutcome::Unchanged {
            info!("[{}] Container {} on host {}: {}", role, name, conn.address(), outcome);
        }
        Ok(outcome)
    }

    /// Stop and remove `name`; `false` if it did not exist
    ///
    /// # Errors
    ///
    /// Returns a host error if Docker refuses the removal.
    pub async fn remove(&self, conn: &HostConnection, name: &str) -> Result<bool, EngineError> {
        let to_engine = host_error(conn, name);
        let Some(current) = conn.docker().inspect_container(name).await.map_err(&to_engine)? else {
            return Ok(false);
        };
        if current.running {
            conn.docker().stop_container(name, STOP_TIMEOUT_SECS).await.map_err(&to_engine)?;
        }
        conn.docker().remove_container(name).await.map_err(&to_engine)?;
        info!("Removed container {} on host {}", name, conn.address());
        Ok(true)
    }

    /// Stop `name` if it runs
    ///
    /// # Errors
    ///
    /// Returns a host error if Docker refuses the stop.
    pub async fn stop(&self, conn: &HostConnection, name: &str) -> Result<(), EngineError> {
        let to_engine = host_error(conn, name);
        if let Some(current) = conn.docker().inspect_container(name).await.map_err(&to_engine)? {
            if current.running {
                conn.docker().stop_container(name, STOP_TIMEOUT_SECS).await.map_err(&to_engine)?;
            }
        }
        Ok(())
    }

    /// Restart `name` so it re-reads files on disk (certificates)
    ///
    /// # Errors
    ///
    /// Returns a host error if the container is missing or refuses to start.
    pub async fn restart(&self, conn: &HostConnection, name: &str) -> Result<(), EngineError> {
        self.stop(conn, name).await?;
        conn.docker().start_container(name).await.map_err(host_error(conn, name))?;
        info!("Restarted container {} on host {}", name, conn.address());
        Ok(())
    }

    /// Log stream of `name`, last `tail` lines first
    pub fn logs<'a>(
        &self,
        conn: &'a HostConnection,
        name: &'a str,
        tail: Option<usize>,
    ) -> BoxStream<'a, Result<String, HostError>> {
        conn.docker().logs(name, tail)
    }

    async fn collect_logs(&self, conn: &HostConnection, name: &str) -> String {
        let lines: Vec<String> = self
            .logs(conn, name, Some(FAILURE_LOG_LINES))
            .filter_map(|line| async move { line.ok() })
            .collect()
            .await;
        lines.join("\n")
    }

    /// Create, start and wait for a one-shot container, then remove it
    ///
    /// A leftover container of the same name is removed first.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ContainerFailed` carrying the container logs on
    /// a non-zero exit.
    pub async fn run_once(&self, conn: &HostConnection, role: &str, spec: ContainerSpec) -> Result<(), EngineError> {
        let spec = labelled(spec, role);
        let name = spec.name.clone();
        let to_engine = host_error(conn, &name);

        self.remove(conn, &name).await?;
        self.pull(conn, &name, &spec.image).await?;
        conn.docker().create_container(&spec).await.map_err(&to_engine)?;
        conn.docker().start_container(&name).await.map_err(&to_engine)?;
        let code = conn.docker().wait_container(&name).await.map_err(&to_engine)?;

        if code != 0 {
            let logs = self.collect_logs(conn, &name).await;
            if let Err(e) = conn.docker().remove_container(&name).await {
                warn!("Failed to remove {} on host {}: {}", name, conn.address(), e);
            }
            return Err(EngineError::ContainerFailed {
                host: conn.address().to_string(),
                component: name,
                reason: format!("exited with code {code}: {logs}"),
            });
        }
        conn.docker().remove_container(&name).await.map_err(&to_engine)?;
        debug!("[{}] {} finished on host {}", role, name, conn.address());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::ecr::AwsEcrTokens;
    use cluster_types::NodeConfig;
    use host_driver::{HostDialer, MockDialer, MockDocker, RestartPolicy};
    use std::sync::Arc;
    use std::time::Duration;

    fn operator() -> ContainerOperator {
        ContainerOperator::new(
            Registries::new(Vec::new(), Arc::new(AwsEcrTokens)),
            RetryPolicy {
                attempts: 3,
                base: Duration::from_millis(1),
                max: Duration::from_millis(2),
            },
        )
    }

    async fn host() -> (HostConnection, MockDocker) {
        let dialer = MockDialer::new();
        let (docker, _) = dialer.add_host("10.0.0.1");
        let node = NodeConfig {
            address: "10.0.0.1".to_string(),
            ..Default::default()
        };
        (dialer.connect(&node).await.unwrap(), docker)
    }

    fn proxy(image: &str) -> ContainerSpec {
        ContainerSpec {
            name: "kube-proxy".to_string(),
            image: image.to_string(),
            cmd: vec!["kube-proxy".to_string()],
            binds: vec!["/etc/kubernetes:/etc/kubernetes:z".to_string()],
            network_mode: "host".to_string(),
            restart_policy: RestartPolicy::Always,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ensure_lifecycle() {
        let (conn, docker) = host().await;
        let op = operator();

        assert_eq!(op.ensure(&conn, "worker", proxy("hyperkube:v1")).await.unwrap(), EnsureOutcome::Created);
        assert_eq!(op.ensure(&conn, "worker", proxy("hyperkube:v1")).await.unwrap(), EnsureOutcome::Unchanged);

        op.stop(&conn, "kube-proxy").await.unwrap();
        assert_eq!(op.ensure(&conn, "worker", proxy("hyperkube:v1")).await.unwrap(), EnsureOutcome::Started);

        assert_eq!(op.ensure(&conn, "worker", proxy("hyperkube:v2")).await.unwrap(), EnsureOutcome::Updated);
        let container = docker.container("kube-proxy").unwrap();
        assert_eq!(container.image, "hyperkube:v2");
        assert!(container.running);
        assert_eq!(container.labels.get(ROLE_LABEL).map(String::as_str), Some("worker"));
        assert_eq!(docker.ops("create").len(), 2);
    }

    #[tokio::test]
    async fn test_pull_retries_then_fails() {
        let (conn, docker) = host().await;
        let op = operator();
        docker.fail_pull("hyperkube:v1", 2);
        op.pull(&conn, "kube-proxy", "hyperkube:v1").await.unwrap();
        assert_eq!(docker.ops("pull").len(), 3);

        docker.fail_pull("hyperkube:v3", 5);
        let err = op.pull(&conn, "kube-proxy", "hyperkube:v3").await.unwrap_err();
        assert!(matches!(err, EngineError::ImagePullFailed { .. }));

        // present images are not pulled again
        op.pull(&conn, "kube-proxy", "hyperkube:v1").await.unwrap();
        assert_eq!(docker.ops("pull").len(), 6);
    }

    #[tokio::test]
    async fn test_run_once_success_and_failure() {
        let (conn, docker) = host().await;
        let op = operator();
        let spec = ContainerSpec {
            name: "cert-deployer".to_string(),
            image: "rke-tools".to_string(),
            ..Default::default()
        };
        op.run_once(&conn, "certificates", spec.clone()).await.unwrap();
        assert!(docker.container("cert-deployer").is_none());

        docker.set_wait_code("cert-deployer", 1);
        docker.set_logs("cert-deployer", vec!["permission denied".to_string()]);
        let err = op.run_once(&conn, "certificates", spec).await.unwrap_err();
        assert!(err.to_string().contains("permission denied"));
        assert!(docker.container("cert-deployer").is_none());
    }

    #[tokio::test]
    async fn test_ensure_created_does_not_start() {
        let (conn, docker) = host().await;
        let op = operator();
        let spec = ContainerSpec {
            name: "service-sidekick".to_string(),
            image: "rke-tools".to_string(),
            ..Default::default()
        };
        assert_eq!(op.ensure_created(&conn, "worker", spec.clone()).await.unwrap(), EnsureOutcome::Created);
        assert!(!docker.container("service-sidekick").unwrap().running);
        assert_eq!(op.ensure_created(&conn, "worker", spec).await.unwrap(), EnsureOutcome::Unchanged);
        assert!(op.remove(&conn, "service-sidekick").await.unwrap());
        assert!(!op.remove(&conn, "service-sidekick").await.unwrap());
    }
}
