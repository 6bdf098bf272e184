//! Role Deployers
//!
//! One deployer per layer of the plan. Each consumes the active steps of its
//! layer and drives the Container Operator; drift detection stays with the
//! operator's hash label.

pub mod certs;
pub mod controlplane;
pub mod etcd;
pub mod remove;
pub mod worker;

use crate::engine::plan::PlanStep;
use crate::engine::scheduler::Scheduler;
use crate::error::EngineError;
use crate::hosts::Hosts;
use crate::operator::{ContainerOperator, EnsureOutcome};
use crate::services::{SIDEKICK_CONTAINER, ServiceContext, kubernetes_containers};
use cluster_types::NodeConfig;
use host_driver::{ContainerSpec, HostConnection};
use k8s_client::KubeConnector;
use pki::kubeconfig::api_server_url;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Collaborators shared by every deployer
pub struct Deployers<'a> {
    pub ctx: &'a ServiceContext,
    pub operator: &'a ContainerOperator,
    pub hosts: &'a Hosts,
    pub scheduler: &'a Scheduler,
    pub kube: Arc<dyn KubeConnector>,
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
}

impl std::fmt::Debug for Deployers<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployers")
            .field("hosts", &self.hosts.len())
            .field("ready_timeout", &self.ready_timeout)
            .finish_non_exhaustive()
    }
}

/// Steps grouped by host, hosts in first-seen order
pub(crate) fn by_host(steps: &[PlanStep]) -> Vec<(String, Vec<PlanStep>)> {
    let mut grouped: Vec<(String, Vec<PlanStep>)> = Vec::new();
    for step in steps {
        match grouped.iter_mut().find(|(host, _)| *host == step.host) {
            Some((_, list)) => list.push(step.clone()),
            None => grouped.push((step.host.clone(), vec![step.clone()])),
        }
    }
    grouped
}

impl Deployers<'_> {
    /// Desired node at `address`
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ConfigInvalid` when the cluster file lacks it.
    pub(crate) fn node(&self, address: &str) -> Result<&NodeConfig, EngineError> {
        self.ctx
            .spec
            .node(address)
            .ok_or_else(|| EngineError::ConfigInvalid(format!("host {address} is not in the cluster file")))
    }

    /// Desired spec of `component` on the host at `address`
    pub(crate) fn desired_spec(&self, address: &str, component: &str) -> Result<ContainerSpec, EngineError> {
        let node = self.node(address)?;
        kubernetes_containers(self.ctx, node)?
            .into_iter()
            .map(|(_, spec)| spec)
            .find(|spec| spec.name == component)
            .ok_or_else(|| EngineError::ConfigInvalid(format!("{component} is not desired on host {address}")))
    }

    /// Apply one container step: restart, create-only or converge
    pub(crate) async fn apply(
        &self,
        conn: &HostConnection,
        step: &PlanStep,
        spec: ContainerSpec,
    ) -> Result<EnsureOutcome, EngineError> {
        if step.is_restart() {
            self.operator.restart(conn, &spec.name).await?;
            return Ok(EnsureOutcome::Started);
        }
        if spec.name == SIDEKICK_CONTAINER {
            self.operator.ensure_created(conn, &step.role, spec).await
        } else {
            self.operator.ensure(conn, &step.role, spec).await
        }
    }

    /// Poll `/healthz` of the API server on `node`
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ComponentNotReady` on timeout.
    pub async fn wait_api(&self, node: &NodeConfig) -> Result<(), EngineError> {
        let server = api_server_url(&node.address);
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            match self.kube.healthz(&server).await {
                Ok(true) => {
                    info!("[controlplane] kube-apiserver on host {} is healthy", node.address);
                    return Ok(());
                }
                Ok(false) => debug!("[controlplane] kube-apiserver on host {} not healthy yet", node.address),
                Err(e) => debug!("[controlplane] Health probe of host {} failed: {}", node.address, e),
            }
            if Instant::now() >= deadline {
                return Err(EngineError::ComponentNotReady {
                    host: node.address.clone(),
                    component: crate::services::KUBE_APISERVER_CONTAINER.to_string(),
                    secs: self.ready_timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Wait until any control plane host answers `/healthz`
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ComponentNotReady` when none does in time.
    pub async fn wait_any_api(&self) -> Result<(), EngineError> {
        let nodes = self.ctx.spec.nodes_with_role(cluster_types::Role::ControlPlane);
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            for node in &nodes {
                if matches!(self.kube.healthz(&api_server_url(&node.address)).await, Ok(true)) {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(EngineError::ComponentNotReady {
                    host: nodes.first().map_or_else(String::new, |n| n.address.clone()),
                    component: crate::services::KUBE_APISERVER_CONTAINER.to_string(),
                    secs: self.ready_timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
