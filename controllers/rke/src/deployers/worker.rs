//! worker deployer
//!
//! Every Kubernetes host runs the sidekick, kubelet and kube-proxy, plus
//! nginx-proxy when it has no control plane. New hosts start in parallel;
//! existing hosts are cordoned, drained, recreated and uncordoned one at a
//! time. Failures here never abort the run.

use super::{Deployers, by_host};
use crate::config::DRAIN_TIMEOUT;
use crate::engine::plan::{Action, PlanStep};
use crate::engine::scheduler::barrier;
use crate::error::EngineError;
use crate::services::{KUBELET_CONTAINER, KUBEPROXY_CONTAINER, NGINX_PROXY_CONTAINER, SIDEKICK_CONTAINER};
use k8s_client::{KubeApi, KubeApiError};
use std::sync::Arc;
use tracing::{info, warn};

const COMPONENT: &str = "worker";

/// Start order within a host; the kubelet comes last
fn start_rank(component: &str) -> usize {
    match component {
        SIDEKICK_CONTAINER => 0,
        NGINX_PROXY_CONTAINER => 1,
        KUBEPROXY_CONTAINER => 2,
        KUBELET_CONTAINER => 3,
        _ => 4,
    }
}

fn failed(host: &str, err: &EngineError) -> EngineError {
    EngineError::WorkerDeployFailed {
        host: host.to_string(),
        reason: err.to_string(),
    }
}

impl Deployers<'_> {
    async fn converge_worker(&self, address: &str, steps: &[PlanStep]) -> Result<(), EngineError> {
        let conn = self.hosts.get(address, COMPONENT)?;
        let mut steps = steps.to_vec();
        steps.sort_by_key(|s| start_rank(&s.component));
        for step in &steps {
            let spec = self.desired_spec(address, &step.component)?;
            self.apply(conn, step, spec).await?;
        }
        Ok(())
    }

    /// Cordon and drain `node`; a node the API does not know is skipped
    async fn drain_node(&self, api: &dyn KubeApi, node: &str) -> Result<bool, EngineError> {
        match api.cordon(node).await {
            Ok(()) => {}
            Err(KubeApiError::NodeNotFound(_)) => {
                warn!("[worker] Node {} is not registered, upgrading without drain", node);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }
        info!("[worker] Draining node {}", node);
        api.drain(node, DRAIN_TIMEOUT).await?;
        Ok(true)
    }

    async fn upgrade_worker(
        &self,
        api: Option<&Arc<dyn KubeApi>>,
        address: &str,
        steps: &[PlanStep],
    ) -> Result<(), EngineError> {
        let node_name = self.node(address)?.hostname().to_string();
        let restart_only = steps.iter().all(PlanStep::is_restart);
        let drained = match api {
            Some(api) if !restart_only => self.drain_node(api.as_ref(), &node_name).await?,
            _ => false,
        };
        self.converge_worker(address, steps).await?;
        if let (true, Some(api)) = (drained, api) {
            api.uncordon(&node_name).await?;
            info!("[worker] Uncordoned node {}", node_name);
        }
        Ok(())
    }

    /// Run the worker layer and return the recorded host failures
    ///
    /// `api` is the cluster API used to drain nodes before an upgrade.
    ///
    /// # Errors
    ///
    /// Fails only when no API server is healthy before the first worker
    /// starts, or on cancellation.
    pub async fn deploy_workers(
        &self,
        api: Option<Arc<dyn KubeApi>>,
        steps: &[PlanStep],
    ) -> Result<Vec<EngineError>, EngineError> {
        if steps.is_empty() {
            return Ok(Vec::new());
        }
        self.wait_any_api().await?;

        let (fresh, rolling): (Vec<_>, Vec<_>) = by_host(steps)
            .into_iter()
            .partition(|(_, steps)| steps.iter().all(|s| s.action == Action::Deploy));
        let mut recorded = Vec::new();

        if !fresh.is_empty() {
            info!("[worker] Starting node components on {} host(s)", fresh.len());
        }
        let results = self
            .scheduler
            .run_parallel(fresh, |(address, steps)| async move {
                self.converge_worker(&address, &steps)
                    .await
                    .map_err(|e| if matches!(e, EngineError::Cancelled) { e } else { failed(&address, &e) })
            })
            .await;
        let (_, failures) = barrier(COMPONENT, results)?;
        recorded.extend(failures);

        for (address, steps) in rolling {
            self.scheduler.checkpoint()?;
            info!("[worker] Upgrading host {}", address);
            if let Err(e) = self.upgrade_worker(api.as_ref(), &address, &steps).await {
                warn!("[worker] Upgrade of host {} failed, stopping the worker rollout: {}", address, e);
                recorded.push(failed(&address, &e));
                break;
            }
        }
        Ok(recorded)
    }
}
