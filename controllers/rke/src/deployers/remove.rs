//! Removal of containers and departing hosts
//!
//! Removals run workers first, then the control plane; hosts leaving the
//! cluster are wiped by the cleanup container last. Unreachable hosts are
//! skipped with a warning.

use super::{Deployers, by_host};
use crate::engine::plan::{CLEANUP, PlanStep};
use crate::engine::scheduler::barrier;
use crate::error::EngineError;
use crate::services::{ETCD_CONTAINER, KUBERNETES_CONTAINERS, ROLLING_SNAPSHOT_CONTAINER, TOOLS_ROLE, controlplane, tools};
use cluster_types::{NodeConfig, Role};
use tracing::{info, warn};

const COMPONENT: &str = "remove";

impl Deployers<'_> {
    async fn remove_on_host(&self, address: &str, names: &[String], cleanup: bool) -> Result<(), EngineError> {
        let Ok(conn) = self.hosts.get(address, COMPONENT) else {
            warn!("[remove] Host {} is unreachable, skipping {}", address, names.join(", "));
            return Ok(());
        };
        for name in names {
            self.operator.remove(conn, name).await?;
        }
        if cleanup {
            info!("[remove] Cleaning up host {}", address);
            self.operator.run_once(conn, TOOLS_ROLE, tools::cleanup(self.ctx)?).await?;
        }
        Ok(())
    }

    async fn remove_phase(&self, phase: &[(String, Vec<String>, bool)]) -> Result<(), EngineError> {
        let results = self
            .scheduler
            .run_parallel(phase.iter(), |(address, names, cleanup)| async move {
                self.remove_on_host(address, names, *cleanup).await
            })
            .await;
        barrier(COMPONENT, results)?;
        Ok(())
    }

    /// Run the removal layer
    ///
    /// # Errors
    ///
    /// Fails when a reachable host refuses a removal.
    pub async fn remove_components(&self, steps: &[PlanStep]) -> Result<(), EngineError> {
        let mut workers = Vec::new();
        let mut control_plane = Vec::new();
        let mut cleanups = Vec::new();
        for (address, steps) in by_host(steps) {
            let (cp, rest): (Vec<&PlanStep>, Vec<&PlanStep>) =
                steps.iter().filter(|s| s.component != CLEANUP).partition(|s| s.role == Role::ControlPlane.as_str());
            let names = |list: Vec<&PlanStep>| list.into_iter().map(|s| s.component.clone()).collect::<Vec<_>>();
            workers.push((address.clone(), names(rest), false));
            control_plane.push((address.clone(), names(cp), false));
            if steps.iter().any(|s| s.component == CLEANUP) {
                cleanups.push((address, Vec::new(), true));
            }
        }
        for phase in [workers, control_plane, cleanups] {
            let phase: Vec<_> = phase.into_iter().filter(|(_, names, cleanup)| !names.is_empty() || *cleanup).collect();
            if !phase.is_empty() {
                self.scheduler.checkpoint()?;
                self.remove_phase(&phase).await?;
            }
        }
        Ok(())
    }

    /// Remove every cluster container from `nodes` and wipe them
    ///
    /// # Errors
    ///
    /// Fails when a reachable host refuses a removal.
    pub async fn teardown(&self, nodes: &[NodeConfig]) -> Result<(), EngineError> {
        let kubernetes: Vec<String> = KUBERNETES_CONTAINERS
            .iter()
            .filter(|n| !controlplane::CONTAINERS.contains(n))
            .map(ToString::to_string)
            .collect();
        let cp: Vec<String> = controlplane::CONTAINERS.iter().map(ToString::to_string).collect();
        let etcd = vec![ROLLING_SNAPSHOT_CONTAINER.to_string(), ETCD_CONTAINER.to_string()];

        info!("[remove] Tearing down {} host(s)", nodes.len());
        for (names, roles) in [
            (&kubernetes, None),
            (&cp, Some(Role::ControlPlane)),
            (&etcd, Some(Role::Etcd)),
        ] {
            let phase: Vec<_> = nodes
                .iter()
                .filter(|n| roles.is_none_or(|r| n.has_role(r)))
                .map(|n| (n.address.clone(), names.clone(), false))
                .collect();
            self.scheduler.checkpoint()?;
            self.remove_phase(&phase).await?;
        }
        let cleanups: Vec<_> = nodes.iter().map(|n| (n.address.clone(), Vec::new(), true)).collect();
        self.remove_phase(&cleanups).await
    }
}
