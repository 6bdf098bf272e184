//! controlplane deployer
//!
//! New hosts start in parallel, apiserver first. Hosts that already run a
//! control plane are rolled one at a time, scheduler and controller-manager
//! before the apiserver, with a `/healthz` gate after each host. A host that
//! only restarts for new certificates goes controller-manager, scheduler,
//! then apiserver.

use super::{Deployers, by_host};
use crate::engine::plan::{Action, PlanStep};
use crate::engine::scheduler::barrier;
use crate::error::EngineError;
use crate::services::{KUBE_APISERVER_CONTAINER, KUBE_CONTROLLER_CONTAINER, KUBE_SCHEDULER_CONTAINER};
use tracing::info;

const COMPONENT: &str = "controlplane";

/// Rolling order within a host
fn upgrade_rank(component: &str) -> usize {
    match component {
        KUBE_SCHEDULER_CONTAINER => 0,
        KUBE_CONTROLLER_CONTAINER => 1,
        KUBE_APISERVER_CONTAINER => 2,
        _ => 3,
    }
}

/// Order of a host whose steps only restart containers
fn restart_rank(component: &str) -> usize {
    match component {
        KUBE_CONTROLLER_CONTAINER => 0,
        KUBE_SCHEDULER_CONTAINER => 1,
        KUBE_APISERVER_CONTAINER => 2,
        _ => 3,
    }
}

fn rolling_order(steps: &mut [PlanStep]) {
    if steps.iter().all(PlanStep::is_restart) {
        steps.sort_by_key(|s| restart_rank(&s.component));
    } else {
        steps.sort_by_key(|s| upgrade_rank(&s.component));
    }
}

impl Deployers<'_> {
    async fn converge_host(&self, address: &str, steps: &[PlanStep]) -> Result<(), EngineError> {
        let conn = self.hosts.get(address, COMPONENT)?;
        for step in steps {
            let spec = self.desired_spec(address, &step.component)?;
            self.apply(conn, step, spec).await?;
        }
        if steps.iter().any(|s| s.component == KUBE_APISERVER_CONTAINER) {
            self.wait_api(self.node(address)?).await?;
        }
        Ok(())
    }

    /// Run the controlplane layer
    ///
    /// # Errors
    ///
    /// Every failure is fatal; a rolling upgrade stops at the first failing
    /// host and leaves upgraded hosts at the new version.
    pub async fn deploy_control_plane(&self, steps: &[PlanStep]) -> Result<(), EngineError> {
        let (fresh, rolling): (Vec<_>, Vec<_>) = by_host(steps)
            .into_iter()
            .partition(|(_, steps)| steps.iter().all(|s| s.action == Action::Deploy));

        if !rolling.is_empty() {
            info!("[controlplane] Rolling {} host(s)", rolling.len());
        }
        self.scheduler
            .run_serial(rolling, |(address, mut steps)| async move {
                rolling_order(&mut steps);
                info!("[controlplane] Upgrading host {}", address);
                self.converge_host(&address, &steps).await
            })
            .await?;

        if !fresh.is_empty() {
            info!("[controlplane] Starting control plane on {} host(s)", fresh.len());
        }
        let results = self
            .scheduler
            .run_parallel(fresh, |(address, steps)| async move { self.converge_host(&address, &steps).await })
            .await;
        barrier(COMPONENT, results)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::plan::{CERTIFICATES, RESTART_PARAM};

    fn components(steps: &[PlanStep]) -> Vec<&str> {
        steps.iter().map(|s| s.component.as_str()).collect()
    }

    #[test]
    fn test_upgrade_order() {
        let mut steps: Vec<PlanStep> = [KUBE_APISERVER_CONTAINER, KUBE_CONTROLLER_CONTAINER, KUBE_SCHEDULER_CONTAINER]
            .iter()
            .map(|c| PlanStep::new("10.0.0.1", COMPONENT, c, Action::Upgrade))
            .collect();
        rolling_order(&mut steps);
        assert_eq!(
            components(&steps),
            vec![KUBE_SCHEDULER_CONTAINER, KUBE_CONTROLLER_CONTAINER, KUBE_APISERVER_CONTAINER]
        );
    }

    #[test]
    fn test_certificate_restart_order() {
        let mut steps: Vec<PlanStep> = [KUBE_APISERVER_CONTAINER, KUBE_SCHEDULER_CONTAINER, KUBE_CONTROLLER_CONTAINER]
            .iter()
            .map(|c| PlanStep::new("10.0.0.1", COMPONENT, c, Action::Upgrade).with_param(RESTART_PARAM, CERTIFICATES))
            .collect();
        rolling_order(&mut steps);
        assert_eq!(
            components(&steps),
            vec![KUBE_CONTROLLER_CONTAINER, KUBE_SCHEDULER_CONTAINER, KUBE_APISERVER_CONTAINER]
        );

        // one real upgrade puts the host back on the upgrade order
        steps[2] = PlanStep::new("10.0.0.1", COMPONENT, KUBE_APISERVER_CONTAINER, Action::Upgrade);
        rolling_order(&mut steps);
        assert_eq!(components(&steps)[0], KUBE_SCHEDULER_CONTAINER);
    }
}
