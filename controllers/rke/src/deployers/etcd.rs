//! etcd deployer
//!
//! Membership changes and member upgrades belong to the Datastore
//! Coordinator; this layer decides when to call it and handles the
//! snapshot sidecars and certificate restarts.

use super::Deployers;
use crate::datastore::DatastoreCoordinator;
use crate::engine::plan::{Action, PlanStep};
use crate::error::EngineError;
use crate::services::{ETCD_CONTAINER, ROLLING_SNAPSHOT_CONTAINER};
use cluster_types::{NodeConfig, Role};
use datastore_client::EtcdConnector;
use std::sync::Arc;
use tracing::info;

impl Deployers<'_> {
    /// Coordinator over this run's hosts
    #[must_use]
    pub fn coordinator(&self, etcd: Arc<dyn EtcdConnector>) -> DatastoreCoordinator<'_> {
        DatastoreCoordinator::new(self.ctx, self.operator, etcd, self.ready_timeout, self.poll_interval)
    }

    /// Run the etcd layer
    ///
    /// `previous` are the etcd hosts of the last run. With `gate` the layer
    /// ends by waiting for a healthy ensemble even when nothing changed.
    ///
    /// # Errors
    ///
    /// Any failure is fatal: quorum violations, members that do not become
    /// healthy, and sidecar failures.
    pub async fn deploy_etcd(
        &self,
        etcd: Arc<dyn EtcdConnector>,
        steps: &[PlanStep],
        previous: &[NodeConfig],
        gate: bool,
    ) -> Result<(), EngineError> {
        if self.ctx.spec.uses_external_etcd() {
            return Ok(());
        }
        let coordinator = self.coordinator(etcd);
        let membership = steps
            .iter()
            .any(|s| s.component == ETCD_CONTAINER && !s.is_noop() && !s.is_restart());
        if membership {
            info!("[etcd] Reconciling ensemble");
            coordinator.reconcile(self.hosts, previous).await?;
        }

        let restarts: Vec<&PlanStep> = steps
            .iter()
            .filter(|s| s.component == ETCD_CONTAINER && s.is_restart())
            .collect();
        for step in restarts {
            self.scheduler.checkpoint()?;
            let node = self.node(&step.host)?;
            info!("[etcd] Restarting member on host {} for new certificates", step.host);
            coordinator.restart_member(self.hosts, node).await?;
        }

        if steps
            .iter()
            .any(|s| s.component == ROLLING_SNAPSHOT_CONTAINER && s.action != Action::Noop)
        {
            coordinator.ensure_rolling_snapshots(self.hosts).await?;
        }

        if gate && !membership {
            let members = self.ctx.spec.nodes_with_role(Role::Etcd);
            coordinator.wait_healthy(self.hosts, &members).await?;
        }
        Ok(())
    }
}
