//! Restore of the ensemble from a snapshot

use super::{COMPONENT, DatastoreCoordinator};
use crate::error::EngineError;
use crate::hosts::Hosts;
use crate::services::etcd::{self, EtcdBootstrap, download_snapshot, restore_container};
use crate::services::{ETCD_CONTAINER, KUBE_APISERVER_CONTAINER, ROLLING_SNAPSHOT_CONTAINER, TOOLS_ROLE};
use cluster_types::Role;
use datastore_client::snapshot::{normalize_restore_name, snapshot_path};
use tracing::info;

impl DatastoreCoordinator<'_> {
    /// Rebuild the ensemble from snapshot `name`
    ///
    /// The snapshot is fetched from S3 when a bucket is configured and must
    /// otherwise exist on every etcd host. API servers are stopped first and
    /// removed once etcd is healthy again; the next `up` recreates them.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ConfigInvalid` for an invalid name,
    /// `EngineError::Datastore` when a host lacks the snapshot, or the
    /// failure of any restore step.
    pub async fn restore(&self, hosts: &Hosts, name: &str) -> Result<(), EngineError> {
        let name = normalize_restore_name(name).map_err(|e| EngineError::ConfigInvalid(e.to_string()))?;
        let members = self.desired();
        let control_plane = self.ctx.spec.nodes_with_role(Role::ControlPlane);

        for node in &members {
            let conn = hosts.get(&node.address, COMPONENT)?;
            if let Some(s3) = self.s3() {
                info!("[etcd] Downloading snapshot {} to host {}", name, node.address);
                self.operator
                    .run_once(conn, TOOLS_ROLE, download_snapshot(self.ctx, node, &name, s3)?)
                    .await?;
            }
            let present = conn
                .run(&format!("test -f '{}'", snapshot_path(&name)))
                .await
                .map_err(|e| EngineError::host(&node.address, COMPONENT, e))?;
            if !present.success() {
                return Err(EngineError::Datastore {
                    component: COMPONENT.to_string(),
                    reason: format!("snapshot {name} not found on host {}", node.address),
                });
            }
        }

        for node in &control_plane {
            let conn = hosts.get(&node.address, KUBE_APISERVER_CONTAINER)?;
            self.operator.stop(conn, KUBE_APISERVER_CONTAINER).await?;
        }
        for node in &members {
            let conn = hosts.get(&node.address, COMPONENT)?;
            self.operator.remove(conn, ROLLING_SNAPSHOT_CONTAINER).await?;
            self.operator.remove(conn, ETCD_CONTAINER).await?;
        }

        let bootstrap = EtcdBootstrap::new_cluster(&etcd::new_token(), &members);
        for node in &members {
            let conn = hosts.get(&node.address, COMPONENT)?;
            info!("[etcd] Restoring snapshot {} on host {}", name, node.address);
            self.operator
                .run_once(conn, TOOLS_ROLE, restore_container(self.ctx, node, &name, &bootstrap)?)
                .await?;
        }
        self.start_all(hosts, &members, &bootstrap).await?;
        self.wait_healthy(hosts, &members).await?;

        for node in &control_plane {
            let conn = hosts.get(&node.address, KUBE_APISERVER_CONTAINER)?;
            self.operator.remove(conn, KUBE_APISERVER_CONTAINER).await?;
        }
        info!("[etcd] Restored {} member(s) from snapshot {}", members.len(), name);
        Ok(())
    }
}
