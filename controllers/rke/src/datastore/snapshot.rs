//! Snapshot save, list and removal across the etcd hosts

use super::{COMPONENT, DatastoreCoordinator};
use crate::error::EngineError;
use crate::hosts::Hosts;
use crate::services::etcd::{remove_s3_snapshot, rolling_snapshots, snapshot_once};
use crate::services::{ROLLING_SNAPSHOT_CONTAINER, TOOLS_ROLE};
use cluster_types::{NodeConfig, Role, S3BackupConfig};
use datastore_client::snapshot::{LIST_SNAPSHOTS_COMMAND, normalize_restore_name, parse_listing, snapshot_path};
use datastore_client::SnapshotFile;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// A snapshot and the hosts holding a copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotListing {
    pub file: SnapshotFile,
    pub hosts: Vec<String>,
}

impl DatastoreCoordinator<'_> {
    pub(super) fn s3(&self) -> Option<&S3BackupConfig> {
        self.ctx.spec.services.etcd.backup_config.s3_backup_config.as_ref()
    }

    /// Start or drop the rolling snapshot sidecar on every etcd host
    ///
    /// # Errors
    ///
    /// Fails when a sidecar cannot be converged.
    pub async fn ensure_rolling_snapshots(&self, hosts: &Hosts) -> Result<(), EngineError> {
        let enabled = self.ctx.spec.services.etcd.backup_config.enabled;
        for node in self.desired() {
            let conn = hosts.get(&node.address, COMPONENT)?;
            if enabled {
                let spec = rolling_snapshots(self.ctx, &node)?;
                self.operator.ensure(conn, Role::Etcd.as_str(), spec).await?;
            } else if self.operator.remove(conn, ROLLING_SNAPSHOT_CONTAINER).await? {
                info!("[etcd] Removed rolling snapshots on host {}", node.address);
            }
        }
        Ok(())
    }

    /// Save snapshot `name` on every healthy etcd host
    ///
    /// Only the first host uploads to S3, so the bucket holds one copy.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Datastore` when no member is healthy, or the
    /// error of the first failing snapshot container.
    pub async fn save_snapshot(&self, hosts: &Hosts, name: &str) -> Result<Vec<String>, EngineError> {
        let nodes = self.desired();
        let observation = self.observe(hosts, &nodes).await?;
        let healthy: Vec<&NodeConfig> = nodes.iter().filter(|n| observation.healthy.contains(&n.address)).collect();
        if healthy.is_empty() {
            return Err(EngineError::Datastore {
                component: COMPONENT.to_string(),
                reason: "no healthy etcd member to snapshot".to_string(),
            });
        }
        let mut saved = Vec::with_capacity(healthy.len());
        for (i, node) in healthy.into_iter().enumerate() {
            let conn = hosts.get(&node.address, COMPONENT)?;
            let s3 = if i == 0 { self.s3() } else { None };
            info!("[etcd] Saving snapshot {} on host {}", name, node.address);
            self.operator.run_once(conn, TOOLS_ROLE, snapshot_once(self.ctx, node, name, s3)?).await?;
            saved.push(node.address.clone());
        }
        Ok(saved)
    }

    /// Snapshots present on the etcd hosts, newest first
    ///
    /// Hosts that cannot be listed are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Fails only when no etcd host is connected.
    pub async fn list_snapshots(&self, hosts: &Hosts) -> Result<Vec<SnapshotListing>, EngineError> {
        let nodes = self.desired();
        let mut by_name: BTreeMap<String, SnapshotListing> = BTreeMap::new();
        let mut listed = 0usize;
        for node in &nodes {
            let Ok(conn) = hosts.get(&node.address, COMPONENT) else {
                continue;
            };
            let output = match conn.run_checked(LIST_SNAPSHOTS_COMMAND).await {
                Ok(output) => output,
                Err(e) => {
                    warn!("[etcd] Failed to list snapshots on host {}: {}", node.address, e);
                    continue;
                }
            };
            listed += 1;
            for file in parse_listing(&output.stdout) {
                by_name
                    .entry(file.name.clone())
                    .and_modify(|l| {
                        l.hosts.push(node.address.clone());
                        if file.modified > l.file.modified {
                            l.file = file.clone();
                        }
                    })
                    .or_insert_with(|| SnapshotListing {
                        file: file.clone(),
                        hosts: vec![node.address.clone()],
                    });
            }
        }
        if listed == 0 {
            return Err(EngineError::HostUnreachable {
                host: nodes.first().map_or_else(String::new, |n| n.address.clone()),
                component: COMPONENT.to_string(),
                reason: "no etcd host could be listed".to_string(),
            });
        }
        let mut out: Vec<SnapshotListing> = by_name.into_values().collect();
        out.sort_by(|a, b| b.file.modified.cmp(&a.file.modified).then_with(|| a.file.name.cmp(&b.file.name)));
        Ok(out)
    }

    /// Delete snapshot `name` from every etcd host and from S3
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ConfigInvalid` for an invalid name, or the
    /// first host failure.
    pub async fn remove_snapshot(&self, hosts: &Hosts, name: &str) -> Result<(), EngineError> {
        let name = normalize_restore_name(name).map_err(|e| EngineError::ConfigInvalid(e.to_string()))?;
        let nodes = self.desired();
        for node in &nodes {
            let conn = hosts.get(&node.address, COMPONENT)?;
            let command = format!("rm -f '{}' '{}.zip'", snapshot_path(&name), snapshot_path(&name));
            conn.run_checked(&command)
                .await
                .map_err(|e| EngineError::host(&node.address, COMPONENT, e))?;
            info!("[etcd] Removed snapshot {} on host {}", name, node.address);
        }
        if let (Some(s3), Some(node)) = (self.s3(), nodes.first()) {
            let conn = hosts.get(&node.address, COMPONENT)?;
            self.operator
                .run_once(conn, TOOLS_ROLE, remove_s3_snapshot(self.ctx, node, &name, s3)?)
                .await?;
            info!("[etcd] Removed snapshot {} from bucket {}", name, s3.bucket_name);
        }
        Ok(())
    }
}
