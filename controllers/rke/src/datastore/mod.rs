//! Datastore Coordinator
//!
//! Owns the etcd ensemble: bootstrap of a new cluster, one-at-a-time member
//! addition, quorum-guarded removal and rolling replacement. Every change
//! waits for the whole ensemble to report healthy before the next one.

pub mod restore;
pub mod snapshot;

use crate::error::EngineError;
use crate::hosts::Hosts;
use crate::operator::{ContainerOperator, EnsureOutcome};
use crate::services::etcd::{self, EtcdBootstrap};
use crate::services::{ETCD_CONTAINER, ServiceContext};
use cluster_types::{NodeConfig, Role};
use datastore_client::{
    EnsembleState, EtcdClusterApi, EtcdConnector, EtcdMember, assess, client_url, peer_url, removal_keeps_quorum,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const COMPONENT: &str = "etcd";

/// `nodes` whose etcd container was running, plus `joining`
fn running_members(nodes: &[NodeConfig], observation: &EtcdObservation, joining: Option<&NodeConfig>) -> Vec<NodeConfig> {
    nodes
        .iter()
        .filter(|n| observation.running.contains(&n.address) || joining.is_some_and(|j| j.address == n.address))
        .cloned()
        .collect()
}

/// What the coordinator saw of the ensemble
#[derive(Debug, Clone)]
pub struct EtcdObservation {
    /// Addresses with a running etcd container
    pub running: BTreeSet<String>,
    /// Addresses whose member reports healthy
    pub healthy: BTreeSet<String>,
    /// `MemberList`, when any member answered
    pub members: Option<Vec<EtcdMember>>,
    pub state: EnsembleState,
    /// Bootstrap flags recovered from a running member
    pub bootstrap: Option<EtcdBootstrap>,
}

impl EtcdObservation {
    /// Listed member advertising the peer URL of `node`
    #[must_use]
    pub fn member_of(&self, node: &NodeConfig) -> Option<&EtcdMember> {
        let peer = peer_url(node.internal_ip());
        self.members.as_ref()?.iter().find(|m| m.has_peer_url(&peer))
    }
}

/// Drives the etcd ensemble
pub struct DatastoreCoordinator<'a> {
    ctx: &'a ServiceContext,
    operator: &'a ContainerOperator,
    etcd: Arc<dyn EtcdConnector>,
    ready_timeout: Duration,
    poll_interval: Duration,
}

impl<'a> DatastoreCoordinator<'a> {
    #[must_use]
    pub fn new(
        ctx: &'a ServiceContext,
        operator: &'a ContainerOperator,
        etcd: Arc<dyn EtcdConnector>,
        ready_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            ctx,
            operator,
            etcd,
            ready_timeout,
            poll_interval,
        }
    }

    fn desired(&self) -> Vec<NodeConfig> {
        self.ctx.spec.nodes_with_role(Role::Etcd)
    }

    async fn client(&self, addresses: &BTreeSet<String>) -> Result<Arc<dyn EtcdClusterApi>, EngineError> {
        let endpoints: Vec<String> = addresses.iter().map(|a| client_url(a)).collect();
        self.etcd
            .connect(&endpoints)
            .await
            .map_err(|e| EngineError::datastore(COMPONENT, e))
    }

    /// Inspect `nodes`: containers, member health and membership
    ///
    /// Members are only probed where their container runs.
    ///
    /// # Errors
    ///
    /// Fails when a connected host cannot be inspected.
    pub async fn observe(&self, hosts: &Hosts, nodes: &[NodeConfig]) -> Result<EtcdObservation, EngineError> {
        let mut running = BTreeSet::new();
        let mut healthy = BTreeSet::new();
        let mut bootstrap = None;
        for node in nodes {
            if !hosts.contains(&node.address) {
                continue;
            }
            let conn = hosts.get(&node.address, COMPONENT)?;
            let info = conn
                .docker()
                .inspect_container(ETCD_CONTAINER)
                .await
                .map_err(|e| EngineError::host(&node.address, COMPONENT, e))?;
            let Some(info) = info.filter(|i| i.running) else {
                continue;
            };
            running.insert(node.address.clone());
            if bootstrap.is_none() {
                bootstrap = EtcdBootstrap::from_container(&info);
            }
            match self.etcd.health(&client_url(&node.address)).await {
                Ok(true) => {
                    healthy.insert(node.address.clone());
                }
                Ok(false) => warn!("[etcd] Member on host {} reports unhealthy", node.address),
                Err(e) => warn!("[etcd] Health probe of host {} failed: {}", node.address, e),
            }
        }

        let members = if healthy.is_empty() {
            None
        } else {
            match self.client(&healthy).await?.member_list().await {
                Ok(members) => Some(members),
                Err(e) => {
                    warn!("[etcd] Failed to list members: {}", e);
                    None
                }
            }
        };
        let state = assess(running.len(), members.as_ref().map(Vec::len), healthy.len());
        debug!("[etcd] Ensemble state: {}", state);
        Ok(EtcdObservation {
            running,
            healthy,
            members,
            state,
            bootstrap,
        })
    }

    /// Converge the ensemble onto the etcd hosts of the cluster file
    ///
    /// `previous` are the etcd hosts of the last successful run; those no
    /// longer listed are removed after new members have joined.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::QuorumViolation` when quorum is lost or a
    /// removal would lose it, `EngineError::ComponentNotReady` when the
    /// ensemble does not become healthy in time.
    pub async fn reconcile(&self, hosts: &Hosts, previous: &[NodeConfig]) -> Result<(), EngineError> {
        let desired = self.desired();
        let mut observed_nodes = desired.clone();
        observed_nodes.extend(previous.iter().filter(|p| !desired.iter().any(|d| d.address == p.address)).cloned());

        let mut observation = self.observe(hosts, &observed_nodes).await?;
        info!("[etcd] Observed ensemble {}", observation.state);
        if observation.state == EnsembleState::Bootstrapping {
            self.wait_healthy(hosts, &running_members(&desired, &observation, None)).await?;
            observation = self.observe(hosts, &observed_nodes).await?;
        }
        match observation.state {
            EnsembleState::Empty => return self.bootstrap(hosts, &desired).await,
            EnsembleState::Lost { healthy, total } => {
                return Err(EngineError::QuorumViolation(format!(
                    "etcd has {healthy} healthy of {total} members; restore from a snapshot"
                )));
            }
            EnsembleState::Bootstrapping | EnsembleState::Healthy | EnsembleState::Degraded { .. } => {}
        }

        let token = observation
            .bootstrap
            .as_ref()
            .map_or_else(etcd::new_token, |b| b.token.clone());

        for node in &desired {
            if observation.running.contains(&node.address) {
                self.upgrade_member(hosts, node).await?;
            } else {
                self.add_member(hosts, node, &token).await?;
            }
        }

        for node in observed_nodes.iter().filter(|n| !desired.iter().any(|d| d.address == n.address)) {
            let current = self.observe(hosts, &observed_nodes).await?;
            self.remove_member(hosts, node, &current).await?;
        }
        Ok(())
    }

    /// Start every member of a new ensemble at once
    ///
    /// # Errors
    ///
    /// Fails when a container cannot be started or the ensemble does not
    /// become healthy.
    pub async fn bootstrap(&self, hosts: &Hosts, members: &[NodeConfig]) -> Result<(), EngineError> {
        let bootstrap = EtcdBootstrap::new_cluster(&etcd::new_token(), members);
        self.start_all(hosts, members, &bootstrap).await?;
        self.wait_healthy(hosts, members).await
    }

    /// Start every member of `members` with the same flags
    pub(crate) async fn start_all(
        &self,
        hosts: &Hosts,
        members: &[NodeConfig],
        bootstrap: &EtcdBootstrap,
    ) -> Result<(), EngineError> {
        info!("[etcd] Starting {} member(s) with token {}", members.len(), bootstrap.token);
        let starts = members.iter().map(|node| async move {
            let conn = hosts.get(&node.address, COMPONENT)?;
            let spec = etcd::etcd_container(self.ctx, node, bootstrap)?;
            self.operator.ensure(conn, Role::Etcd.as_str(), spec).await
        });
        futures::future::try_join_all(starts).await?;
        Ok(())
    }

    /// Join `node` to the running ensemble
    ///
    /// # Errors
    ///
    /// Fails when `MemberAdd` is refused or the member does not start.
    pub async fn add_member(&self, hosts: &Hosts, node: &NodeConfig, token: &str) -> Result<(), EngineError> {
        let conn = hosts.get(&node.address, COMPONENT)?;
        let current = self.observe(hosts, &self.desired()).await?;
        let peer = peer_url(node.internal_ip());

        let added = match current.member_of(node) {
            Some(member) => {
                debug!("[etcd] Host {} is already a member ({:x})", node.address, member.id);
                current.members.clone().unwrap_or_default()
            }
            None => {
                info!("[etcd] Adding member on host {}", node.address);
                let result = self
                    .client(&current.healthy)
                    .await?
                    .member_add(std::slice::from_ref(&peer))
                    .await
                    .map_err(|e| EngineError::datastore(COMPONENT, e))?;
                result.members
            }
        };

        let nodes = self.desired();
        let peers: Vec<(String, String)> = added
            .iter()
            .filter_map(|m| {
                let url = m.peer_urls.first()?;
                let name = nodes
                    .iter()
                    .find(|n| peer_url(n.internal_ip()) == *url)
                    .map_or_else(|| m.name.clone(), etcd::member_name);
                (!name.is_empty()).then(|| (name, url.clone()))
            })
            .collect();
        let bootstrap = EtcdBootstrap::joining(token, &peers);

        self.operator.remove(conn, ETCD_CONTAINER).await?;
        let spec = etcd::etcd_container(self.ctx, node, &bootstrap)?;
        self.operator.ensure(conn, Role::Etcd.as_str(), spec).await?;
        self.wait_member(node).await?;
        self.wait_healthy(hosts, &running_members(&nodes, &current, Some(node))).await
    }

    /// Replace the container of a running member if its spec changed
    ///
    /// The member keeps its original bootstrap flags.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::QuorumViolation` when taking the member down
    /// would lose quorum.
    pub async fn upgrade_member(&self, hosts: &Hosts, node: &NodeConfig) -> Result<EnsureOutcome, EngineError> {
        let conn = hosts.get(&node.address, COMPONENT)?;
        let info = conn
            .docker()
            .inspect_container(ETCD_CONTAINER)
            .await
            .map_err(|e| EngineError::host(&node.address, COMPONENT, e))?;
        let Some(bootstrap) = info.as_ref().and_then(EtcdBootstrap::from_container) else {
            return Err(EngineError::Datastore {
                component: COMPONENT.to_string(),
                reason: format!("etcd container on {} carries no bootstrap flags", node.address),
            });
        };
        let spec = etcd::etcd_container(self.ctx, node, &bootstrap)?;
        if self.operator.is_current(conn, Role::Etcd.as_str(), &spec).await? {
            return Ok(EnsureOutcome::Unchanged);
        }

        let nodes = self.desired();
        let observation = self.observe(hosts, &nodes).await?;
        let total = observation.members.as_ref().map_or(nodes.len(), Vec::len);
        let healthy = observation.healthy.len();
        if total > 1 && !removal_keeps_quorum(total, healthy, observation.healthy.contains(&node.address)) {
            return Err(EngineError::QuorumViolation(format!(
                "replacing etcd on {} would leave {} healthy of {} members",
                node.address,
                healthy.saturating_sub(1),
                total
            )));
        }
        info!("[etcd] Replacing member on host {}", node.address);
        let outcome = self.operator.ensure(conn, Role::Etcd.as_str(), spec).await?;
        self.wait_member(node).await?;
        self.wait_healthy(hosts, &running_members(&nodes, &observation, None)).await?;
        Ok(outcome)
    }

    /// Restart the member of `node` so it reads new certificates
    ///
    /// # Errors
    ///
    /// Returns `EngineError::QuorumViolation` when the ensemble cannot spare
    /// the member, or `EngineError::ComponentNotReady` when it does not come
    /// back healthy.
    pub async fn restart_member(&self, hosts: &Hosts, node: &NodeConfig) -> Result<(), EngineError> {
        let conn = hosts.get(&node.address, COMPONENT)?;
        let nodes = self.desired();
        let observation = self.observe(hosts, &nodes).await?;
        let total = observation.members.as_ref().map_or(nodes.len(), Vec::len);
        if total > 1 && !removal_keeps_quorum(total, observation.healthy.len(), observation.healthy.contains(&node.address)) {
            return Err(EngineError::QuorumViolation(format!(
                "restarting etcd on {} would leave the ensemble without quorum",
                node.address
            )));
        }
        self.operator.restart(conn, ETCD_CONTAINER).await?;
        self.wait_member(node).await?;
        self.wait_healthy(hosts, &running_members(&nodes, &observation, Some(node))).await
    }

    /// Remove `node` from the ensemble, then its container
    ///
    /// # Errors
    ///
    /// Returns `EngineError::QuorumViolation` when the removal would leave
    /// the ensemble without a healthy majority.
    pub async fn remove_member(
        &self,
        hosts: &Hosts,
        node: &NodeConfig,
        observation: &EtcdObservation,
    ) -> Result<(), EngineError> {
        if let Some(member) = observation.member_of(node) {
            let total = observation.members.as_ref().map_or(0, Vec::len);
            let healthy = observation.healthy.len();
            let removing_healthy = observation.healthy.contains(&node.address);
            if !removal_keeps_quorum(total, healthy, removing_healthy) {
                return Err(EngineError::QuorumViolation(format!(
                    "removing etcd member on {} would leave {} healthy of {} members",
                    node.address,
                    if removing_healthy { healthy.saturating_sub(1) } else { healthy },
                    total - 1
                )));
            }
            info!("[etcd] Removing member {:x} on host {}", member.id, node.address);
            self.client(&observation.healthy)
                .await?
                .member_remove(member.id)
                .await
                .map_err(|e| EngineError::datastore(COMPONENT, e))?;
        }
        if let Ok(conn) = hosts.get(&node.address, COMPONENT) {
            self.operator.remove(conn, ETCD_CONTAINER).await?;
            self.operator.remove(conn, crate::services::ROLLING_SNAPSHOT_CONTAINER).await?;
        } else {
            warn!("[etcd] Host {} is unreachable, leaving its container in place", node.address);
        }
        Ok(())
    }

    /// Poll until the member of `node` answers healthy
    async fn wait_member(&self, node: &NodeConfig) -> Result<(), EngineError> {
        let deadline = Instant::now() + self.ready_timeout;
        let endpoint = client_url(&node.address);
        loop {
            if matches!(self.etcd.health(&endpoint).await, Ok(true)) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EngineError::ComponentNotReady {
                    host: node.address.clone(),
                    component: COMPONENT.to_string(),
                    secs: self.ready_timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Poll until every member of `nodes` is healthy and quorum holds
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ComponentNotReady` on timeout.
    pub async fn wait_healthy(&self, hosts: &Hosts, nodes: &[NodeConfig]) -> Result<(), EngineError> {
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            let observation = self.observe(hosts, nodes).await?;
            if observation.state.has_quorum() && nodes.iter().all(|n| observation.healthy.contains(&n.address)) {
                info!("[etcd] Ensemble is healthy with {} member(s)", nodes.len());
                return Ok(());
            }
            if Instant::now() >= deadline {
                let host = nodes
                    .iter()
                    .find(|n| !observation.healthy.contains(&n.address))
                    .map_or_else(|| COMPONENT.to_string(), |n| n.address.clone());
                return Err(EngineError::ComponentNotReady {
                    host,
                    component: COMPONENT.to_string(),
                    secs: self.ready_timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
#[path = "coordinator_test.rs"]
mod coordinator_test;
