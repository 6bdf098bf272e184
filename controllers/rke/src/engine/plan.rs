//! Plan computation
//!
//! The plan compares, per host and container, the hash of the desired spec
//! with the hash label observed on the host. It is computed once at run
//! start and never changed afterwards.

use super::observe::HostState;
use crate::deployers::certs::consumes;
use crate::encryption;
use crate::error::EngineError;
use crate::operator::hash::labelled;
use crate::operator::spec_hash;
use crate::services::etcd::{self, EtcdBootstrap};
use crate::services::{
    ETCD_CONTAINER, KUBE_APISERVER_CONTAINER, KUBERNETES_CONTAINERS, ROLLING_SNAPSHOT_CONTAINER, SIDEKICK_CONTAINER, ServiceContext,
    kubernetes_containers,
};
use cluster_types::{ClusterSpec, NodeConfig, Role};
use host_driver::ContainerSpec;
use pki::CertBundle;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Component name of the certificate distribution step
pub const CERTIFICATES: &str = "certificates";
/// Component name of the host file distribution step
pub const HOST_FILES: &str = "host-files";
/// Component name of the directory cleanup of a departing host
pub const CLEANUP: &str = "cleanup";
/// Parameter marking a step that only restarts a container
pub const RESTART_PARAM: &str = "restart";
/// Restart reason of an API server whose encryption provider file changed
pub const ENCRYPTION: &str = "encryption";

/// Barrier-separated phases, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Layer {
    Certificates,
    Etcd,
    ControlPlane,
    Workers,
    Removals,
    Addons,
}

impl Layer {
    pub const ALL: [Layer; 6] = [
        Layer::Certificates,
        Layer::Etcd,
        Layer::ControlPlane,
        Layer::Workers,
        Layer::Removals,
        Layer::Addons,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Layer::Certificates => "certificates",
            Layer::Etcd => "etcd",
            Layer::ControlPlane => "controlplane",
            Layer::Workers => "worker",
            Layer::Removals => "remove",
            Layer::Addons => "addons",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Action {
    Deploy,
    Upgrade,
    Remove,
    Noop,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Deploy => "deploy",
            Action::Upgrade => "upgrade",
            Action::Remove => "remove",
            Action::Noop => "noop",
        })
    }
}

/// One unit of work on one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub host: String,
    pub role: String,
    pub action: Action,
    pub component: String,
    pub params: BTreeMap<String, String>,
}

impl PlanStep {
    #[must_use]
    pub fn new(host: &str, role: &str, component: &str, action: Action) -> Self {
        Self {
            host: host.to_string(),
            role: role.to_string(),
            action,
            component: component.to_string(),
            params: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.action == Action::Noop
    }

    /// Unchanged container that must be restarted to reread its files
    #[must_use]
    pub fn is_restart(&self) -> bool {
        self.params.contains_key(RESTART_PARAM)
    }

    fn downgrade(&mut self) {
        self.action = Action::Noop;
        self.params.remove(RESTART_PARAM);
    }
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{} on {}", self.action, self.role, self.component, self.host)?;
        if self.is_restart() {
            f.write_str(" (restart)")?;
        }
        Ok(())
    }
}

/// Inputs of a plan computation
#[derive(Debug)]
pub struct PlanInput<'a> {
    pub ctx: &'a ServiceContext,
    /// Cluster file of the last successful run
    pub previous: Option<&'a ClusterSpec>,
    pub observed: &'a BTreeMap<String, HostState>,
    pub bundle: &'a CertBundle,
    /// Bundle entries that differ from the persisted bundle
    pub changed_certs: &'a BTreeSet<String>,
    /// Addon steps, computed by the addon reconciler
    pub addons: Vec<PlanStep>,
    pub update_only: bool,
}

/// Immutable work list of a run
#[derive(Debug, Clone, Default)]
pub struct Plan {
    layers: BTreeMap<Layer, Vec<PlanStep>>,
}

fn desired_hash(role: &str, spec: &ContainerSpec) -> String {
    spec_hash(&labelled(spec.clone(), role))
}

/// Deploy when absent, upgrade when the hash or run state differs
fn container_action(observed: Option<&HostState>, role: &str, spec: &ContainerSpec) -> Action {
    let Some(current) = observed.and_then(|h| h.container(&spec.name)) else {
        return Action::Deploy;
    };
    let expect_running = spec.name != SIDEKICK_CONTAINER;
    if observed.and_then(|h| h.hash_of(&spec.name)) != Some(desired_hash(role, spec).as_str()) {
        Action::Upgrade
    } else if expect_running && !current.running {
        Action::Upgrade
    } else {
        Action::Noop
    }
}

fn previous_node<'a>(previous: Option<&'a ClusterSpec>, address: &str) -> Option<&'a NodeConfig> {
    previous.and_then(|p| p.node(address))
}

/// Inputs of the host files other than the node itself
fn host_file_inputs_changed(previous: &ClusterSpec, spec: &ClusterSpec) -> bool {
    let (old, new) = (&previous.services.etcd, &spec.services.etcd);
    previous.cloud_provider != spec.cloud_provider
        || previous.private_registries != spec.private_registries
        || old.external_urls != new.external_urls
        || old.ca_cert != new.ca_cert
        || old.cert != new.cert
        || old.key != new.key
        || encryption::changed(previous, spec)
}

fn holds_core_role(node: &NodeConfig) -> bool {
    node.has_role(Role::Etcd) || node.has_role(Role::ControlPlane)
}

impl Plan {
    /// Compare desired and observed state
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ConfigInvalid` when a desired spec cannot be
    /// built from the release.
    pub fn compute(input: PlanInput<'_>) -> Result<Self, EngineError> {
        let ctx = input.ctx;
        let spec = &ctx.spec;
        let mut plan = Plan::default();

        let mut cert_refresh: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for node in &spec.nodes {
            let previous = previous_node(input.previous, &node.address);
            let roles_changed = previous.is_some_and(|p| p.role != node.role);
            let wanted = input.bundle.names_for_host(spec, node);
            let changed: Vec<String> = wanted.iter().filter(|n| input.changed_certs.contains(*n)).cloned().collect();

            let certs = match previous {
                None => Action::Deploy,
                Some(_) if roles_changed || !changed.is_empty() => Action::Upgrade,
                Some(_) => Action::Noop,
            };
            let files = match (previous, input.previous) {
                (Some(_), Some(prev_spec)) if roles_changed || host_file_inputs_changed(prev_spec, spec) => Action::Upgrade,
                (Some(_), _) => Action::Noop,
                (None, _) => Action::Deploy,
            };
            if certs == Action::Upgrade && !changed.is_empty() {
                cert_refresh.insert(node.address.clone(), changed);
            }
            let mut steps = vec![
                PlanStep::new(&node.address, CERTIFICATES, CERTIFICATES, certs),
                PlanStep::new(&node.address, CERTIFICATES, HOST_FILES, files),
            ];
            if input.update_only && holds_core_role(node) {
                steps.iter_mut().filter(|s| s.action != Action::Deploy).for_each(PlanStep::downgrade);
            }
            plan.push(Layer::Certificates, steps);
        }

        // The provider file is read only at API server start
        let encryption_changed = input.previous.is_some_and(|p| encryption::changed(p, spec));
        let refresh = |step: PlanStep| -> PlanStep {
            if !step.is_noop() {
                return step;
            }
            let reason = if cert_refresh
                .get(&step.host)
                .is_some_and(|names| names.iter().any(|n| consumes(&step.component, n)))
            {
                CERTIFICATES
            } else if encryption_changed && step.component == KUBE_APISERVER_CONTAINER {
                ENCRYPTION
            } else {
                return step;
            };
            PlanStep {
                action: Action::Upgrade,
                ..step
            }
            .with_param(RESTART_PARAM, reason)
        };

        if !spec.uses_external_etcd() {
            let mut steps = Vec::new();
            for node in spec.hosts_with_role(Role::Etcd) {
                let observed = input.observed.get(&node.address);
                let action = match observed.and_then(|h| h.container(ETCD_CONTAINER)) {
                    None => Action::Deploy,
                    Some(info) => match EtcdBootstrap::from_container(info) {
                        Some(bootstrap) => {
                            container_action(observed, Role::Etcd.as_str(), &etcd::etcd_container(ctx, node, &bootstrap)?)
                        }
                        None => Action::Upgrade,
                    },
                };
                steps.push(refresh(PlanStep::new(&node.address, Role::Etcd.as_str(), ETCD_CONTAINER, action)));

                let rolling = if spec.services.etcd.backup_config.enabled {
                    container_action(observed, Role::Etcd.as_str(), &etcd::rolling_snapshots(ctx, node)?)
                } else if observed.and_then(|h| h.container(ROLLING_SNAPSHOT_CONTAINER)).is_some() {
                    Action::Remove
                } else {
                    Action::Noop
                };
                steps.push(PlanStep::new(&node.address, Role::Etcd.as_str(), ROLLING_SNAPSHOT_CONTAINER, rolling));
            }
            if let Some(previous) = input.previous {
                for node in previous.hosts_with_role(Role::Etcd) {
                    if !spec.node(&node.address).is_some_and(|n| n.has_role(Role::Etcd)) {
                        steps.push(PlanStep::new(&node.address, Role::Etcd.as_str(), ETCD_CONTAINER, Action::Remove));
                    }
                }
            }
            if input.update_only {
                steps.iter_mut().for_each(PlanStep::downgrade);
            }
            plan.push(Layer::Etcd, steps);
        }

        let mut control_plane = Vec::new();
        let mut workers = Vec::new();
        let mut removals = Vec::new();
        for node in &spec.nodes {
            let observed = input.observed.get(&node.address);
            let desired = kubernetes_containers(ctx, node)?;
            for (role, container) in &desired {
                let action = container_action(observed, role.as_str(), container);
                let mut step = refresh(PlanStep::new(&node.address, role.as_str(), &container.name, action));
                if input.update_only && holds_core_role(node) {
                    step.downgrade();
                }
                if *role == Role::ControlPlane {
                    control_plane.push(step);
                } else {
                    workers.push(step);
                }
            }
            if let Some(observed) = observed {
                for (name, info) in &observed.containers {
                    let managed = KUBERNETES_CONTAINERS.contains(&name.as_str());
                    if managed && !desired.iter().any(|(_, c)| &c.name == name) {
                        let role = info.labels.get(crate::operator::ROLE_LABEL).map_or("worker", String::as_str);
                        let mut step = PlanStep::new(&node.address, role, name, Action::Remove);
                        if input.update_only && holds_core_role(node) {
                            step.downgrade();
                        }
                        removals.push(step);
                    }
                }
            }
        }

        if let Some(previous) = input.previous {
            for node in previous.nodes.iter().filter(|n| spec.node(&n.address).is_none()) {
                let names: Vec<&str> = match input.observed.get(&node.address) {
                    Some(observed) => observed
                        .containers
                        .keys()
                        .map(String::as_str)
                        .filter(|n| KUBERNETES_CONTAINERS.contains(n))
                        .collect(),
                    None => KUBERNETES_CONTAINERS.to_vec(),
                };
                let mut steps: Vec<PlanStep> = names
                    .into_iter()
                    .map(|name| {
                        let role = if node.has_role(Role::ControlPlane)
                            && crate::services::controlplane::CONTAINERS.contains(&name)
                        {
                            Role::ControlPlane
                        } else {
                            Role::Worker
                        };
                        PlanStep::new(&node.address, role.as_str(), name, Action::Remove)
                    })
                    .collect();
                steps.push(PlanStep::new(&node.address, CLEANUP, CLEANUP, Action::Remove));
                if input.update_only && holds_core_role(node) {
                    steps.iter_mut().for_each(PlanStep::downgrade);
                }
                removals.extend(steps);
            }
        }

        plan.push(Layer::ControlPlane, control_plane);
        plan.push(Layer::Workers, workers);
        plan.push(Layer::Removals, removals);
        plan.push(Layer::Addons, input.addons);
        Ok(plan)
    }

    fn push(&mut self, layer: Layer, steps: Vec<PlanStep>) {
        self.layers.entry(layer).or_default().extend(steps);
    }

    /// Every step of `layer`
    #[must_use]
    pub fn steps(&self, layer: Layer) -> &[PlanStep] {
        self.layers.get(&layer).map_or(&[], Vec::as_slice)
    }

    /// Steps of `layer` that do something
    #[must_use]
    pub fn active(&self, layer: Layer) -> Vec<PlanStep> {
        self.steps(layer).iter().filter(|s| !s.is_noop()).cloned().collect()
    }

    /// Whether nothing in the plan does anything
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.layers.values().flatten().all(PlanStep::is_noop)
    }

    /// Step count per action
    #[must_use]
    pub fn counts(&self) -> BTreeMap<Action, usize> {
        let mut counts = BTreeMap::new();
        for step in self.layers.values().flatten() {
            *counts.entry(step.action).or_insert(0) += 1;
        }
        counts
    }

    /// Hosts with work in `layer`
    #[must_use]
    pub fn hosts(&self, layer: Layer) -> BTreeSet<String> {
        self.steps(layer)
            .iter()
            .filter(|s| !s.is_noop())
            .map(|s| s.host.clone())
            .collect()
    }
}

#[cfg(test)]
#[path = "plan_test.rs"]
mod plan_test;
