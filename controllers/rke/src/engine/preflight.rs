//! Port check of hosts joining the cluster
//!
//! A host without managed containers must not already have a listener on a
//! port its roles bind. Hosts already running cluster containers are skipped
//! since the listeners are ours.

use super::observe::HostState;
use super::scheduler::{Scheduler, barrier};
use crate::error::EngineError;
use crate::hosts::Hosts;
use cluster_types::{NodeConfig, Role};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

pub const ETCD_PORTS: &[u16] = &[2379, 2380];
pub const CONTROL_PLANE_PORTS: &[u16] = &[6443, 10257, 10259];
pub const WORKER_PORTS: &[u16] = &[10250, 10256];

const COMPONENT: &str = "preflight";
const LISTENERS_COMMAND: &str = "ss -Hltn";

/// Ports `node` binds for its roles
#[must_use]
pub fn required_ports(node: &NodeConfig) -> BTreeSet<u16> {
    let mut ports: BTreeSet<u16> = WORKER_PORTS.iter().copied().collect();
    if node.has_role(Role::Etcd) {
        ports.extend(ETCD_PORTS);
    }
    if node.has_role(Role::ControlPlane) {
        ports.extend(CONTROL_PLANE_PORTS);
    }
    ports
}

/// Local ports of the `ss -Hltn` listing
#[must_use]
pub fn listening_ports(listing: &str) -> BTreeSet<u16> {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().nth(3))
        .filter_map(|local| local.rsplit_once(':'))
        .filter_map(|(_, port)| port.parse().ok())
        .collect()
}

async fn check_host(hosts: &Hosts, node: &NodeConfig) -> Result<(), EngineError> {
    let conn = hosts.get(&node.address, COMPONENT)?;
    let output = conn
        .run(LISTENERS_COMMAND)
        .await
        .map_err(|e| EngineError::host(&node.address, COMPONENT, e))?;
    if !output.success() {
        debug!(
            "[preflight] Cannot list listeners on host {}: {}",
            node.address,
            output.stderr.trim()
        );
        return Ok(());
    }
    let busy: Vec<String> = required_ports(node)
        .intersection(&listening_ports(&output.stdout))
        .map(ToString::to_string)
        .collect();
    if busy.is_empty() {
        Ok(())
    } else {
        Err(EngineError::HostIncompatible {
            host: node.address.clone(),
            component: COMPONENT.to_string(),
            reason: format!("port(s) {} already in use", busy.join(", ")),
        })
    }
}

/// Fail when a fresh host already listens on a port it needs
///
/// # Errors
///
/// Returns `EngineError::HostIncompatible` naming the busy ports.
pub async fn check_ports(
    hosts: &Hosts,
    nodes: &[NodeConfig],
    observed: &BTreeMap<String, HostState>,
    scheduler: &Scheduler,
) -> Result<(), EngineError> {
    let fresh: Vec<&NodeConfig> = nodes
        .iter()
        .filter(|n| hosts.contains(&n.address))
        .filter(|n| observed.get(&n.address).is_none_or(|h| h.containers.is_empty()))
        .collect();
    if fresh.is_empty() {
        return Ok(());
    }
    info!("[preflight] Checking ports on {} new host(s)", fresh.len());
    let results = scheduler.run_parallel(fresh, |node| check_host(hosts, node)).await;
    barrier(COMPONENT, results)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::tests::node;

    const LISTING: &str = "\
LISTEN 0      4096         0.0.0.0:22        0.0.0.0:*
LISTEN 0      4096       127.0.0.1:2379      0.0.0.0:*
LISTEN 0      4096            [::]:10250        [::]:*
";

    #[test]
    fn test_listening_ports() {
        assert_eq!(listening_ports(LISTING), BTreeSet::from([22, 2379, 10250]));
        assert!(listening_ports("").is_empty());
    }

    #[test]
    fn test_required_ports_by_role() {
        let worker = required_ports(&node("10.0.0.2", &[Role::Worker]));
        assert_eq!(worker, BTreeSet::from([10250, 10256]));
        let core = required_ports(&node("10.0.0.1", &[Role::Etcd, Role::ControlPlane]));
        assert!(core.contains(&2380));
        assert!(core.contains(&6443));
        assert!(core.contains(&10250));
    }
}
