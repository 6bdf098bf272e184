//! Observed state of the hosts at run start

use super::scheduler::Scheduler;
use crate::error::EngineError;
use crate::hosts::Hosts;
use crate::operator::NAME_LABEL;
use crate::operator::hash::HASH_LABEL;
use host_driver::ContainerInfo;
use std::collections::BTreeMap;
use tracing::debug;

/// Managed containers found on one host
#[derive(Debug, Clone, Default)]
pub struct HostState {
    pub address: String,
    pub docker_version: String,
    /// Containers carrying the name label, by name
    pub containers: BTreeMap<String, ContainerInfo>,
}

impl HostState {
    #[must_use]
    pub fn container(&self, name: &str) -> Option<&ContainerInfo> {
        self.containers.get(name)
    }

    /// Hash label of `name`, if the container exists and carries one
    #[must_use]
    pub fn hash_of(&self, name: &str) -> Option<&str> {
        self.container(name)?.labels.get(HASH_LABEL).map(String::as_str)
    }
}

/// Probe every connected host
///
/// # Errors
///
/// Returns the first host whose containers cannot be listed.
pub async fn observe(hosts: &Hosts, scheduler: &Scheduler) -> Result<BTreeMap<String, HostState>, EngineError> {
    let addresses: Vec<&str> = hosts.addresses().collect();
    let results = scheduler
        .run_parallel(addresses, |address| async move {
            let conn = hosts.get(address, "observe")?;
            let listed = conn
                .docker()
                .list_containers(NAME_LABEL)
                .await
                .map_err(|e| EngineError::host(address, "observe", e))?;
            debug!("[observe] Host {} runs {} managed container(s)", address, listed.len());
            Ok(HostState {
                address: address.to_string(),
                docker_version: conn.docker_info().server_version.clone(),
                containers: listed.into_iter().map(|c| (c.name.clone(), c)).collect(),
            })
        })
        .await;
    let mut observed = BTreeMap::new();
    for result in results {
        let state = result?;
        observed.insert(state.address.clone(), state);
    }
    Ok(observed)
}
