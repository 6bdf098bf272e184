//! Open connections of a run, keyed by node address

use crate::error::EngineError;
use cluster_types::NodeConfig;
use futures::StreamExt;
use host_driver::{HostConnection, HostDialer};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Connections to every reachable host
#[derive(Debug, Default)]
pub struct Hosts {
    conns: BTreeMap<String, HostConnection>,
}

impl Hosts {
    /// Dial `nodes` with at most `fan_out` handshakes in flight
    ///
    /// Returns the connections that succeeded together with one error per
    /// node that could not be reached.
    pub async fn connect(dialer: &dyn HostDialer, nodes: &[NodeConfig], fan_out: usize) -> (Self, Vec<EngineError>) {
        let mut hosts = Self::default();
        let mut failures = Vec::new();
        let mut dials = futures::stream::iter(nodes.iter().cloned())
            .map(|node| async move {
                let result = dialer.connect(&node).await;
                (node, result)
            })
            .buffer_unordered(fan_out.max(1));
        while let Some((node, result)) = dials.next().await {
            match result {
                Ok(conn) => {
                    info!(
                        "[dialer] Connected to host {} (Docker {})",
                        node.address,
                        conn.docker_info().server_version
                    );
                    hosts.insert(conn);
                }
                Err(e) => {
                    warn!("[dialer] Failed to connect to host {}: {}", node.address, e);
                    failures.push(EngineError::host(&node.address, "dialer", e));
                }
            }
        }
        (hosts, failures)
    }

    pub fn insert(&mut self, conn: HostConnection) {
        self.conns.insert(conn.address().to_string(), conn);
    }

    /// Take over the connections of `other`
    pub fn merge(&mut self, other: Hosts) {
        self.conns.extend(other.conns);
    }

    /// Connection to `address`
    ///
    /// # Errors
    ///
    /// Returns `EngineError::HostUnreachable` when the host was not connected.
    pub fn get(&self, address: &str, component: &str) -> Result<&HostConnection, EngineError> {
        self.conns.get(address).ok_or_else(|| EngineError::HostUnreachable {
            host: address.to_string(),
            component: component.to_string(),
            reason: "no connection to host".to_string(),
        })
    }

    #[must_use]
    pub fn contains(&self, address: &str) -> bool {
        self.conns.contains_key(address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.conns.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Close every connection
    pub async fn close(self) {
        futures::future::join_all(self.conns.into_values().map(HostConnection::close)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use host_driver::MockDialer;

    fn node(address: &str) -> NodeConfig {
        NodeConfig {
            address: address.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_partial_connect() {
        let dialer = MockDialer::new();
        dialer.add_host("10.0.0.1");
        dialer.add_host("10.0.0.2");
        dialer.set_reachable("10.0.0.2", false);

        let (hosts, failures) = Hosts::connect(&dialer, &[node("10.0.0.1"), node("10.0.0.2")], 4).await;
        assert_eq!(hosts.len(), 1);
        assert!(hosts.get("10.0.0.1", "etcd").is_ok());
        assert!(matches!(
            hosts.get("10.0.0.2", "etcd"),
            Err(EngineError::HostUnreachable { .. })
        ));
        assert_eq!(failures.len(), 1);
        assert!(matches!(&failures[0], EngineError::HostUnreachable { host, .. } if host == "10.0.0.2"));
        hosts.close().await;
    }
}
