//! Test utilities for running the engine against in-memory hosts
//!
//! `TestCluster` writes a cluster file into a temporary directory and wires
//! an `Engine` to a `MockDialer`, a shared `MockEtcd` and a shared
//! `MockKubeApi`, so a whole run can be driven without SSH or a cluster.

use crate::backoff::RetryPolicy;
use crate::config::RuntimeConfig;
use crate::engine::{ClusterConnectors, Engine};
use crate::error::EngineError;
use datastore_client::{EtcdConnector, EtcdTls, MockEtcd};
use host_driver::MockDialer;
use k8s_client::{KubeConnector, KubeTls, MockKubeApi};
use pki::{KeyAlgorithm, PkiOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Connectors handing out clones of shared mocks
#[derive(Debug, Clone, Default)]
pub struct MockConnectors {
    pub etcd: MockEtcd,
    pub kube: MockKubeApi,
}

impl ClusterConnectors for MockConnectors {
    fn etcd(&self, _tls: Option<EtcdTls>) -> Result<Arc<dyn EtcdConnector>, EngineError> {
        Ok(Arc::new(self.etcd.clone()))
    }

    fn kube(&self, _tls: Option<KubeTls>) -> Result<Arc<dyn KubeConnector>, EngineError> {
        Ok(Arc::new(self.kube.clone()))
    }
}

/// Runtime tuned for tests: ECDSA keys, short waits, a single pull attempt
pub fn fast_runtime() -> RuntimeConfig {
    RuntimeConfig {
        pki: PkiOptions {
            ca_algorithm: KeyAlgorithm::EcdsaP256,
            leaf_algorithm: KeyAlgorithm::EcdsaP256,
        },
        ready_timeout: Duration::from_millis(50),
        poll_interval: Duration::from_millis(1),
        pull_retry: RetryPolicy {
            attempts: 1,
            base: Duration::from_millis(1),
            max: Duration::from_millis(1),
        },
        ..RuntimeConfig::default()
    }
}

/// YAML entry for one host
pub fn node_yaml(address: &str, roles: &[&str]) -> String {
    format!(
        "  - address: {address}\n    hostname_override: node-{}\n    user: rancher\n    role: [{}]\n",
        address.replace('.', "-"),
        roles.join(", ")
    )
}

/// Cluster file directory plus the mocks behind an engine
pub struct TestCluster {
    pub dir: TempDir,
    pub dialer: MockDialer,
    pub connectors: MockConnectors,
    pub cancel: CancellationToken,
}

impl TestCluster {
    /// One etcd and control plane host, `10.0.0.1`, and one worker, `10.0.0.2`
    pub fn new() -> Self {
        Self::with_nodes(&[("10.0.0.1", &["controlplane", "etcd"]), ("10.0.0.2", &["worker"])])
    }

    pub fn with_nodes(nodes: &[(&str, &[&str])]) -> Self {
        let cluster = Self {
            dir: tempfile::tempdir().expect("tempdir"),
            dialer: MockDialer::new(),
            connectors: MockConnectors::default(),
            cancel: CancellationToken::new(),
        };
        cluster.write_config(nodes);
        cluster
    }

    pub fn config(&self) -> PathBuf {
        self.dir.path().join("cluster.yml")
    }

    /// Rewrite the cluster file and register any new host with the dialer
    pub fn write_config(&self, nodes: &[(&str, &[&str])]) {
        self.write_config_with("", nodes);
    }

    /// Like `write_config`, with `settings` (top-level YAML lines) before
    /// the node list
    pub fn write_config_with(&self, settings: &str, nodes: &[(&str, &[&str])]) {
        let mut yaml = format!("cluster_name: test\n{settings}nodes:\n");
        for (address, roles) in nodes {
            if self.dialer.docker(address).is_none() {
                self.dialer.add_host(address);
            }
            yaml.push_str(&node_yaml(address, roles));
        }
        std::fs::write(self.config(), yaml).expect("write cluster.yml");
    }

    pub fn engine(&self) -> Engine {
        Engine::new(
            Arc::new(self.dialer.clone()),
            Arc::new(self.connectors.clone()),
            fast_runtime(),
            self.cancel.clone(),
        )
    }

    /// Names of the containers on `address`
    pub fn containers(&self, address: &str) -> Vec<String> {
        self.dialer.docker(address).map(|d| d.container_names()).unwrap_or_default()
    }

    /// Containers created on `address` since the journal was last cleared
    pub fn created(&self, address: &str) -> Vec<String> {
        self.dialer.docker(address).map(|d| d.ops("create")).unwrap_or_default()
    }
}
