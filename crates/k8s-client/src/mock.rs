//! Mock Kubernetes API for unit testing
//!
//! Nodes, addon jobs and ConfigMaps are kept in memory. Every mutating call
//! is journaled as `<op> <target>` so tests can assert ordering, e.g. that a
//! node is cordoned before its kubelet is recreated.

use crate::error::KubeApiError;
use crate::k8s_trait::{KubeApi, KubeConnector};
use crate::models::{AddonJob, JobInfo, JobState, MANIFEST_HASH_ANNOTATION};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Default)]
struct MockNode {
    ready: bool,
    unschedulable: bool,
}

/// In-memory cluster
#[derive(Debug, Clone)]
pub struct MockKubeApi {
    version: Arc<Mutex<String>>,
    nodes: Arc<Mutex<HashMap<String, MockNode>>>,
    config_maps: Arc<Mutex<BTreeMap<String, String>>>,
    secrets: Arc<Mutex<BTreeSet<String>>>,
    jobs: Arc<Mutex<HashMap<String, JobInfo>>>,
    job_outcomes: Arc<Mutex<HashMap<String, JobState>>>,
    unhealthy: Arc<Mutex<HashSet<String>>>,
    unreachable: Arc<AtomicBool>,
    deployer_ready: Arc<AtomicBool>,
    ops: Arc<Mutex<Vec<String>>>,
}

impl Default for MockKubeApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockKubeApi {
    pub fn new() -> Self {
        Self {
            version: Arc::new(Mutex::new("v1.30.4".to_string())),
            nodes: Arc::new(Mutex::new(HashMap::new())),
            config_maps: Arc::new(Mutex::new(BTreeMap::new())),
            secrets: Arc::new(Mutex::new(BTreeSet::new())),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            job_outcomes: Arc::new(Mutex::new(HashMap::new())),
            unhealthy: Arc::new(Mutex::new(HashSet::new())),
            unreachable: Arc::new(AtomicBool::new(false)),
            deployer_ready: Arc::new(AtomicBool::new(false)),
            ops: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_version(&self, version: &str) {
        *lock(&self.version) = version.to_string();
    }

    /// Register a node
    pub fn add_node(&self, name: &str, ready: bool) {
        lock(&self.nodes).insert(
            name.to_string(),
            MockNode {
                ready,
                unschedulable: false,
            },
        );
    }

    /// Whether the node is cordoned; `None` if unknown
    pub fn is_cordoned(&self, name: &str) -> Option<bool> {
        lock(&self.nodes).get(name).map(|n| n.unschedulable)
    }

    /// Outcome the next job with this name reaches
    pub fn set_job_outcome(&self, job: &str, state: JobState) {
        lock(&self.job_outcomes).insert(job.to_string(), state);
    }

    /// Seed an existing job
    pub fn add_job(&self, name: &str, manifest_hash: &str, state: JobState) {
        lock(&self.jobs).insert(
            name.to_string(),
            JobInfo {
                name: name.to_string(),
                annotations: BTreeMap::from([(MANIFEST_HASH_ANNOTATION.to_string(), manifest_hash.to_string())]),
                state,
            },
        );
    }

    /// Make `/healthz` on `server` fail
    pub fn set_unhealthy(&self, server: &str, unhealthy: bool) {
        let mut set = lock(&self.unhealthy);
        if unhealthy {
            set.insert(server.trim_end_matches('/').to_string());
        } else {
            set.remove(server.trim_end_matches('/'));
        }
    }

    /// Make every call fail as if the API server were down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Stored manifest of an addon ConfigMap
    pub fn config_map(&self, name: &str) -> Option<String> {
        lock(&self.config_maps).get(name).cloned()
    }

    pub fn job(&self, name: &str) -> Option<JobInfo> {
        lock(&self.jobs).get(name).cloned()
    }

    /// Whether the job service account was ensured
    pub fn job_deployer_ready(&self) -> bool {
        self.deployer_ready.load(Ordering::SeqCst)
    }

    /// Register a Secret as `<namespace>/<name>`
    pub fn add_secret(&self, key: &str) {
        lock(&self.secrets).insert(key.to_string());
    }

    /// Journal of `<op> <target>` entries
    pub fn ops(&self) -> Vec<String> {
        lock(&self.ops).clone()
    }

    /// Journal entries for one op
    pub fn ops_of(&self, op: &str) -> Vec<String> {
        let prefix = format!("{op} ");
        self.ops()
            .into_iter()
            .filter_map(|entry| entry.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    fn record(&self, op: &str, target: &str) {
        lock(&self.ops).push(format!("{op} {target}"));
    }

    fn check_reachable(&self) -> Result<(), KubeApiError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(KubeApiError::Wait("mock API server is unreachable".to_string()))
        } else {
            Ok(())
        }
    }

    fn set_unschedulable(&self, node: &str, unschedulable: bool) -> Result<(), KubeApiError> {
        let mut nodes = lock(&self.nodes);
        let found = nodes
            .get_mut(node)
            .ok_or_else(|| KubeApiError::NodeNotFound(node.to_string()))?;
        found.unschedulable = unschedulable;
        Ok(())
    }
}

#[async_trait::async_trait]
impl KubeApi for MockKubeApi {
    async fn server_version(&self) -> Result<String, KubeApiError> {
        self.check_reachable()?;
        Ok(lock(&self.version).clone())
    }

    async fn node_ready(&self, node: &str) -> Result<Option<bool>, KubeApiError> {
        self.check_reachable()?;
        Ok(lock(&self.nodes).get(node).map(|n| n.ready))
    }

    async fn cordon(&self, node: &str) -> Result<(), KubeApiError> {
        self.check_reachable()?;
        self.record("cordon", node);
        self.set_unschedulable(node, true)
    }

    async fn uncordon(&self, node: &str) -> Result<(), KubeApiError> {
        self.check_reachable()?;
        self.record("uncordon", node);
        self.set_unschedulable(node, false)
    }

    async fn drain(&self, node: &str, _timeout: Duration) -> Result<(), KubeApiError> {
        self.check_reachable()?;
        self.record("drain", node);
        if lock(&self.nodes).contains_key(node) {
            Ok(())
        } else {
            Err(KubeApiError::NodeNotFound(node.to_string()))
        }
    }

    async fn apply_config_map(&self, name: &str, manifest: &str) -> Result<(), KubeApiError> {
        self.check_reachable()?;
        self.record("configmap", name);
        lock(&self.config_maps).insert(name.to_string(), manifest.to_string());
        Ok(())
    }

    async fn rewrite_secrets(&self) -> Result<usize, KubeApiError> {
        self.check_reachable()?;
        let secrets = lock(&self.secrets).clone();
        for key in &secrets {
            self.record("rewrite", key);
        }
        Ok(secrets.len())
    }

    async fn ensure_job_deployer(&self) -> Result<(), KubeApiError> {
        self.check_reachable()?;
        self.record("deployer", "rke-job-deployer");
        self.deployer_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn get_job(&self, name: &str) -> Result<Option<JobInfo>, KubeApiError> {
        self.check_reachable()?;
        Ok(self.job(name))
    }

    async fn create_job(&self, job: &AddonJob) -> Result<(), KubeApiError> {
        self.check_reachable()?;
        let name = job.job_name();
        self.record("create-job", &name);
        let mut jobs = lock(&self.jobs);
        if jobs.contains_key(&name) {
            return Err(KubeApiError::Wait(format!("job {name} already exists")));
        }
        let state = lock(&self.job_outcomes)
            .get(&name)
            .cloned()
            .unwrap_or(JobState::Complete);
        jobs.insert(
            name.clone(),
            JobInfo {
                name,
                annotations: BTreeMap::from([(MANIFEST_HASH_ANNOTATION.to_string(), job.manifest_hash.clone())]),
                state,
            },
        );
        Ok(())
    }

    async fn delete_job(&self, name: &str) -> Result<(), KubeApiError> {
        self.check_reachable()?;
        self.record("delete-job", name);
        lock(&self.jobs).remove(name);
        Ok(())
    }

    async fn wait_job(&self, name: &str, limit: Duration) -> Result<JobState, KubeApiError> {
        self.check_reachable()?;
        match self.job(name).map(|j| j.state) {
            Some(JobState::Complete) => Ok(JobState::Complete),
            Some(JobState::Failed(reason)) => Err(KubeApiError::JobFailed {
                name: name.to_string(),
                reason,
            }),
            Some(JobState::Active) => Err(KubeApiError::Timeout {
                what: format!("job {name}"),
                secs: limit.as_secs(),
            }),
            None => Err(KubeApiError::JobFailed {
                name: name.to_string(),
                reason: "job deleted".to_string(),
            }),
        }
    }
}

#[async_trait::async_trait]
impl KubeConnector for MockKubeApi {
    async fn connect(&self, _kubeconfig: &str) -> Result<Arc<dyn KubeApi>, KubeApiError> {
        self.check_reachable()?;
        Ok(Arc::new(self.clone()))
    }

    async fn healthz(&self, server: &str) -> Result<bool, KubeApiError> {
        self.check_reachable()?;
        Ok(!lock(&self.unhealthy).contains(server.trim_end_matches('/')))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addon(name: &str) -> AddonJob {
        AddonJob {
            addon: name.to_string(),
            node_name: "cp-1".to_string(),
            image: "kubectl".to_string(),
            delete: false,
            manifest_hash: "h1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_cordon_and_uncordon() {
        let api = MockKubeApi::new();
        api.add_node("w1", true);
        api.cordon("w1").await.unwrap();
        assert_eq!(api.is_cordoned("w1"), Some(true));
        api.uncordon("w1").await.unwrap();
        assert_eq!(api.is_cordoned("w1"), Some(false));
        assert!(matches!(api.cordon("missing").await, Err(KubeApiError::NodeNotFound(_))));
    }

    #[tokio::test]
    async fn test_job_outcomes() {
        let api = MockKubeApi::new();
        api.create_job(&addon("rke-coredns")).await.unwrap();
        assert_eq!(
            api.wait_job("rke-coredns-deploy-job", Duration::from_secs(1)).await.unwrap(),
            JobState::Complete
        );

        api.set_job_outcome("rke-metrics-addon-deploy-job", JobState::Failed("boom".to_string()));
        api.create_job(&addon("rke-metrics-addon")).await.unwrap();
        assert!(matches!(
            api.wait_job("rke-metrics-addon-deploy-job", Duration::from_secs(1)).await,
            Err(KubeApiError::JobFailed { .. })
        ));
        assert_eq!(api.job("rke-coredns-deploy-job").unwrap().manifest_hash(), Some("h1"));
    }

    #[tokio::test]
    async fn test_rewrite_secrets() {
        let api = MockKubeApi::new();
        api.add_secret("kube-system/token");
        api.add_secret("default/db");
        assert_eq!(api.rewrite_secrets().await.unwrap(), 2);
        assert_eq!(api.ops_of("rewrite"), vec!["default/db", "kube-system/token"]);
    }

    #[tokio::test]
    async fn test_healthz_per_server() {
        let api = MockKubeApi::new();
        api.set_unhealthy("https://10.0.0.1:6443", true);
        assert!(!api.healthz("https://10.0.0.1:6443").await.unwrap());
        assert!(api.healthz("https://10.0.0.2:6443").await.unwrap());
    }
}
