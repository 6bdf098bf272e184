//! In-memory hosts for unit and scenario tests
//!
//! `MockDialer` hands out connections backed by `MockDocker` and `MockShell`.
//! All mocks created from one dialer append to a shared journal, so tests can
//! assert on the order of operations across hosts.

use crate::compat::check_compatibility;
use crate::connection::HostConnection;
use crate::docker_trait::{DockerApi, HostDialer, RemoteShell};
use crate::error::HostError;
use crate::models::{ContainerInfo, ContainerSpec, DockerInfo, ExecOutput, RegistryAuth};
use cluster_types::NodeConfig;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One recorded operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Host address
    pub host: String,
    /// Operation, e.g. `create`, `start`, `remove`, `pull`, `exec`, `run`
    pub op: String,
    /// Container name, image or command
    pub target: String,
}

/// Shared operation log
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl Journal {
    fn record(&self, host: &str, op: &str, target: &str) {
        lock(&self.entries).push(JournalEntry {
            host: host.to_string(),
            op: op.to_string(),
            target: target.to_string(),
        });
    }

    /// Every entry so far
    pub fn entries(&self) -> Vec<JournalEntry> {
        lock(&self.entries).clone()
    }

    /// Entries matching `op`
    pub fn ops(&self, op: &str) -> Vec<JournalEntry> {
        lock(&self.entries).iter().filter(|e| e.op == op).cloned().collect()
    }

    /// Position of the first entry matching host, op and target
    pub fn position(&self, host: &str, op: &str, target: &str) -> Option<usize> {
        lock(&self.entries)
            .iter()
            .position(|e| e.host == host && e.op == op && e.target == target)
    }

    /// Drop all entries
    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

/// In-memory Docker daemon
#[derive(Debug, Clone)]
pub struct MockDocker {
    host: String,
    journal: Journal,
    info: Arc<Mutex<DockerInfo>>,
    pub(crate) containers: Arc<Mutex<HashMap<String, ContainerInfo>>>,
    pub(crate) images: Arc<Mutex<HashSet<String>>>,
    pull_failures: Arc<Mutex<HashMap<String, u32>>>,
    create_failures: Arc<Mutex<HashSet<String>>>,
    exec_results: Arc<Mutex<Vec<(String, ExecOutput)>>>,
    wait_codes: Arc<Mutex<HashMap<String, i64>>>,
    logs: Arc<Mutex<HashMap<String, Vec<String>>>>,
    next_id: Arc<AtomicU64>,
}

impl MockDocker {
    /// Create a daemon for `host` with its own journal
    pub fn new(host: impl Into<String>) -> Self {
        Self::with_journal(host, Journal::default())
    }

    /// Create a daemon for `host` recording into `journal`
    pub fn with_journal(host: impl Into<String>, journal: Journal) -> Self {
        Self {
            host: host.into(),
            journal,
            info: Arc::new(Mutex::new(DockerInfo {
                server_version: "24.0.7".to_string(),
                kernel_version: "5.15.0-91-generic".to_string(),
                operating_system: "Ubuntu 22.04.3 LTS".to_string(),
            })),
            containers: Arc::new(Mutex::new(HashMap::new())),
            images: Arc::new(Mutex::new(HashSet::new())),
            pull_failures: Arc::new(Mutex::new(HashMap::new())),
            create_failures: Arc::new(Mutex::new(HashSet::new())),
            exec_results: Arc::new(Mutex::new(Vec::new())),
            wait_codes: Arc::new(Mutex::new(HashMap::new())),
            logs: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Override the reported Docker server version
    pub fn set_server_version(&self, version: &str) {
        lock(&self.info).server_version = version.to_string();
    }

    /// Seed an existing container
    pub fn add_container(&self, info: ContainerInfo) {
        lock(&self.containers).insert(info.name.clone(), info);
    }

    /// Seed a local image
    pub fn add_image(&self, image: &str) {
        lock(&self.images).insert(image.to_string());
    }

    /// Fail the next `times` pulls of `image`
    pub fn fail_pull(&self, image: &str, times: u32) {
        lock(&self.pull_failures).insert(image.to_string(), times);
    }

    /// Fail every create of container `name`
    pub fn fail_create(&self, name: &str) {
        lock(&self.create_failures).insert(name.to_string());
    }

    /// Return `output` for execs whose `container cmd...` line starts with `prefix`
    pub fn set_exec_result(&self, prefix: &str, output: ExecOutput) {
        lock(&self.exec_results).push((prefix.to_string(), output));
    }

    /// Exit code reported when `name` is waited on
    pub fn set_wait_code(&self, name: &str, code: i64) {
        lock(&self.wait_codes).insert(name.to_string(), code);
    }

    /// Log lines returned for `name`
    pub fn set_logs(&self, name: &str, lines: Vec<String>) {
        lock(&self.logs).insert(name.to_string(), lines);
    }

    /// Current state of a container
    pub fn container(&self, name: &str) -> Option<ContainerInfo> {
        lock(&self.containers).get(name).cloned()
    }

    /// Names of all containers, sorted
    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.containers).keys().cloned().collect();
        names.sort();
        names
    }

    /// The journal this daemon records into
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Targets of this host's journal entries for `op`
    pub fn ops(&self, op: &str) -> Vec<String> {
        self.journal
            .ops(op)
            .into_iter()
            .filter(|e| e.host == self.host)
            .map(|e| e.target)
            .collect()
    }
}

#[async_trait::async_trait]
impl DockerApi for MockDocker {
    async fn info(&self) -> Result<DockerInfo, HostError> {
        Ok(lock(&self.info).clone())
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>, HostError> {
        Ok(self.container(name))
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerInfo>, HostError> {
        let mut found: Vec<ContainerInfo> = lock(&self.containers)
            .values()
            .filter(|c| c.labels.contains_key(label))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn image_exists(&self, image: &str) -> Result<bool, HostError> {
        Ok(lock(&self.images).contains(image))
    }

    async fn pull_image(&self, image: &str, _auth: Option<&RegistryAuth>) -> Result<(), HostError> {
        self.journal.record(&self.host, "pull", image);
        {
            let mut failures = lock(&self.pull_failures);
            if let Some(remaining) = failures.get_mut(image) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(HostError::ImagePull {
                        image: image.to_string(),
                        reason: "connection reset by peer".to_string(),
                    });
                }
            }
        }
        lock(&self.images).insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, HostError> {
        self.journal.record(&self.host, "create", &spec.name);
        if lock(&self.create_failures).contains(&spec.name) {
            return Err(HostError::Api(format!("create of {} refused", spec.name)));
        }
        let mut containers = lock(&self.containers);
        if containers.contains_key(&spec.name) {
            return Err(HostError::Api(format!(
                "Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }
        let id = format!("{:012x}", self.next_id.fetch_add(1, Ordering::SeqCst));
        containers.insert(
            spec.name.clone(),
            ContainerInfo {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                cmd: spec.cmd.clone(),
                env: spec.env.clone(),
                binds: spec.binds.clone(),
                labels: spec.labels.clone(),
                running: false,
                exit_code: None,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, name: &str) -> Result<(), HostError> {
        self.journal.record(&self.host, "start", name);
        let mut containers = lock(&self.containers);
        let container = containers
            .get_mut(name)
            .ok_or_else(|| HostError::NotFound(name.to_string()))?;
        container.running = true;
        container.exit_code = None;
        Ok(())
    }

    async fn stop_container(&self, name: &str, _timeout_secs: i64) -> Result<(), HostError> {
        self.journal.record(&self.host, "stop", name);
        let mut containers = lock(&self.containers);
        let container = containers
            .get_mut(name)
            .ok_or_else(|| HostError::NotFound(name.to_string()))?;
        container.running = false;
        container.exit_code = Some(0);
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<(), HostError> {
        self.journal.record(&self.host, "remove", name);
        lock(&self.containers).remove(name);
        Ok(())
    }

    async fn wait_container(&self, name: &str) -> Result<i64, HostError> {
        let code = lock(&self.wait_codes).get(name).copied().unwrap_or(0);
        let mut containers = lock(&self.containers);
        let container = containers
            .get_mut(name)
            .ok_or_else(|| HostError::NotFound(name.to_string()))?;
        container.running = false;
        container.exit_code = Some(code);
        Ok(code)
    }

    async fn exec(&self, container: &str, cmd: &[String]) -> Result<ExecOutput, HostError> {
        let line = format!("{} {}", container, cmd.join(" "));
        self.journal.record(&self.host, "exec", &line);
        if !lock(&self.containers).get(container).is_some_and(|c| c.running) {
            return Err(HostError::Api(format!("container {container} is not running")));
        }
        let results = lock(&self.exec_results);
        Ok(results
            .iter()
            .rev()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }

    fn logs<'a>(&'a self, name: &'a str, tail: Option<usize>) -> BoxStream<'a, Result<String, HostError>> {
        let lines = lock(&self.logs).get(name).cloned().unwrap_or_default();
        let skip = tail.map_or(0, |n| lines.len().saturating_sub(n));
        stream::iter(lines.into_iter().skip(skip).map(Ok)).boxed()
    }
}

/// In-memory remote shell
#[derive(Debug, Clone)]
pub struct MockShell {
    host: String,
    journal: Journal,
    responses: Arc<Mutex<Vec<(String, ExecOutput)>>>,
}

impl MockShell {
    /// Create a shell for `host` recording into `journal`
    pub fn with_journal(host: impl Into<String>, journal: Journal) -> Self {
        Self {
            host: host.into(),
            journal,
            responses: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Return `output` for commands starting with `prefix`
    pub fn respond(&self, prefix: &str, output: ExecOutput) {
        lock(&self.responses).push((prefix.to_string(), output));
    }

    /// Commands run on this host, in order
    pub fn commands(&self) -> Vec<String> {
        self.journal
            .ops("run")
            .into_iter()
            .filter(|e| e.host == self.host)
            .map(|e| e.target)
            .collect()
    }
}

#[async_trait::async_trait]
impl RemoteShell for MockShell {
    async fn run(&self, command: &str) -> Result<ExecOutput, HostError> {
        self.journal.record(&self.host, "run", command);
        let responses = lock(&self.responses);
        Ok(responses
            .iter()
            .rev()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
struct MockHost {
    docker: MockDocker,
    shell: MockShell,
    reachable: bool,
}

/// Dialer over in-memory hosts
#[derive(Debug, Clone, Default)]
pub struct MockDialer {
    journal: Journal,
    hosts: Arc<Mutex<HashMap<String, MockHost>>>,
}

impl MockDialer {
    /// Create an empty dialer
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reachable host, returning handles to its daemon and shell
    pub fn add_host(&self, address: &str) -> (MockDocker, MockShell) {
        let docker = MockDocker::with_journal(address, self.journal.clone());
        let shell = MockShell::with_journal(address, self.journal.clone());
        lock(&self.hosts).insert(
            address.to_string(),
            MockHost {
                docker: docker.clone(),
                shell: shell.clone(),
                reachable: true,
            },
        );
        (docker, shell)
    }

    /// Daemon of a registered host
    pub fn docker(&self, address: &str) -> Option<MockDocker> {
        lock(&self.hosts).get(address).map(|h| h.docker.clone())
    }

    /// Shell of a registered host
    pub fn shell(&self, address: &str) -> Option<MockShell> {
        lock(&self.hosts).get(address).map(|h| h.shell.clone())
    }

    /// Make a host refuse connections
    pub fn set_reachable(&self, address: &str, reachable: bool) {
        if let Some(host) = lock(&self.hosts).get_mut(address) {
            host.reachable = reachable;
        }
    }

    /// Shared journal of every host
    pub fn journal(&self) -> &Journal {
        &self.journal
    }
}

#[async_trait::async_trait]
impl HostDialer for MockDialer {
    async fn connect(&self, node: &NodeConfig) -> Result<HostConnection, HostError> {
        let host = lock(&self.hosts).get(&node.address).cloned();
        let host = match host {
            Some(h) if h.reachable => h,
            _ => {
                return Err(HostError::Unreachable {
                    host: node.address.clone(),
                    reason: "connection refused".to_string(),
                })
            }
        };
        let info = host.docker.info().await?;
        check_compatibility(&node.address, &info, "", false)?;
        Ok(HostConnection::new(
            node.clone(),
            Arc::new(host.docker),
            Arc::new(host.shell),
            info,
            None,
        ))
    }
}
