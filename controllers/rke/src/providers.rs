//! Node-source providers for `rke config`
//!
//! A provider turns some external description of machines into
//! `NodeConfig` entries: it is initialised, lists the node names found in
//! its input, then reads the configuration of the selected names.

use crate::error::EngineError;
use cluster_types::{NodeConfig, Role};
use host_driver::expand_home;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Source of node descriptions
#[async_trait::async_trait]
pub trait NodeSource: Send + Sync + std::fmt::Debug {
    /// Prepare the provider (default paths, environment)
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ConfigInvalid` when the provider cannot work here.
    async fn init(&mut self) -> Result<(), EngineError>;

    /// Names of the nodes described by `input`
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ConfigInvalid` for unreadable or malformed input.
    async fn nodes_from_config(&mut self, input: &str) -> Result<Vec<String>, EngineError>;

    /// Node entries for the selected names, in the given order
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ConfigInvalid` for unknown names.
    async fn read_node_configurations(&self, names: &[String]) -> Result<Vec<NodeConfig>, EngineError>;
}

async fn read(path: &Path) -> Result<String, EngineError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| EngineError::ConfigInvalid(format!("failed to read {}: {e}", path.display())))
}

fn parse_roles(raw: &str) -> Result<Vec<Role>, EngineError> {
    raw.split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(|r| match r {
            "etcd" => Ok(Role::Etcd),
            "controlplane" => Ok(Role::ControlPlane),
            "worker" => Ok(Role::Worker),
            other => Err(EngineError::ConfigInvalid(format!("unknown role {other}"))),
        })
        .collect()
}

fn all_roles() -> Vec<Role> {
    vec![Role::Etcd, Role::ControlPlane, Role::Worker]
}

/// YAML inventory: a list of node descriptors with a `name`
#[derive(Debug, Default)]
pub struct InventorySource {
    nodes: BTreeMap<String, NodeConfig>,
}

#[derive(Debug, Deserialize)]
struct InventoryEntry {
    name: String,
    #[serde(flatten)]
    node: NodeConfig,
}

impl InventorySource {
    fn parse(&mut self, contents: &str) -> Result<Vec<String>, EngineError> {
        let entries: Vec<InventoryEntry> = serde_yaml::from_str(contents)
            .map_err(|e| EngineError::ConfigInvalid(format!("invalid inventory: {e}")))?;
        let mut names = Vec::with_capacity(entries.len());
        for entry in entries {
            if self.nodes.insert(entry.name.clone(), entry.node).is_some() {
                return Err(EngineError::ConfigInvalid(format!("duplicate inventory entry {}", entry.name)));
            }
            names.push(entry.name);
        }
        Ok(names)
    }
}

#[async_trait::async_trait]
impl NodeSource for InventorySource {
    async fn init(&mut self) -> Result<(), EngineError> {
        self.nodes.clear();
        Ok(())
    }

    async fn nodes_from_config(&mut self, input: &str) -> Result<Vec<String>, EngineError> {
        let contents = read(&expand_home(input)).await?;
        self.parse(&contents)
    }

    async fn read_node_configurations(&self, names: &[String]) -> Result<Vec<NodeConfig>, EngineError> {
        names
            .iter()
            .map(|name| {
                let mut node = self
                    .nodes
                    .get(name)
                    .cloned()
                    .ok_or_else(|| EngineError::ConfigInvalid(format!("node {name} is not in the inventory")))?;
                if node.hostname_override.is_empty() {
                    node.hostname_override.clone_from(name);
                }
                if node.role.is_empty() {
                    node.role = all_roles();
                }
                Ok(node)
            })
            .collect()
    }
}

/// `/etc/hosts` style file: `address hostname [roles]`
///
/// Roles are comma separated; a line without roles gets all three.
#[derive(Debug, Default)]
pub struct HostsSource {
    user: String,
    nodes: BTreeMap<String, NodeConfig>,
}

impl HostsSource {
    /// Source whose nodes log in as `user`
    #[must_use]
    pub fn new(user: &str) -> Self {
        Self {
            user: user.to_string(),
            nodes: BTreeMap::new(),
        }
    }

    fn parse(&mut self, contents: &str) -> Result<Vec<String>, EngineError> {
        let mut names = Vec::new();
        for line in contents.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            let mut fields = line.split_whitespace();
            let (Some(address), Some(hostname)) = (fields.next(), fields.next()) else {
                continue;
            };
            if address.starts_with("127.") || address == "::1" {
                continue;
            }
            let role = match fields.next() {
                Some(raw) => parse_roles(raw)?,
                None => all_roles(),
            };
            self.nodes.insert(
                hostname.to_string(),
                NodeConfig {
                    address: address.to_string(),
                    hostname_override: hostname.to_string(),
                    user: self.user.clone(),
                    role,
                    ..Default::default()
                },
            );
            names.push(hostname.to_string());
        }
        Ok(names)
    }
}

#[async_trait::async_trait]
impl NodeSource for HostsSource {
    async fn init(&mut self) -> Result<(), EngineError> {
        if self.user.is_empty() {
            self.user = std::env::var("USER").unwrap_or_else(|_| "root".to_string());
        }
        self.nodes.clear();
        Ok(())
    }

    async fn nodes_from_config(&mut self, input: &str) -> Result<Vec<String>, EngineError> {
        let contents = read(&expand_home(input)).await?;
        self.parse(&contents)
    }

    async fn read_node_configurations(&self, names: &[String]) -> Result<Vec<NodeConfig>, EngineError> {
        names
            .iter()
            .map(|name| {
                self.nodes
                    .get(name)
                    .cloned()
                    .ok_or_else(|| EngineError::ConfigInvalid(format!("host {name} is not in the hosts file")))
            })
            .collect()
    }
}

/// docker-machine store: `<store>/machines/<name>/config.json`
#[derive(Debug, Default)]
pub struct DockerMachineSource {
    store: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MachineConfig {
    #[serde(default)]
    driver: MachineDriver,
    #[serde(default)]
    host_options: MachineHostOptions,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MachineDriver {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
    #[serde(rename = "SSHKeyPath", default)]
    ssh_key_path: String,
    #[serde(rename = "SSHPort", default)]
    ssh_port: u16,
    #[serde(rename = "SSHUser", default)]
    ssh_user: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MachineHostOptions {
    #[serde(default)]
    engine_options: MachineEngineOptions,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MachineEngineOptions {
    #[serde(default)]
    labels: Vec<String>,
}

/// Roles from engine labels such as `etcd=true`; all roles when none match
fn roles_from_labels(labels: &[String]) -> Vec<Role> {
    let mut roles: Vec<Role> = labels
        .iter()
        .filter_map(|label| {
            let (key, value) = label.split_once('=')?;
            if value.trim().parse::<bool>().ok()? {
                parse_roles(key).ok()?.into_iter().next()
            } else {
                None
            }
        })
        .collect();
    if roles.is_empty() {
        roles = all_roles();
    }
    roles.sort();
    roles.dedup();
    roles
}

impl DockerMachineSource {
    #[must_use]
    pub fn new(store: impl Into<PathBuf>) -> Self {
        Self { store: store.into() }
    }

    fn node_from_machine(name: &str, config: MachineConfig) -> NodeConfig {
        let port = if config.driver.ssh_port == 0 { 22 } else { config.driver.ssh_port };
        if config.driver.ip_address.is_empty() {
            info!("IPAddress is not defined in the config.json for machine {}", name);
        }
        NodeConfig {
            address: config.driver.ip_address,
            hostname_override: name.to_string(),
            user: config.driver.ssh_user,
            ssh_key_path: config.driver.ssh_key_path,
            port: port.to_string(),
            role: roles_from_labels(&config.host_options.engine_options.labels),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl NodeSource for DockerMachineSource {
    async fn init(&mut self) -> Result<(), EngineError> {
        if self.store.as_os_str().is_empty() {
            self.store = expand_home("~/.docker/machine/machines");
        } else if !self.store.ends_with("machines") {
            self.store = self.store.join("machines");
        }
        Ok(())
    }

    async fn nodes_from_config(&mut self, input: &str) -> Result<Vec<String>, EngineError> {
        if !input.trim().is_empty() {
            self.store = expand_home(input.trim());
            self.init().await?;
        }
        let mut dir = tokio::fs::read_dir(&self.store)
            .await
            .map_err(|e| EngineError::ConfigInvalid(format!("failed to list {}: {e}", self.store.display())))?;
        let mut names = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| EngineError::ConfigInvalid(format!("failed to list {}: {e}", self.store.display())))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn read_node_configurations(&self, names: &[String]) -> Result<Vec<NodeConfig>, EngineError> {
        let mut nodes = Vec::with_capacity(names.len());
        for name in names {
            let path = self.store.join(name).join("config.json");
            debug!("Reading machine config {}", path.display());
            let config: MachineConfig = serde_json::from_str(&read(&path).await?)
                .map_err(|e| EngineError::ConfigInvalid(format!("invalid {}: {e}", path.display())))?;
            nodes.push(Self::node_from_machine(name, config));
        }
        Ok(nodes)
    }
}

/// Providers by name
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Box<dyn NodeSource>>,
}

impl ProviderRegistry {
    /// Registry with every built-in provider
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry.providers.insert("inventory".to_string(), Box::<InventorySource>::default());
        registry.providers.insert("hosts".to_string(), Box::<HostsSource>::default());
        registry.providers.insert("docker-machine".to_string(), Box::<DockerMachineSource>::default());
        registry
    }

    /// Add a provider
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ConfigInvalid` if the name is taken.
    pub fn register(&mut self, name: &str, provider: Box<dyn NodeSource>) -> Result<(), EngineError> {
        if self.providers.contains_key(name) {
            return Err(EngineError::ConfigInvalid(format!("node configuration provider {name} exists")));
        }
        self.providers.insert(name.to_string(), provider);
        Ok(())
    }

    /// Registered names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// Initialised provider by name
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ConfigInvalid` for an unknown name or a failed init.
    pub async fn get(&mut self, name: &str) -> Result<&mut dyn NodeSource, EngineError> {
        let provider = self
            .providers
            .get_mut(name)
            .ok_or_else(|| EngineError::ConfigInvalid(format!("no such provider {name}")))?;
        provider.init().await?;
        Ok(provider.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hosts_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(
            &path,
            "127.0.0.1 localhost\n10.0.0.1 cp1 etcd,controlplane # first\n\n10.0.0.2 w1 worker\n10.0.0.3 all\n",
        )
        .unwrap();

        let mut registry = ProviderRegistry::builtin();
        let source = registry.get("hosts").await.unwrap();
        let names = source.nodes_from_config(path.to_str().unwrap()).await.unwrap();
        assert_eq!(names, vec!["cp1", "w1", "all"]);

        let nodes = source
            .read_node_configurations(&["w1".to_string(), "cp1".to_string()])
            .await
            .unwrap();
        assert_eq!(nodes[0].address, "10.0.0.2");
        assert_eq!(nodes[0].role, vec![Role::Worker]);
        assert_eq!(nodes[1].role, vec![Role::Etcd, Role::ControlPlane]);
        assert!(source.read_node_configurations(&["nope".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn test_inventory_defaults_roles_and_hostname() {
        let mut source = InventorySource::default();
        let names = source
            .parse("- name: node-a\n  address: 10.0.0.5\n  user: ubuntu\n- name: node-b\n  address: 10.0.0.6\n  role: [worker]\n")
            .unwrap();
        assert_eq!(names, vec!["node-a", "node-b"]);
        let nodes = source.read_node_configurations(&names).await.unwrap();
        assert_eq!(nodes[0].hostname_override, "node-a");
        assert_eq!(nodes[0].role.len(), 3);
        assert_eq!(nodes[1].role, vec![Role::Worker]);
    }

    #[test]
    fn test_machine_labels() {
        assert_eq!(
            roles_from_labels(&["etcd=true".to_string(), "worker=false".to_string()]),
            vec![Role::Etcd]
        );
        assert_eq!(roles_from_labels(&[]).len(), 3);
    }

    #[tokio::test]
    async fn test_docker_machine_store() {
        let dir = tempfile::tempdir().unwrap();
        let machine = dir.path().join("machines").join("m1");
        std::fs::create_dir_all(&machine).unwrap();
        std::fs::write(
            machine.join("config.json"),
            r#"{"Driver":{"IPAddress":"192.168.99.100","SSHKeyPath":"/keys/id_rsa","SSHPort":0,"SSHUser":"docker"},
               "HostOptions":{"EngineOptions":{"Labels":["controlplane=true"]}}}"#,
        )
        .unwrap();

        let mut source = DockerMachineSource::default();
        source.init().await.unwrap();
        let names = source.nodes_from_config(dir.path().to_str().unwrap()).await.unwrap();
        assert_eq!(names, vec!["m1"]);
        let nodes = source.read_node_configurations(&names).await.unwrap();
        assert_eq!(nodes[0].address, "192.168.99.100");
        assert_eq!(nodes[0].port, "22");
        assert_eq!(nodes[0].role, vec![Role::ControlPlane]);
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = ProviderRegistry::builtin();
        assert!(registry.register("hosts", Box::<HostsSource>::default()).is_err());
        assert!(registry.names().any(|n| n == "docker-machine"));
    }
}
