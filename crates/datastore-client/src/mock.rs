//! Mock etcd ensemble for unit testing
//!
//! `MockEtcd` keeps membership and keys in memory. A successful health probe
//! of `https://<ip>:2379` registers (or starts) the member with peer URL
//! `https://<ip>:2380`, which is how a freshly started etcd container joins.

use crate::datastore_trait::{EtcdClusterApi, EtcdConnector};
use crate::error::DatastoreError;
use crate::models::{CLIENT_PORT, EtcdMember, MemberAddResult, peer_url};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn ip_of(endpoint: &str) -> &str {
    let host = endpoint.trim_start_matches("https://").trim_start_matches("http://");
    host.rsplit_once(':').map_or(host, |(ip, _)| ip)
}

/// Mock etcd cluster
#[derive(Debug, Clone)]
pub struct MockEtcd {
    pub(crate) members: Arc<Mutex<Vec<EtcdMember>>>,
    pub(crate) kv: Arc<Mutex<HashMap<String, String>>>,
    unhealthy: Arc<Mutex<HashSet<String>>>,
    unreachable: Arc<AtomicBool>,
    ops: Arc<Mutex<Vec<String>>>,
    next_id: Arc<AtomicU64>,
}

impl Default for MockEtcd {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEtcd {
    /// Create an empty ensemble
    pub fn new() -> Self {
        Self {
            members: Arc::new(Mutex::new(Vec::new())),
            kv: Arc::new(Mutex::new(HashMap::new())),
            unhealthy: Arc::new(Mutex::new(HashSet::new())),
            unreachable: Arc::new(AtomicBool::new(false)),
            ops: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(0x1000)),
        }
    }

    /// Seed a started member on `ip`
    pub fn add_member(&self, name: &str, ip: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.members).push(EtcdMember {
            id,
            name: name.to_string(),
            peer_urls: vec![peer_url(ip)],
            client_urls: vec![format!("https://{ip}:{CLIENT_PORT}")],
        });
        id
    }

    /// Make the member on `ip` report unhealthy
    pub fn set_unhealthy(&self, ip: &str, unhealthy: bool) {
        let mut set = lock(&self.unhealthy);
        if unhealthy {
            set.insert(ip.to_string());
        } else {
            set.remove(ip);
        }
    }

    /// Make every connect and probe fail
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Current membership
    pub fn members(&self) -> Vec<EtcdMember> {
        lock(&self.members).clone()
    }

    /// Membership operations in order: `add <peer url>`, `remove <id>`
    pub fn ops(&self) -> Vec<String> {
        lock(&self.ops).clone()
    }

    /// Stored value of `key`
    pub fn value(&self, key: &str) -> Option<String> {
        lock(&self.kv).get(key).cloned()
    }

    fn check_reachable(&self) -> Result<(), DatastoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(DatastoreError::Unreachable("mock etcd is unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl EtcdClusterApi for MockEtcd {
    async fn member_list(&self) -> Result<Vec<EtcdMember>, DatastoreError> {
        self.check_reachable()?;
        Ok(self.members())
    }

    async fn member_add(&self, peer_urls: &[String]) -> Result<MemberAddResult, DatastoreError> {
        self.check_reachable()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let member = EtcdMember {
            id,
            name: String::new(),
            peer_urls: peer_urls.to_vec(),
            client_urls: Vec::new(),
        };
        let mut members = lock(&self.members);
        members.push(member.clone());
        lock(&self.ops).push(format!("add {}", peer_urls.join(",")));
        Ok(MemberAddResult {
            member,
            members: members.clone(),
        })
    }

    async fn member_remove(&self, id: u64) -> Result<(), DatastoreError> {
        self.check_reachable()?;
        let mut members = lock(&self.members);
        let before = members.len();
        members.retain(|m| m.id != id);
        if members.len() == before {
            return Err(DatastoreError::NotFound(format!("member {id:x}")));
        }
        lock(&self.ops).push(format!("remove {id:x}"));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, DatastoreError> {
        self.check_reachable()?;
        Ok(self.value(key))
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), DatastoreError> {
        self.check_reachable()?;
        lock(&self.kv).insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[async_trait::async_trait]
impl EtcdConnector for MockEtcd {
    async fn connect(&self, endpoints: &[String]) -> Result<Arc<dyn EtcdClusterApi>, DatastoreError> {
        self.check_reachable()?;
        if endpoints.is_empty() {
            return Err(DatastoreError::InvalidRequest("no etcd endpoints".to_string()));
        }
        Ok(Arc::new(self.clone()))
    }

    async fn health(&self, endpoint: &str) -> Result<bool, DatastoreError> {
        self.check_reachable()?;
        let ip = ip_of(endpoint);
        if lock(&self.unhealthy).contains(ip) {
            return Ok(false);
        }
        let peer = peer_url(ip);
        let mut members = lock(&self.members);
        match members.iter_mut().find(|m| m.has_peer_url(&peer)) {
            Some(member) if !member.is_started() => {
                member.name = format!("etcd-{ip}");
                member.client_urls = vec![endpoint.to_string()];
            }
            Some(_) => {}
            None => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                members.push(EtcdMember {
                    id,
                    name: format!("etcd-{ip}"),
                    peer_urls: vec![peer],
                    client_urls: vec![endpoint.to_string()],
                });
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_probe_registers_member() {
        let etcd = MockEtcd::new();
        assert!(etcd.health("https://10.0.0.1:2379").await.unwrap());
        let members = etcd.members();
        assert_eq!(members.len(), 1);
        assert!(members[0].has_peer_url("https://10.0.0.1:2380"));
    }

    #[tokio::test]
    async fn test_added_member_starts_on_probe() {
        let etcd = MockEtcd::new();
        etcd.add_member("etcd-a", "10.0.0.1");
        let added = etcd.member_add(&["https://10.0.0.2:2380".to_string()]).await.unwrap();
        assert!(!added.member.is_started());
        assert_eq!(added.members.len(), 2);

        etcd.health("https://10.0.0.2:2379").await.unwrap();
        assert!(etcd.members().iter().all(EtcdMember::is_started));
    }

    #[tokio::test]
    async fn test_unhealthy_and_unreachable() {
        let etcd = MockEtcd::new();
        etcd.set_unhealthy("10.0.0.1", true);
        assert!(!etcd.health("https://10.0.0.1:2379").await.unwrap());
        etcd.set_unreachable(true);
        assert!(etcd.member_list().await.is_err());
    }

    #[tokio::test]
    async fn test_remove_unknown_member_fails() {
        let etcd = MockEtcd::new();
        assert!(matches!(etcd.member_remove(7).await, Err(DatastoreError::NotFound(_))));
    }
}
