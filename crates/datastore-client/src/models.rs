//! etcd member and snapshot types

use serde::{Deserialize, Serialize};

/// Client port of every member
pub const CLIENT_PORT: u16 = 2379;
/// Peer port of every member
pub const PEER_PORT: u16 = 2380;

/// `https://<ip>:2379`
#[must_use]
pub fn client_url(ip: &str) -> String {
    format!("https://{ip}:{CLIENT_PORT}")
}

/// `https://<ip>:2380`
#[must_use]
pub fn peer_url(ip: &str) -> String {
    format!("https://{ip}:{PEER_PORT}")
}

/// One etcd cluster member
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EtcdMember {
    /// Member id
    pub id: u64,
    /// Member name (empty until the member has started)
    pub name: String,
    /// Peer URLs
    pub peer_urls: Vec<String>,
    /// Client URLs (empty until the member has started)
    pub client_urls: Vec<String>,
}

impl EtcdMember {
    /// Whether the member was added but has not started yet
    #[must_use]
    pub fn is_started(&self) -> bool {
        !self.name.is_empty()
    }

    /// Whether the member advertises `peer_url`
    #[must_use]
    pub fn has_peer_url(&self, peer_url: &str) -> bool {
        self.peer_urls.iter().any(|u| u == peer_url)
    }
}

/// Result of a `MemberAdd`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberAddResult {
    /// The added member
    pub member: EtcdMember,
    /// Membership after the add, including the new member
    pub members: Vec<EtcdMember>,
}

/// A snapshot file on an etcd host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotFile {
    /// File name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Modification time, seconds since the epoch
    pub modified: i64,
}
