//! Datastore client traits for mocking
//!
//! `EtcdConnector` hands out `EtcdClusterApi` handles and probes member
//! health; the coordinator in the binary only sees these traits.

use crate::error::DatastoreError;
use crate::models::{EtcdMember, MemberAddResult};
use std::sync::Arc;

/// etcd cluster and key-value operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait EtcdClusterApi: Send + Sync {
    /// Current membership
    async fn member_list(&self) -> Result<Vec<EtcdMember>, DatastoreError>;

    /// Add a member advertising `peer_urls`
    async fn member_add(&self, peer_urls: &[String]) -> Result<MemberAddResult, DatastoreError>;

    /// Remove a member by id
    async fn member_remove(&self, id: u64) -> Result<(), DatastoreError>;

    /// Read a key
    async fn get(&self, key: &str) -> Result<Option<String>, DatastoreError>;

    /// Write a key
    async fn put(&self, key: &str, value: &str) -> Result<(), DatastoreError>;
}

/// Connects to an ensemble and probes individual members
#[async_trait::async_trait]
pub trait EtcdConnector: Send + Sync {
    /// Open a client over `endpoints` (client URLs)
    async fn connect(&self, endpoints: &[String]) -> Result<Arc<dyn EtcdClusterApi>, DatastoreError>;

    /// `GET <endpoint>/health`; `true` when the member reports healthy
    async fn health(&self, endpoint: &str) -> Result<bool, DatastoreError>;
}
