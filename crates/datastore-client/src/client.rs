//! etcd client over gRPC plus the HTTPS health probe

use crate::datastore_trait::{EtcdClusterApi, EtcdConnector};
use crate::error::DatastoreError;
use crate::models::{EtcdMember, MemberAddResult};
use etcd_client::{Certificate, Client, ConnectOptions, Identity, TlsOptions};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Client certificate material for etcd
#[derive(Clone)]
pub struct EtcdTls {
    /// CA certificate PEM
    pub ca_pem: String,
    /// Client certificate PEM
    pub cert_pem: String,
    /// Client key PEM
    pub key_pem: String,
}

impl fmt::Debug for EtcdTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtcdTls").finish_non_exhaustive()
    }
}

fn to_member(member: &etcd_client::Member) -> EtcdMember {
    EtcdMember {
        id: member.id(),
        name: member.name().to_string(),
        peer_urls: member.peer_urls().to_vec(),
        client_urls: member.client_urls().to_vec(),
    }
}

/// etcd v3 client
#[derive(Clone)]
pub struct EtcdClient {
    client: Client,
}

impl fmt::Debug for EtcdClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtcdClient").finish_non_exhaustive()
    }
}

impl EtcdClient {
    /// Connect to `endpoints`
    ///
    /// # Errors
    ///
    /// Returns `DatastoreError::Etcd` if no endpoint accepts the connection.
    pub async fn connect(endpoints: &[String], tls: Option<&EtcdTls>, timeout: Duration) -> Result<Self, DatastoreError> {
        if endpoints.is_empty() {
            return Err(DatastoreError::InvalidRequest("no etcd endpoints".to_string()));
        }
        let mut options = ConnectOptions::new()
            .with_connect_timeout(timeout)
            .with_timeout(timeout);
        if let Some(tls) = tls {
            options = options.with_tls(
                TlsOptions::new()
                    .ca_certificate(Certificate::from_pem(&tls.ca_pem))
                    .identity(Identity::from_pem(&tls.cert_pem, &tls.key_pem)),
            );
        }
        debug!("Connecting to etcd endpoints {:?}", endpoints);
        let client = Client::connect(endpoints, Some(options)).await?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl EtcdClusterApi for EtcdClient {
    async fn member_list(&self) -> Result<Vec<EtcdMember>, DatastoreError> {
        let mut client = self.client.clone();
        let response = client.member_list().await?;
        Ok(response.members().iter().map(to_member).collect())
    }

    async fn member_add(&self, peer_urls: &[String]) -> Result<MemberAddResult, DatastoreError> {
        let mut client = self.client.clone();
        let response = client.member_add(peer_urls.to_vec(), None).await?;
        let member = response
            .member()
            .map(to_member)
            .ok_or_else(|| DatastoreError::NotFound(format!("member add for {peer_urls:?} returned no member")))?;
        Ok(MemberAddResult {
            member,
            members: response.member_list().iter().map(to_member).collect(),
        })
    }

    async fn member_remove(&self, id: u64) -> Result<(), DatastoreError> {
        let mut client = self.client.clone();
        client.member_remove(id).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, DatastoreError> {
        let mut client = self.client.clone();
        let response = client.get(key, None).await?;
        match response.kvs().first() {
            Some(kv) => Ok(Some(kv.value_str()?.to_string())),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), DatastoreError> {
        let mut client = self.client.clone();
        client.put(key, value, None).await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct HealthResponse {
    health: serde_json::Value,
}

/// Connector used by the engine
#[derive(Debug, Clone)]
pub struct EtcdClientFactory {
    tls: Option<EtcdTls>,
    timeout: Duration,
    http: reqwest::Client,
}

impl EtcdClientFactory {
    /// Build a connector; `tls` is the node client certificate and the CA
    ///
    /// # Errors
    ///
    /// Returns `DatastoreError::Tls` if the PEM material is rejected.
    pub fn new(tls: Option<EtcdTls>, timeout: Duration) -> Result<Self, DatastoreError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(tls) = &tls {
            let ca = reqwest::Certificate::from_pem(tls.ca_pem.as_bytes())
                .map_err(|e| DatastoreError::Tls(format!("invalid CA certificate: {e}")))?;
            let identity = reqwest::Identity::from_pem(format!("{}\n{}", tls.cert_pem, tls.key_pem).as_bytes())
                .map_err(|e| DatastoreError::Tls(format!("invalid client certificate: {e}")))?;
            builder = builder.add_root_certificate(ca).identity(identity);
        }
        let http = builder.build()?;
        Ok(Self { tls, timeout, http })
    }
}

#[async_trait::async_trait]
impl EtcdConnector for EtcdClientFactory {
    async fn connect(&self, endpoints: &[String]) -> Result<Arc<dyn EtcdClusterApi>, DatastoreError> {
        let client = EtcdClient::connect(endpoints, self.tls.as_ref(), self.timeout).await?;
        Ok(Arc::new(client))
    }

    async fn health(&self, endpoint: &str) -> Result<bool, DatastoreError> {
        let url = format!("{}/health", endpoint.trim_end_matches('/'));
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            debug!("etcd health {} returned {}", url, response.status());
            return Ok(false);
        }
        let body: HealthResponse = response.json().await?;
        Ok(match body.health {
            serde_json::Value::Bool(b) => b,
            serde_json::Value::String(s) => s == "true",
            _ => false,
        })
    }
}
