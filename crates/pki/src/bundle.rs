//! The certificate bundle
//!
//! `CertBundle` wraps the persisted `CertificatePki` map and answers the
//! questions deployers ask: which entries a host needs, and how they travel
//! into the cert-deployer container.

use crate::authority::CertificateAuthority;
use crate::error::{PkiError, Result};
use crate::names::{
    self, API_PROXY_CLIENT_CERT_NAME, CA_CERT_NAME, KUBE_ADMIN_CERT_NAME, KUBE_API_CERT_NAME,
    KUBE_API_KUBELET_CLIENT_CERT_NAME, KUBE_CONTROLLER_CERT_NAME, KUBE_NODE_CERT_NAME,
    KUBE_PROXY_CERT_NAME, KUBE_SCHEDULER_CERT_NAME, REQUEST_HEADER_CA_CERT_NAME,
    SERVICE_ACCOUNT_TOKEN_KEY_NAME,
};
use crate::verify::verify_signed_by;
use cluster_types::{CertificatePki, ClusterSpec, NodeConfig, Role};
use std::collections::BTreeMap;

/// All certificates, keys and kubeconfigs of a cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertBundle {
    entries: BTreeMap<String, CertificatePki>,
}

impl CertBundle {
    /// Wrap a persisted bundle
    #[must_use]
    pub fn from_map(entries: BTreeMap<String, CertificatePki>) -> Self {
        Self { entries }
    }

    /// Persisted form
    #[must_use]
    pub fn into_map(self) -> BTreeMap<String, CertificatePki> {
        self.entries
    }

    /// Borrow the persisted form
    #[must_use]
    pub fn as_map(&self) -> &BTreeMap<String, CertificatePki> {
        &self.entries
    }

    /// Whether the bundle is empty (first install)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CertificatePki> {
        self.entries.get(name)
    }

    /// Entry names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub(crate) fn insert(&mut self, entry: CertificatePki) {
        self.entries.insert(entry.name.clone(), entry);
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<CertificatePki> {
        self.entries.remove(name)
    }

    /// Load a CA entry as a signing authority
    ///
    /// # Errors
    ///
    /// Returns `PkiError::MissingCa` if the entry is absent or has no key.
    pub fn authority(&self, name: &str) -> Result<CertificateAuthority> {
        let entry = self
            .entries
            .get(name)
            .filter(|e| !e.certificate_pem.is_empty() && !e.key_pem.is_empty())
            .ok_or_else(|| PkiError::MissingCa(name.to_string()))?;
        CertificateAuthority::from_pem(name, &entry.certificate_pem, &entry.key_pem)
    }

    /// The cluster CA
    ///
    /// # Errors
    ///
    /// Returns `PkiError::MissingCa` if the bundle has no CA.
    pub fn ca(&self) -> Result<CertificateAuthority> {
        self.authority(CA_CERT_NAME)
    }

    /// Verify every leaf against its issuing CA
    ///
    /// Returns the failures; an empty list means the bundle is consistent.
    #[must_use]
    pub fn verify(&self) -> Vec<PkiError> {
        let mut failures = Vec::new();
        for (name, entry) in &self.entries {
            if names::is_ca(name) || entry.certificate_pem.is_empty() {
                continue;
            }
            let issuer = names::issuer_of(name);
            match self.entries.get(issuer) {
                Some(ca) => {
                    if let Err(e) = verify_signed_by(name, &entry.certificate_pem, &ca.certificate_pem) {
                        failures.push(e);
                    }
                }
                None => failures.push(PkiError::MissingCa(issuer.to_string())),
            }
        }
        failures
    }

    /// Entries a host needs on disk, by role
    #[must_use]
    pub fn names_for_host(&self, spec: &ClusterSpec, node: &NodeConfig) -> Vec<String> {
        let mut wanted: Vec<String> = vec![CA_CERT_NAME.to_string()];
        if node.is_kubernetes_node() {
            wanted.extend(
                [KUBE_NODE_CERT_NAME, KUBE_PROXY_CERT_NAME]
                    .iter()
                    .map(ToString::to_string),
            );
            wanted.push(names::kubelet_cert_name(node.internal_ip()));
        }
        if node.has_role(Role::ControlPlane) {
            wanted.extend(
                [
                    KUBE_API_CERT_NAME,
                    KUBE_API_KUBELET_CLIENT_CERT_NAME,
                    KUBE_CONTROLLER_CERT_NAME,
                    KUBE_SCHEDULER_CERT_NAME,
                    KUBE_ADMIN_CERT_NAME,
                    SERVICE_ACCOUNT_TOKEN_KEY_NAME,
                    REQUEST_HEADER_CA_CERT_NAME,
                    API_PROXY_CLIENT_CERT_NAME,
                ]
                .iter()
                .map(ToString::to_string),
            );
        }
        if node.has_role(Role::Etcd) && !spec.uses_external_etcd() {
            for etcd in spec.hosts_with_role(Role::Etcd) {
                wanted.push(names::etcd_cert_name(etcd.internal_ip()));
            }
        }
        wanted.retain(|n| self.entries.contains_key(n));
        wanted.sort();
        wanted.dedup();
        wanted
    }

    /// `NAME=value` pairs carrying the `wanted` entries into the cert-deployer
    ///
    /// CA keys stay off hosts.
    #[must_use]
    pub fn deployer_env(&self, wanted: &[String]) -> Vec<String> {
        let mut env = Vec::new();
        for name in wanted {
            let Some(entry) = self.entries.get(name) else {
                continue;
            };
            if !entry.certificate_pem.is_empty() {
                env.push(format!("{}={}", entry.env_name, entry.certificate_pem));
            }
            if !entry.key_pem.is_empty() && !names::is_ca(name) {
                env.push(format!("{}={}", entry.key_env_name, entry.key_pem));
            }
            if !entry.config.is_empty() && entry.name != KUBE_ADMIN_CERT_NAME {
                env.push(format!("{}={}", entry.config_env_name, entry.config));
            }
        }
        env
    }

    /// Names whose content differs between `self` and `other`
    #[must_use]
    pub fn changed_since(&self, other: &CertBundle) -> Vec<String> {
        let mut changed: Vec<String> = self
            .entries
            .iter()
            .filter(|(name, entry)| other.entries.get(*name) != Some(entry))
            .map(|(name, _)| name.clone())
            .collect();
        changed.extend(
            other
                .entries
                .keys()
                .filter(|name| !self.entries.contains_key(*name))
                .cloned(),
        );
        changed.sort();
        changed
    }

    /// Admin kubeconfig, if generated
    #[must_use]
    pub fn admin_kubeconfig(&self) -> Option<&str> {
        self.entries
            .get(KUBE_ADMIN_CERT_NAME)
            .map(|e| e.config.as_str())
            .filter(|c| !c.is_empty())
    }
}
