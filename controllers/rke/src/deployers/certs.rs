//! Certificate and host file distribution
//!
//! A host's bundle entries are written by the cert-deployer container; the
//! files other components need (cloud config, registry credentials,
//! external etcd material) by the file-deployer. Both only run for hosts
//! whose step is active.

use super::{Deployers, by_host};
use crate::engine::plan::{CERTIFICATES, HOST_FILES, PlanStep};
use crate::error::EngineError;
use crate::services::{
    ETCD_CONTAINER, KUBE_APISERVER_CONTAINER, KUBE_CONTROLLER_CONTAINER, KUBE_SCHEDULER_CONTAINER, KUBELET_CONTAINER,
    KUBEPROXY_CONTAINER, TOOLS_ROLE, tools,
};
use cluster_types::Role;
use pki::CertBundle;
use pki::names::{
    self, API_PROXY_CLIENT_CERT_NAME, CA_CERT_NAME, KUBE_API_CERT_NAME, KUBE_API_KUBELET_CLIENT_CERT_NAME,
    KUBE_CONTROLLER_CERT_NAME, KUBE_NODE_CERT_NAME, KUBE_PROXY_CERT_NAME, KUBE_SCHEDULER_CERT_NAME,
    REQUEST_HEADER_CA_CERT_NAME, SERVICE_ACCOUNT_TOKEN_KEY_NAME,
};
use tracing::{debug, info};

/// Whether `container` reads bundle entry `cert` at start
#[must_use]
pub fn consumes(container: &str, cert: &str) -> bool {
    if cert == CA_CERT_NAME {
        return matches!(
            container,
            ETCD_CONTAINER
                | KUBE_APISERVER_CONTAINER
                | KUBE_CONTROLLER_CONTAINER
                | KUBE_SCHEDULER_CONTAINER
                | KUBELET_CONTAINER
                | KUBEPROXY_CONTAINER
        );
    }
    match container {
        ETCD_CONTAINER => names::is_etcd_cert(cert),
        KUBE_APISERVER_CONTAINER => {
            names::is_etcd_cert(cert)
                || matches!(
                    cert,
                    KUBE_API_CERT_NAME
                        | KUBE_API_KUBELET_CLIENT_CERT_NAME
                        | API_PROXY_CLIENT_CERT_NAME
                        | REQUEST_HEADER_CA_CERT_NAME
                        | SERVICE_ACCOUNT_TOKEN_KEY_NAME
                        | KUBE_NODE_CERT_NAME
                )
        }
        KUBE_CONTROLLER_CONTAINER => matches!(cert, KUBE_CONTROLLER_CERT_NAME | SERVICE_ACCOUNT_TOKEN_KEY_NAME),
        KUBE_SCHEDULER_CONTAINER => cert == KUBE_SCHEDULER_CERT_NAME,
        KUBEPROXY_CONTAINER => cert == KUBE_PROXY_CERT_NAME,
        KUBELET_CONTAINER => names::is_kubelet_cert(cert) || cert == KUBE_NODE_CERT_NAME,
        _ => false,
    }
}

impl Deployers<'_> {
    /// Write the bundle and host files onto every host with an active step
    ///
    /// Failures on hosts without etcd or control plane are recorded as
    /// `EngineError::WorkerDeployFailed`; the returned list names them.
    ///
    /// # Errors
    ///
    /// Fails on the first etcd or control plane host that cannot be written.
    pub async fn distribute(&self, bundle: &CertBundle, steps: &[PlanStep]) -> Result<Vec<EngineError>, EngineError> {
        let grouped = by_host(steps);
        info!("[certificates] Deploying certificates and files to {} host(s)", grouped.len());
        let results = self
            .scheduler
            .run_parallel(grouped, |(address, steps)| async move {
                let node = self.node(&address)?;
                let result = self.distribute_host(bundle, &address, &steps).await;
                match result {
                    Err(e) if !node.has_role(Role::Etcd) && !node.has_role(Role::ControlPlane) => {
                        Err(EngineError::WorkerDeployFailed {
                            host: address,
                            reason: e.to_string(),
                        })
                    }
                    other => other,
                }
            })
            .await;
        let (_, recorded) = crate::engine::scheduler::barrier(CERTIFICATES, results)?;
        Ok(recorded)
    }

    async fn distribute_host(&self, bundle: &CertBundle, address: &str, steps: &[PlanStep]) -> Result<(), EngineError> {
        let node = self.node(address)?;
        let conn = self.hosts.get(address, CERTIFICATES)?;
        if steps.iter().any(|s| s.component == CERTIFICATES) {
            let wanted = bundle.names_for_host(&self.ctx.spec, node);
            debug!("[certificates] Host {} receives {}", address, wanted.join(", "));
            let spec = tools::cert_deployer(self.ctx, bundle, &wanted)?;
            self.operator.run_once(conn, TOOLS_ROLE, spec).await?;
            info!("[certificates] Deployed {} bundle entries to host {}", wanted.len(), address);
        }
        if steps.iter().any(|s| s.component == HOST_FILES) {
            let files = tools::host_files(self.ctx, node).await?;
            if !files.is_empty() {
                let spec = tools::file_deployer(self.ctx, &files)?;
                self.operator.run_once(conn, TOOLS_ROLE, spec).await?;
                info!("[certificates] Deployed {} file(s) to host {}", files.len(), address);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pki::names::{etcd_cert_name, kubelet_cert_name};

    #[test]
    fn test_consumers_of_bundle_entries() {
        assert!(consumes(ETCD_CONTAINER, &etcd_cert_name("10.0.0.1")));
        assert!(consumes(KUBE_APISERVER_CONTAINER, &etcd_cert_name("10.0.0.1")));
        assert!(consumes(KUBE_CONTROLLER_CONTAINER, SERVICE_ACCOUNT_TOKEN_KEY_NAME));
        assert!(consumes(KUBELET_CONTAINER, &kubelet_cert_name("10.0.0.2")));
        assert!(!consumes(KUBEPROXY_CONTAINER, KUBE_NODE_CERT_NAME));
        assert!(!consumes(crate::services::NGINX_PROXY_CONTAINER, CA_CERT_NAME));
        for container in [ETCD_CONTAINER, KUBE_SCHEDULER_CONTAINER, KUBELET_CONTAINER] {
            assert!(consumes(container, CA_CERT_NAME));
        }
    }
}
