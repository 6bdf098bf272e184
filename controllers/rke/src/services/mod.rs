//! Container specs of the cluster services
//!
//! Each builder turns the cluster file, the resolved release and the host
//! into the `ContainerSpec` the operator converges. Builders are pure; the
//! same inputs always give the same spec, and therefore the same hash.

pub mod args;
pub mod controlplane;
pub mod etcd;
pub mod tools;
pub mod worker;

use crate::cloud::{self, CloudProvider};
use crate::error::EngineError;
use crate::metadata::Release;
use crate::operator::registry::Registries;
use cluster_types::{BaseService, ClusterSpec, NodeConfig, Role};
use std::collections::BTreeMap;

pub const ETCD_CONTAINER: &str = "etcd";
pub const KUBE_APISERVER_CONTAINER: &str = "kube-apiserver";
pub const KUBE_CONTROLLER_CONTAINER: &str = "kube-controller-manager";
pub const KUBE_SCHEDULER_CONTAINER: &str = "kube-scheduler";
pub const KUBELET_CONTAINER: &str = "kubelet";
pub const KUBEPROXY_CONTAINER: &str = "kube-proxy";
pub const NGINX_PROXY_CONTAINER: &str = "nginx-proxy";
pub const SIDEKICK_CONTAINER: &str = "service-sidekick";
pub const ROLLING_SNAPSHOT_CONTAINER: &str = "etcd-rolling-snapshots";

/// Role label of containers that belong to no cluster role
pub const TOOLS_ROLE: &str = "tools";

/// Kubernetes containers on every host, in install order
pub const KUBERNETES_CONTAINERS: &[&str] = &[
    KUBE_APISERVER_CONTAINER,
    KUBE_CONTROLLER_CONTAINER,
    KUBE_SCHEDULER_CONTAINER,
    SIDEKICK_CONTAINER,
    NGINX_PROXY_CONTAINER,
    KUBELET_CONTAINER,
    KUBEPROXY_CONTAINER,
];

/// Shared bind of the Kubernetes config and certificate tree
pub(crate) const KUBERNETES_BIND: &str = "/etc/kubernetes:/etc/kubernetes:z";

/// Everything the builders read
#[derive(Debug)]
pub struct ServiceContext {
    pub spec: ClusterSpec,
    pub release: Release,
    pub registries: Registries,
    /// Secrets encryption provider file, when encryption is on
    pub encryption_config: Option<String>,
    cloud: Option<Box<dyn CloudProvider>>,
}

impl ServiceContext {
    #[must_use]
    pub fn new(spec: ClusterSpec, release: Release, registries: Registries) -> Self {
        let cloud = cloud::from_config(&spec.cloud_provider);
        Self {
            spec,
            release,
            registries,
            encryption_config: None,
            cloud,
        }
    }

    /// Selected cloud provider
    #[must_use]
    pub fn cloud(&self) -> Option<&dyn CloudProvider> {
        self.cloud.as_deref()
    }

    /// Release image for `key`, behind the default registry when one is set
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ConfigInvalid` when the release lacks the image.
    pub fn image(&self, key: &str) -> Result<String, EngineError> {
        Ok(self.registries.system_image(self.release.images.get(key)?))
    }

    /// `base.image` if set, the release image otherwise
    pub(crate) fn service_image(&self, base: &BaseService, key: &str) -> Result<String, EngineError> {
        if base.image.is_empty() {
            self.image(key)
        } else {
            Ok(base.image.clone())
        }
    }

    pub(crate) fn defaults(&self, component: &str) -> BTreeMap<String, String> {
        self.release.service_options.for_component(component)
    }

    pub(crate) fn cloud_args(&self) -> BTreeMap<String, String> {
        self.cloud.as_ref().map(|c| c.component_args()).unwrap_or_default()
    }

    /// Internal addresses of the control plane hosts
    #[must_use]
    pub fn control_plane_ips(&self) -> Vec<String> {
        self.spec
            .hosts_with_role(Role::ControlPlane)
            .map(|n| n.internal_ip().to_string())
            .collect()
    }
}

/// Containers `node` should run for its roles, etcd excluded
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` when an image is missing from the
/// release.
pub fn kubernetes_containers(
    ctx: &ServiceContext,
    node: &NodeConfig,
) -> Result<Vec<(Role, host_driver::ContainerSpec)>, EngineError> {
    let mut out = Vec::new();
    if node.has_role(Role::ControlPlane) {
        out.push((Role::ControlPlane, controlplane::kube_apiserver(ctx, node)?));
        out.push((Role::ControlPlane, controlplane::kube_controller(ctx)?));
        out.push((Role::ControlPlane, controlplane::kube_scheduler(ctx)?));
    }
    if node.is_kubernetes_node() {
        out.push((Role::Worker, worker::sidekick(ctx)?));
        if node.needs_api_proxy() {
            out.push((Role::Worker, worker::nginx_proxy(ctx)?));
        }
        out.push((Role::Worker, worker::kubelet(ctx, node)?));
        out.push((Role::Worker, worker::kube_proxy(ctx, node)?));
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::metadata::Catalog;
    use crate::operator::ecr::AwsEcrTokens;
    use std::sync::Arc;

    pub(crate) fn node(address: &str, roles: &[Role]) -> NodeConfig {
        NodeConfig {
            address: address.to_string(),
            internal_address: address.to_string(),
            hostname_override: format!("node-{}", address.replace('.', "-")),
            user: "rancher".to_string(),
            role: roles.to_vec(),
            ..Default::default()
        }
    }

    pub(crate) fn context(nodes: Vec<NodeConfig>) -> ServiceContext {
        let mut spec = ClusterSpec {
            nodes,
            ..Default::default()
        };
        cluster_types::defaults::apply(&mut spec);
        let release = Catalog::builtin().resolve(&spec.kubernetes_version, &spec.system_images).unwrap();
        let registries = Registries::new(spec.private_registries.clone(), Arc::new(AwsEcrTokens));
        ServiceContext::new(spec, release, registries)
    }

    #[test]
    fn test_containers_per_role() {
        let cp = node("10.0.0.1", &[Role::ControlPlane, Role::Etcd]);
        let worker = node("10.0.0.2", &[Role::Worker]);
        let ctx = context(vec![cp.clone(), worker.clone()]);

        let names = |n: &NodeConfig| -> Vec<String> {
            kubernetes_containers(&ctx, n).unwrap().into_iter().map(|(_, s)| s.name).collect()
        };
        assert_eq!(
            names(&cp),
            vec!["kube-apiserver", "kube-controller-manager", "kube-scheduler", "service-sidekick", "kubelet", "kube-proxy"]
        );
        assert_eq!(names(&worker), vec!["service-sidekick", "nginx-proxy", "kubelet", "kube-proxy"]);
    }
}
