//! Parameter maps of the built-in addon templates
//!
//! Rendering is strict, so every map carries every variable its template
//! reads, even when the value is empty.

use crate::error::EngineError;
use crate::metadata::{image, template};
use crate::services::ServiceContext;
use serde_json::{Value, json};

/// Network option naming the flannel interface
pub const FLANNEL_IFACE_OPTION: &str = "flannel_iface";
/// Network option naming the flannel backend type
pub const FLANNEL_BACKEND_OPTION: &str = "flannel_backend_type";

const DEFAULT_FLANNEL_BACKEND: &str = "vxlan";
const REVERSE_CIDRS: &str = "in-addr.arpa ip6.arpa";

fn flannel_options(ctx: &ServiceContext) -> (String, String) {
    let options = &ctx.spec.network.options;
    let iface = options.get(FLANNEL_IFACE_OPTION).cloned().unwrap_or_default();
    let backend = options
        .get(FLANNEL_BACKEND_OPTION)
        .filter(|b| !b.is_empty())
        .cloned()
        .unwrap_or_else(|| DEFAULT_FLANNEL_BACKEND.to_string());
    (iface, backend)
}

/// Template key and parameters of the network plugin `plugin`
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` for an unknown plugin or a missing
/// image.
pub fn network(ctx: &ServiceContext, plugin: &str) -> Result<(&'static str, Value), EngineError> {
    let rbac = ctx.spec.authorization.rbac();
    let cluster_cidr = &ctx.spec.services.kube_controller.cluster_cidr;
    let (iface, backend) = flannel_options(ctx);
    match plugin {
        "flannel" => Ok((
            template::FLANNEL,
            json!({
                "rbac": rbac,
                "cluster_cidr": cluster_cidr,
                "flannel_backend": backend,
                "flannel_iface": iface,
                "flannel_image": ctx.image(image::FLANNEL)?,
                "flannel_cni_image": ctx.image(image::FLANNEL_CNI)?,
            }),
        )),
        "canal" => Ok((
            template::CANAL,
            json!({
                "rbac": rbac,
                "cluster_cidr": cluster_cidr,
                "flannel_backend": backend,
                "flannel_iface": iface,
                "canal_node_image": ctx.image(image::CANAL_NODE)?,
                "canal_cni_image": ctx.image(image::CANAL_CNI)?,
                "canal_flannel_image": ctx.image(image::CANAL_FLANNEL)?,
            }),
        )),
        "calico" => Ok((
            template::CALICO,
            json!({
                "rbac": rbac,
                "cluster_cidr": cluster_cidr,
                "cloud_provider": ctx.spec.cloud_provider.name,
                "calico_node_image": ctx.image(image::CALICO_NODE)?,
                "calico_cni_image": ctx.image(image::CALICO_CNI)?,
                "calico_controllers_image": ctx.image(image::CALICO_CONTROLLERS)?,
            }),
        )),
        other => Err(EngineError::ConfigInvalid(format!("unsupported network plugin {other}"))),
    }
}

/// Template key and parameters of the DNS provider `provider`
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` for an unknown provider or a missing
/// image.
pub fn dns(ctx: &ServiceContext, provider: &str) -> Result<(&'static str, Value), EngineError> {
    let kubelet = &ctx.spec.services.kubelet;
    let upstream = &ctx.spec.dns.upstreamnameservers;
    match provider {
        "coredns" => Ok((
            template::COREDNS,
            json!({
                "rbac": ctx.spec.authorization.rbac(),
                "cluster_domain": kubelet.cluster_domain,
                "cluster_dns_server": kubelet.cluster_dns_server,
                "upstream_nameservers": upstream,
                "reverse_cidrs": REVERSE_CIDRS,
                "coredns_image": ctx.image(image::COREDNS)?,
            }),
        )),
        "kube-dns" => Ok((
            template::KUBEDNS,
            json!({
                "cluster_domain": kubelet.cluster_domain,
                "cluster_dns_server": kubelet.cluster_dns_server,
                "upstream_nameservers": upstream,
                "kubedns_image": ctx.image(image::KUBEDNS)?,
                "dnsmasq_image": ctx.image(image::DNSMASQ)?,
                "kubedns_sidecar_image": ctx.image(image::KUBEDNS_SIDECAR)?,
            }),
        )),
        other => Err(EngineError::ConfigInvalid(format!("unsupported dns provider {other}"))),
    }
}

/// Parameters of the metrics-server addon
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` when the image is missing.
pub fn metrics_server(ctx: &ServiceContext) -> Result<Value, EngineError> {
    Ok(json!({
        "rbac": ctx.spec.authorization.rbac(),
        "metrics_server_image": ctx.image(image::METRICS_SERVER)?,
    }))
}

/// Parameters of the nginx ingress controller
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` when an image is missing.
pub fn nginx_ingress(ctx: &ServiceContext) -> Result<Value, EngineError> {
    Ok(json!({
        "rbac": ctx.spec.authorization.rbac(),
        "node_selector": ctx.spec.ingress.node_selector,
        "ingress_image": ctx.image(image::INGRESS)?,
        "ingress_backend_image": ctx.image(image::INGRESS_BACKEND)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::tests::{context, node};
    use cluster_types::Role;

    #[test]
    fn test_flannel_defaults() {
        let ctx = context(vec![node("10.0.0.1", &[Role::ControlPlane, Role::Etcd, Role::Worker])]);
        let (key, params) = network(&ctx, "flannel").unwrap();
        assert_eq!(key, template::FLANNEL);
        assert_eq!(params["flannel_backend"], "vxlan");
        assert_eq!(params["flannel_iface"], "");
        assert_eq!(params["cluster_cidr"], "10.42.0.0/16");
        assert_eq!(params["rbac"], true);
    }

    #[test]
    fn test_flannel_options_are_passed_through() {
        let mut ctx = context(vec![node("10.0.0.1", &[Role::ControlPlane, Role::Etcd, Role::Worker])]);
        ctx.spec.network.options.insert(FLANNEL_IFACE_OPTION.to_string(), "eth1".to_string());
        ctx.spec.network.options.insert(FLANNEL_BACKEND_OPTION.to_string(), "host-gw".to_string());
        let (_, params) = network(&ctx, "canal").unwrap();
        assert_eq!(params["flannel_iface"], "eth1");
        assert_eq!(params["flannel_backend"], "host-gw");
    }

    #[test]
    fn test_unknown_providers_are_rejected() {
        let ctx = context(vec![node("10.0.0.1", &[Role::ControlPlane])]);
        assert!(network(&ctx, "weave").is_err());
        assert!(dns(&ctx, "unbound").is_err());
    }

    #[test]
    fn test_dns_carries_cluster_settings() {
        let mut ctx = context(vec![node("10.0.0.1", &[Role::ControlPlane])]);
        ctx.spec.dns.upstreamnameservers = vec!["1.1.1.1".to_string()];
        let (key, params) = dns(&ctx, "coredns").unwrap();
        assert_eq!(key, template::COREDNS);
        assert_eq!(params["cluster_dns_server"], "10.43.0.10");
        assert_eq!(params["cluster_domain"], "cluster.local");
        assert_eq!(params["upstream_nameservers"][0], "1.1.1.1");
    }
}
