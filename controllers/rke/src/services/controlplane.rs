//! kube-apiserver, kube-controller-manager and kube-scheduler

use super::args::{flag_map, merge_args};
use super::etcd::endpoints;
use super::{
    KUBE_APISERVER_CONTAINER, KUBE_CONTROLLER_CONTAINER, KUBE_SCHEDULER_CONTAINER, KUBERNETES_BIND,
    SIDEKICK_CONTAINER, ServiceContext,
};
use crate::encryption::ENCRYPTION_CONFIG_PATH;
use crate::error::EngineError;
use crate::metadata::image;
use cluster_types::{BaseService, NodeConfig};
use host_driver::{ContainerSpec, RestartPolicy};
use pki::names::{
    self, API_PROXY_CLIENT_CERT_NAME, CA_CERT_NAME, KUBE_API_CERT_NAME, KUBE_API_KUBELET_CLIENT_CERT_NAME,
    KUBE_CONTROLLER_CERT_NAME, KUBE_NODE_CERT_NAME, KUBE_SCHEDULER_CERT_NAME, REQUEST_HEADER_CA_CERT_NAME,
    SERVICE_ACCOUNT_TOKEN_KEY_NAME,
};
use std::collections::BTreeMap;

/// Host paths of the external etcd client material
pub const EXTERNAL_ETCD_CA_PATH: &str = "/etc/kubernetes/ssl/kube-etcd-external-ca.pem";
pub const EXTERNAL_ETCD_CERT_PATH: &str = "/etc/kubernetes/ssl/kube-etcd-external.pem";
pub const EXTERNAL_ETCD_KEY_PATH: &str = "/etc/kubernetes/ssl/kube-etcd-external-key.pem";

/// Control plane containers, in start order
pub const CONTAINERS: &[&str] = &[KUBE_APISERVER_CONTAINER, KUBE_CONTROLLER_CONTAINER, KUBE_SCHEDULER_CONTAINER];

fn container(
    ctx: &ServiceContext,
    name: &str,
    base: &BaseService,
    defaults: BTreeMap<String, String>,
    computed: BTreeMap<String, String>,
) -> Result<ContainerSpec, EngineError> {
    let mut cmd = vec![name.to_string()];
    cmd.extend(merge_args(defaults, computed, &base.extra_args));
    let mut binds = vec![KUBERNETES_BIND.to_string()];
    binds.extend(base.extra_binds.iter().cloned());
    Ok(ContainerSpec {
        name: name.to_string(),
        image: ctx.service_image(base, image::KUBERNETES)?,
        cmd,
        env: base.extra_env.clone(),
        binds,
        network_mode: "host".to_string(),
        restart_policy: RestartPolicy::Always,
        volumes_from: vec![SIDEKICK_CONTAINER.to_string()],
        ..Default::default()
    })
}

/// The API server of `node`
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` when the release lacks the image.
pub fn kube_apiserver(ctx: &ServiceContext, node: &NodeConfig) -> Result<ContainerSpec, EngineError> {
    let spec = &ctx.spec;
    let service = &spec.services.kube_api;
    let (etcd_ca, etcd_cert, etcd_key) = if spec.uses_external_etcd() {
        (
            EXTERNAL_ETCD_CA_PATH.to_string(),
            EXTERNAL_ETCD_CERT_PATH.to_string(),
            EXTERNAL_ETCD_KEY_PATH.to_string(),
        )
    } else {
        (
            names::cert_path(CA_CERT_NAME),
            names::cert_path(KUBE_NODE_CERT_NAME),
            names::key_path(KUBE_NODE_CERT_NAME),
        )
    };
    let authorization = if spec.authorization.rbac() { "Node,RBAC" } else { "AlwaysAllow" };

    let mut computed = flag_map([
        ("advertise-address", node.internal_ip().to_string()),
        ("authorization-mode", authorization.to_string()),
        ("client-ca-file", names::cert_path(CA_CERT_NAME)),
        ("etcd-servers", endpoints(spec).join(",")),
        ("etcd-prefix", spec.services.etcd.path.clone()),
        ("etcd-cafile", etcd_ca),
        ("etcd-certfile", etcd_cert),
        ("etcd-keyfile", etcd_key),
        ("kubelet-client-certificate", names::cert_path(KUBE_API_KUBELET_CLIENT_CERT_NAME)),
        ("kubelet-client-key", names::key_path(KUBE_API_KUBELET_CLIENT_CERT_NAME)),
        ("kubelet-preferred-address-types", "InternalIP,ExternalIP,Hostname".to_string()),
        ("proxy-client-cert-file", names::cert_path(API_PROXY_CLIENT_CERT_NAME)),
        ("proxy-client-key-file", names::key_path(API_PROXY_CLIENT_CERT_NAME)),
        ("requestheader-allowed-names", API_PROXY_CLIENT_CERT_NAME.to_string()),
        ("requestheader-client-ca-file", names::cert_path(REQUEST_HEADER_CA_CERT_NAME)),
        ("service-account-issuer", "rke".to_string()),
        ("service-account-key-file", names::key_path(SERVICE_ACCOUNT_TOKEN_KEY_NAME)),
        ("service-account-signing-key-file", names::key_path(SERVICE_ACCOUNT_TOKEN_KEY_NAME)),
        ("service-cluster-ip-range", service.service_cluster_ip_range.clone()),
        ("service-node-port-range", service.service_node_port_range.clone()),
        ("tls-cert-file", names::cert_path(KUBE_API_CERT_NAME)),
        ("tls-private-key-file", names::key_path(KUBE_API_CERT_NAME)),
    ]);
    if ctx.encryption_config.is_some() {
        computed.insert("encryption-provider-config".to_string(), ENCRYPTION_CONFIG_PATH.to_string());
    }
    computed.extend(ctx.cloud_args());
    container(ctx, KUBE_APISERVER_CONTAINER, &service.base, ctx.defaults(KUBE_APISERVER_CONTAINER), computed)
}

/// The controller manager
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` when the release lacks the image.
pub fn kube_controller(ctx: &ServiceContext) -> Result<ContainerSpec, EngineError> {
    let service = &ctx.spec.services.kube_controller;
    let mut computed = flag_map([
        ("cluster-cidr", service.cluster_cidr.clone()),
        ("kubeconfig", names::config_path(KUBE_CONTROLLER_CERT_NAME)),
        ("root-ca-file", names::cert_path(CA_CERT_NAME)),
        ("service-account-private-key-file", names::key_path(SERVICE_ACCOUNT_TOKEN_KEY_NAME)),
        ("service-cluster-ip-range", service.service_cluster_ip_range.clone()),
        ("use-service-account-credentials", "true".to_string()),
    ]);
    computed.extend(ctx.cloud_args());
    container(ctx, KUBE_CONTROLLER_CONTAINER, &service.base, ctx.defaults(KUBE_CONTROLLER_CONTAINER), computed)
}

/// The scheduler
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` when the release lacks the image.
pub fn kube_scheduler(ctx: &ServiceContext) -> Result<ContainerSpec, EngineError> {
    let computed = flag_map([("kubeconfig", names::config_path(KUBE_SCHEDULER_CERT_NAME))]);
    container(
        ctx,
        KUBE_SCHEDULER_CONTAINER,
        &ctx.spec.services.scheduler,
        ctx.defaults(KUBE_SCHEDULER_CONTAINER),
        computed,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::args::flag_value;
    use crate::services::tests::{context, node};
    use cluster_types::{CloudProviderConfig, Role};

    #[test]
    fn test_apiserver_flags() {
        let cp = node("10.0.0.1", &[Role::ControlPlane, Role::Etcd]);
        let etcd = node("10.0.0.2", &[Role::Etcd]);
        let mut ctx = context(vec![cp.clone(), etcd]);
        ctx.spec.services.kube_api.base.extra_args.insert("profiling".to_string(), String::new());
        ctx.spec.services.kube_api.base.extra_args.insert("audit-log-maxage".to_string(), "30".to_string());

        let spec = kube_apiserver(&ctx, &cp).unwrap();
        assert_eq!(spec.cmd[0], "kube-apiserver");
        assert_eq!(
            flag_value(&spec.cmd, "etcd-servers"),
            Some("https://10.0.0.1:2379,https://10.0.0.2:2379")
        );
        assert_eq!(flag_value(&spec.cmd, "service-cluster-ip-range"), Some("10.43.0.0/16"));
        assert_eq!(flag_value(&spec.cmd, "authorization-mode"), Some("Node,RBAC"));
        assert_eq!(flag_value(&spec.cmd, "audit-log-maxage"), Some("30"));
        assert_eq!(flag_value(&spec.cmd, "profiling"), None);
        assert_eq!(flag_value(&spec.cmd, "secure-port"), Some("6443"));
        assert_eq!(spec.volumes_from, vec!["service-sidekick"]);

        let mut sorted = spec.cmd[1..].to_vec();
        sorted.sort();
        assert_eq!(sorted, spec.cmd[1..].to_vec());
    }

    #[test]
    fn test_cloud_provider_args() {
        let cp = node("10.0.0.1", &[Role::ControlPlane]);
        let base = context(vec![cp]);
        let mut spec = base.spec;
        spec.cloud_provider = CloudProviderConfig {
            name: "aws".to_string(),
            ..Default::default()
        };
        let ctx = ServiceContext::new(spec, base.release, base.registries);
        let controller = kube_controller(&ctx).unwrap();
        assert_eq!(flag_value(&controller.cmd, "cloud-provider"), Some("aws"));
        assert_eq!(flag_value(&controller.cmd, "cloud-config"), Some("/etc/kubernetes/cloud-config"));
        let scheduler = kube_scheduler(&ctx).unwrap();
        assert_eq!(flag_value(&scheduler.cmd, "cloud-provider"), None);
    }

    #[test]
    fn test_encryption_provider_flag() {
        let cp = node("10.0.0.1", &[Role::ControlPlane, Role::Etcd]);
        let mut ctx = context(vec![cp.clone()]);
        let plain = kube_apiserver(&ctx, &cp).unwrap();
        assert_eq!(flag_value(&plain.cmd, "encryption-provider-config"), None);

        ctx.encryption_config = Some("kind: EncryptionConfiguration\n".to_string());
        let encrypted = kube_apiserver(&ctx, &cp).unwrap();
        assert_eq!(
            flag_value(&encrypted.cmd, "encryption-provider-config"),
            Some("/etc/kubernetes/ssl/encryption.yaml")
        );
    }
}
