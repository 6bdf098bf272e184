//! kubelet, kube-proxy, nginx-proxy and the service sidekick

use super::args::{flag_map, merge_args};
use super::{
    KUBELET_CONTAINER, KUBEPROXY_CONTAINER, KUBERNETES_BIND, NGINX_PROXY_CONTAINER, SIDEKICK_CONTAINER,
    ServiceContext,
};
use crate::error::EngineError;
use crate::metadata::image;
use cluster_types::{NodeConfig, Role, Taint};
use host_driver::{ContainerSpec, RestartPolicy};
use pki::names::{self, CA_CERT_NAME, KUBE_NODE_CERT_NAME, KUBE_PROXY_CERT_NAME};

/// Host path of the kubelet registry credentials
pub const KUBELET_DOCKER_CONFIG_PATH: &str = "/var/lib/kubelet/config.json";

const CONTROLPLANE_TAINT_KEY: &str = "node-role.kubernetes.io/controlplane";
const ETCD_TAINT_KEY: &str = "node-role.kubernetes.io/etcd";

/// Taints the kubelet registers with: the node's own plus role taints
#[must_use]
pub fn node_taints(node: &NodeConfig) -> Vec<Taint> {
    let mut taints = node.taints.clone();
    if node.has_role(Role::Worker) {
        return taints;
    }
    if node.has_role(Role::ControlPlane) {
        taints.push(Taint {
            key: CONTROLPLANE_TAINT_KEY.to_string(),
            value: "true".to_string(),
            effect: "NoSchedule".to_string(),
        });
    }
    if node.has_role(Role::Etcd) {
        taints.push(Taint {
            key: ETCD_TAINT_KEY.to_string(),
            value: "true".to_string(),
            effect: "NoExecute".to_string(),
        });
    }
    taints
}

/// Created-not-started container sharing its volumes with the services
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` when the release lacks the image.
pub fn sidekick(ctx: &ServiceContext) -> Result<ContainerSpec, EngineError> {
    Ok(ContainerSpec {
        name: SIDEKICK_CONTAINER.to_string(),
        image: ctx.image(image::SERVICE_SIDEKICK)?,
        cmd: vec!["/bin/bash".to_string()],
        network_mode: "none".to_string(),
        ..Default::default()
    })
}

/// Local API proxy for hosts without a control plane
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` when the release lacks the image.
pub fn nginx_proxy(ctx: &ServiceContext) -> Result<ContainerSpec, EngineError> {
    let cp_hosts = format!("CP_HOSTS={}", ctx.control_plane_ips().join(","));
    Ok(ContainerSpec {
        name: NGINX_PROXY_CONTAINER.to_string(),
        image: ctx.image(image::NGINX_PROXY)?,
        cmd: vec!["nginx-proxy".to_string(), cp_hosts.clone()],
        env: vec![cp_hosts],
        network_mode: "host".to_string(),
        restart_policy: RestartPolicy::Always,
        ..Default::default()
    })
}

/// The kubelet of `node`
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` when the release lacks an image.
pub fn kubelet(ctx: &ServiceContext, node: &NodeConfig) -> Result<ContainerSpec, EngineError> {
    let service = &ctx.spec.services.kubelet;
    let serving = names::kubelet_cert_name(node.internal_ip());
    let infra_image = if service.infra_container_image.is_empty() {
        ctx.image(image::POD_INFRA)?
    } else {
        service.infra_container_image.clone()
    };

    let mut computed = flag_map([
        ("client-ca-file", names::cert_path(CA_CERT_NAME)),
        ("cluster-dns", service.cluster_dns_server.clone()),
        ("cluster-domain", service.cluster_domain.clone()),
        ("fail-swap-on", service.fail_swap_on.to_string()),
        ("hostname-override", node.hostname().to_string()),
        ("kubeconfig", names::config_path(KUBE_NODE_CERT_NAME)),
        ("node-ip", node.internal_ip().to_string()),
        ("pod-infra-container-image", infra_image),
        ("root-dir", "/var/lib/kubelet".to_string()),
        ("tls-cert-file", names::cert_path(&serving)),
        ("tls-private-key-file", names::key_path(&serving)),
    ]);
    let taints = node_taints(node);
    if !taints.is_empty() {
        computed.insert(
            "register-with-taints".to_string(),
            taints.iter().map(ToString::to_string).collect::<Vec<_>>().join(","),
        );
    }
    if !node.labels.is_empty() {
        computed.insert(
            "node-labels".to_string(),
            node.labels.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(","),
        );
    }
    computed.extend(ctx.cloud_args());

    let mut cmd = vec![KUBELET_CONTAINER.to_string()];
    cmd.extend(merge_args(ctx.defaults(KUBELET_CONTAINER), computed, &service.base.extra_args));

    let mut binds: Vec<String> = [
        KUBERNETES_BIND,
        "/etc/cni:/etc/cni:rw,z",
        "/opt/cni:/opt/cni:rw,z",
        "/var/lib/cni:/var/lib/cni:z",
        "/var/lib/calico:/var/lib/calico:z",
        "/etc/resolv.conf:/etc/resolv.conf",
        "/sys:/sys:rprivate",
        "/var/lib/docker:/var/lib/docker:rw,rslave,z",
        "/var/lib/kubelet:/var/lib/kubelet:shared,z",
        "/var/run:/var/run:rw,rprivate",
        "/run:/run:rprivate",
        "/dev:/host/dev:rprivate",
        "/var/log/containers:/var/log/containers:z",
        "/var/log/pods:/var/log/pods:z",
        "/:/rootfs:ro,rprivate",
    ]
    .iter()
    .map(ToString::to_string)
    .collect();
    binds.extend(service.base.extra_binds.iter().cloned());

    Ok(ContainerSpec {
        name: KUBELET_CONTAINER.to_string(),
        image: ctx.service_image(&service.base, image::KUBERNETES)?,
        cmd,
        env: service.base.extra_env.clone(),
        binds,
        network_mode: "host".to_string(),
        pid_mode: "host".to_string(),
        privileged: true,
        restart_policy: RestartPolicy::Always,
        volumes_from: vec![SIDEKICK_CONTAINER.to_string()],
        ..Default::default()
    })
}

/// kube-proxy of `node`
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` when the release lacks the image.
pub fn kube_proxy(ctx: &ServiceContext, node: &NodeConfig) -> Result<ContainerSpec, EngineError> {
    let service = &ctx.spec.services.kubeproxy;
    let computed = flag_map([
        ("cluster-cidr", ctx.spec.services.kube_controller.cluster_cidr.clone()),
        ("hostname-override", node.hostname().to_string()),
        ("kubeconfig", names::config_path(KUBE_PROXY_CERT_NAME)),
    ]);
    let mut cmd = vec![KUBEPROXY_CONTAINER.to_string()];
    cmd.extend(merge_args(ctx.defaults(KUBEPROXY_CONTAINER), computed, &service.extra_args));
    let mut binds = vec![
        KUBERNETES_BIND.to_string(),
        "/run:/run:rprivate".to_string(),
        "/lib/modules:/lib/modules:z,ro".to_string(),
    ];
    binds.extend(service.extra_binds.iter().cloned());
    Ok(ContainerSpec {
        name: KUBEPROXY_CONTAINER.to_string(),
        image: ctx.service_image(service, image::KUBERNETES)?,
        cmd,
        env: service.extra_env.clone(),
        binds,
        network_mode: "host".to_string(),
        privileged: true,
        restart_policy: RestartPolicy::Always,
        volumes_from: vec![SIDEKICK_CONTAINER.to_string()],
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::args::flag_value;
    use crate::services::tests::{context, node};

    #[test]
    fn test_role_taints() {
        assert!(node_taints(&node("10.0.0.1", &[Role::Worker, Role::ControlPlane])).is_empty());
        let cp = node_taints(&node("10.0.0.1", &[Role::ControlPlane]));
        assert_eq!(cp[0].to_string(), "node-role.kubernetes.io/controlplane=true:NoSchedule");
        let etcd = node_taints(&node("10.0.0.1", &[Role::Etcd]));
        assert_eq!(etcd[0].to_string(), "node-role.kubernetes.io/etcd=true:NoExecute");
    }

    #[test]
    fn test_kubelet_spec() {
        let cp = node("10.0.0.1", &[Role::ControlPlane]);
        let ctx = context(vec![cp.clone()]);
        let spec = kubelet(&ctx, &cp).unwrap();
        assert!(spec.privileged);
        assert!(spec.binds.contains(&"/:/rootfs:ro,rprivate".to_string()));
        assert!(spec.binds.contains(&"/var/lib/kubelet:/var/lib/kubelet:shared,z".to_string()));
        assert_eq!(flag_value(&spec.cmd, "hostname-override"), Some("node-10-0-0-1"));
        assert_eq!(
            flag_value(&spec.cmd, "register-with-taints"),
            Some("node-role.kubernetes.io/controlplane=true:NoSchedule")
        );
        assert_eq!(flag_value(&spec.cmd, "cluster-dns"), Some("10.43.0.10"));
        assert!(flag_value(&spec.cmd, "pod-infra-container-image").is_some_and(|i| i.contains("pause")));
    }

    #[test]
    fn test_nginx_proxy_lists_control_plane() {
        let ctx = context(vec![
            node("10.0.0.1", &[Role::ControlPlane]),
            node("10.0.0.2", &[Role::ControlPlane]),
            node("10.0.0.3", &[Role::Worker]),
        ]);
        let spec = nginx_proxy(&ctx).unwrap();
        assert_eq!(spec.env, vec!["CP_HOSTS=10.0.0.1,10.0.0.2"]);
    }
}
