//! Expected leaves derived from the cluster file
//!
//! Every leaf the cluster needs is described by a `LeafPlan`: its bundle
//! name, subject, SANs and whether it carries a kubeconfig. Generation and
//! reconciliation both start from this list.

use crate::authority::LeafProfile;
use crate::error::{PkiError, Result};
use crate::names::{
    API_PROXY_CLIENT_CERT_NAME, KUBE_ADMIN_CERT_NAME, KUBE_API_CERT_NAME,
    KUBE_API_KUBELET_CLIENT_CERT_NAME, KUBE_CONTROLLER_CERT_NAME, KUBE_NODE_CERT_NAME,
    KUBE_NODE_COMMON_NAME, KUBE_NODE_ORGANIZATION, KUBE_PROXY_CERT_NAME, KUBE_SCHEDULER_CERT_NAME,
    MASTERS_ORGANIZATION, etcd_cert_name, kubelet_cert_name,
};
use cluster_types::{ClusterSpec, NodeConfig, Role};
use ipnet::IpNet;
use std::net::IpAddr;

/// Kind of kubeconfig rendered alongside a leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KubeconfigKind {
    /// No kubeconfig
    None,
    /// File-path kubeconfig used by a component on the host
    Component,
    /// Embedded-data kubeconfig for the operator
    Admin,
}

/// One leaf the cluster needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafPlan {
    /// Bundle entry name
    pub name: String,
    /// Subject and extensions
    pub profile: LeafProfile,
    /// Kubeconfig rendered for the entry
    pub kubeconfig: KubeconfigKind,
}

/// First host address of the service CIDR (the `kubernetes` service IP)
///
/// # Errors
///
/// Returns `PkiError::Invalid` if the range does not parse.
pub fn kubernetes_service_ip(spec: &ClusterSpec) -> Result<IpAddr> {
    let range = &spec.services.kube_api.service_cluster_ip_range;
    let net: IpNet = range
        .parse()
        .map_err(|e| PkiError::Invalid(format!("service_cluster_ip_range {range}: {e}")))?;
    net.hosts()
        .next()
        .ok_or_else(|| PkiError::Invalid(format!("service_cluster_ip_range {range} has no host addresses")))
}

fn push_unique(sans: &mut Vec<String>, value: &str) {
    if !value.is_empty() && !sans.iter().any(|s| s == value) {
        sans.push(value.to_string());
    }
}

fn push_node_names(sans: &mut Vec<String>, node: &NodeConfig) {
    push_unique(sans, &node.address);
    push_unique(sans, &node.internal_address);
    push_unique(sans, &node.hostname_override);
}

/// `kubernetes`, `kubernetes.default`, ... `kubernetes.default.svc.<domain>`
#[must_use]
pub fn api_dns_names(cluster_domain: &str) -> Vec<String> {
    vec![
        "localhost".to_string(),
        "kubernetes".to_string(),
        "kubernetes.default".to_string(),
        "kubernetes.default.svc".to_string(),
        format!("kubernetes.default.svc.{cluster_domain}"),
    ]
}

/// SANs of the API server certificate
///
/// # Errors
///
/// Returns `PkiError::Invalid` if the service CIDR does not parse.
pub fn kube_api_sans(spec: &ClusterSpec) -> Result<Vec<String>> {
    let mut sans = Vec::new();
    for node in spec.hosts_with_role(Role::ControlPlane) {
        push_node_names(&mut sans, node);
    }
    push_unique(&mut sans, "127.0.0.1");
    push_unique(&mut sans, &kubernetes_service_ip(spec)?.to_string());
    for name in api_dns_names(&spec.services.kubelet.cluster_domain) {
        push_unique(&mut sans, &name);
    }
    for extra in &spec.authentication.sans {
        push_unique(&mut sans, extra);
    }
    Ok(sans)
}

/// SANs shared by every etcd certificate
#[must_use]
pub fn etcd_sans(spec: &ClusterSpec) -> Vec<String> {
    let mut sans = Vec::new();
    for node in spec.hosts_with_role(Role::Etcd) {
        push_node_names(&mut sans, node);
    }
    push_unique(&mut sans, "127.0.0.1");
    for name in api_dns_names(&spec.services.kubelet.cluster_domain) {
        push_unique(&mut sans, &name);
    }
    sans
}

/// SANs of a node's kubelet serving certificate
#[must_use]
pub fn kubelet_sans(node: &NodeConfig) -> Vec<String> {
    let mut sans = Vec::new();
    push_node_names(&mut sans, node);
    push_unique(&mut sans, node.hostname());
    sans
}

fn client(name: &str, common_name: &str, organization: &str, kubeconfig: KubeconfigKind) -> LeafPlan {
    LeafPlan {
        name: name.to_string(),
        profile: LeafProfile {
            common_name: common_name.to_string(),
            organization: organization.to_string(),
            sans: Vec::new(),
            server: false,
            client: true,
        },
        kubeconfig,
    }
}

/// Every leaf required by `spec`, in a stable order
///
/// # Errors
///
/// Returns `PkiError::Invalid` if SANs cannot be derived.
pub fn expected_leaves(spec: &ClusterSpec) -> Result<Vec<LeafPlan>> {
    let mut leaves = vec![
        LeafPlan {
            name: KUBE_API_CERT_NAME.to_string(),
            profile: LeafProfile {
                common_name: KUBE_API_CERT_NAME.to_string(),
                organization: String::new(),
                sans: kube_api_sans(spec)?,
                server: true,
                client: true,
            },
            kubeconfig: KubeconfigKind::None,
        },
        client(
            KUBE_API_KUBELET_CLIENT_CERT_NAME,
            KUBE_API_KUBELET_CLIENT_CERT_NAME,
            MASTERS_ORGANIZATION,
            KubeconfigKind::None,
        ),
        client(
            KUBE_CONTROLLER_CERT_NAME,
            "system:kube-controller-manager",
            "",
            KubeconfigKind::Component,
        ),
        client(KUBE_SCHEDULER_CERT_NAME, "system:kube-scheduler", "", KubeconfigKind::Component),
        client(KUBE_PROXY_CERT_NAME, "system:kube-proxy", "", KubeconfigKind::Component),
        client(
            KUBE_NODE_CERT_NAME,
            KUBE_NODE_COMMON_NAME,
            KUBE_NODE_ORGANIZATION,
            KubeconfigKind::Component,
        ),
        client(KUBE_ADMIN_CERT_NAME, KUBE_ADMIN_CERT_NAME, MASTERS_ORGANIZATION, KubeconfigKind::Admin),
        client(
            API_PROXY_CLIENT_CERT_NAME,
            API_PROXY_CLIENT_CERT_NAME,
            "",
            KubeconfigKind::None,
        ),
    ];

    if !spec.uses_external_etcd() {
        let sans = etcd_sans(spec);
        for node in spec.hosts_with_role(Role::Etcd) {
            leaves.push(LeafPlan {
                name: etcd_cert_name(node.internal_ip()),
                profile: LeafProfile {
                    common_name: "kube-etcd".to_string(),
                    organization: String::new(),
                    sans: sans.clone(),
                    server: true,
                    client: true,
                },
                kubeconfig: KubeconfigKind::None,
            });
        }
    }

    for node in spec.nodes.iter().filter(|n| n.is_kubernetes_node()) {
        leaves.push(LeafPlan {
            name: kubelet_cert_name(node.internal_ip()),
            profile: LeafProfile {
                common_name: format!("system:node:{}", node.hostname()),
                organization: KUBE_NODE_ORGANIZATION.to_string(),
                sans: kubelet_sans(node),
                server: true,
                client: true,
            },
            kubeconfig: KubeconfigKind::None,
        });
    }

    Ok(leaves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_types::defaults;

    fn spec() -> ClusterSpec {
        let mut spec = ClusterSpec {
            nodes: vec![
                NodeConfig {
                    address: "10.0.0.1".to_string(),
                    internal_address: "192.168.0.1".to_string(),
                    user: "ubuntu".to_string(),
                    role: vec![Role::Etcd, Role::ControlPlane],
                    ..Default::default()
                },
                NodeConfig {
                    address: "10.0.0.2".to_string(),
                    user: "ubuntu".to_string(),
                    role: vec![Role::Worker],
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        defaults::apply(&mut spec);
        spec
    }

    #[test]
    fn test_service_ip_is_first_host_of_range() {
        assert_eq!(kubernetes_service_ip(&spec()).unwrap().to_string(), "10.43.0.1");
    }

    #[test]
    fn test_api_sans_cover_control_plane_and_service() {
        let sans = kube_api_sans(&spec()).unwrap();
        for expected in [
            "10.0.0.1",
            "192.168.0.1",
            "127.0.0.1",
            "10.43.0.1",
            "kubernetes.default.svc.cluster.local",
        ] {
            assert!(sans.contains(&expected.to_string()), "missing {expected}");
        }
        assert!(!sans.contains(&"10.0.0.2".to_string()));
    }

    #[test]
    fn test_expected_leaves_include_per_host_certs() {
        let leaves = expected_leaves(&spec()).unwrap();
        let names: Vec<&str> = leaves.iter().map(|l| l.name.as_str()).collect();
        assert!(names.contains(&"kube-etcd-192-168-0-1"));
        assert!(names.contains(&"kube-kubelet-192-168-0-1"));
        assert!(names.contains(&"kube-kubelet-10-0-0-2"));
        assert!(!names.contains(&"kube-etcd-10-0-0-2"));
    }

    #[test]
    fn test_external_etcd_has_no_etcd_leaves() {
        let mut spec = spec();
        spec.services.etcd.external_urls = vec!["https://etcd.example.com:2379".to_string()];
        let leaves = expected_leaves(&spec).unwrap();
        assert!(!leaves.iter().any(|l| l.name.starts_with("kube-etcd-")));
    }
}
