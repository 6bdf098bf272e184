//! Bundle entry names, host paths and deployer environment names

/// Cluster CA
pub const CA_CERT_NAME: &str = "kube-ca";
/// API server serving certificate
pub const KUBE_API_CERT_NAME: &str = "kube-apiserver";
/// API server client certificate towards kubelets
pub const KUBE_API_KUBELET_CLIENT_CERT_NAME: &str = "kube-apiserver-kubelet-client";
/// Controller manager client certificate
pub const KUBE_CONTROLLER_CERT_NAME: &str = "kube-controller-manager";
/// Scheduler client certificate
pub const KUBE_SCHEDULER_CERT_NAME: &str = "kube-scheduler";
/// Proxy client certificate
pub const KUBE_PROXY_CERT_NAME: &str = "kube-proxy";
/// Shared kubelet client certificate
pub const KUBE_NODE_CERT_NAME: &str = "kube-node";
/// Cluster admin client certificate
pub const KUBE_ADMIN_CERT_NAME: &str = "kube-admin";
/// Service account token signing key
pub const SERVICE_ACCOUNT_TOKEN_KEY_NAME: &str = "kube-service-account-token";
/// Front proxy (request header) CA
pub const REQUEST_HEADER_CA_CERT_NAME: &str = "kube-apiserver-requestheader-ca";
/// Front proxy client certificate
pub const API_PROXY_CLIENT_CERT_NAME: &str = "kube-apiserver-proxy-client";

/// Directory all bundle files are written to on hosts
pub const SSL_DIR: &str = "/etc/kubernetes/ssl";

/// Subject for the shared kubelet client certificate
pub const KUBE_NODE_COMMON_NAME: &str = "system:node";
/// Organization for node certificates
pub const KUBE_NODE_ORGANIZATION: &str = "system:nodes";
/// Organization that grants cluster-admin
pub const MASTERS_ORGANIZATION: &str = "system:masters";

const ETCD_CERT_PREFIX: &str = "kube-etcd-";
const KUBELET_CERT_PREFIX: &str = "kube-kubelet-";

/// `10.0.0.1` -> `10-0-0-1`
#[must_use]
pub fn address_suffix(address: &str) -> String {
    address.replace(['.', ':'], "-")
}

/// Per-host etcd certificate name
#[must_use]
pub fn etcd_cert_name(address: &str) -> String {
    format!("{ETCD_CERT_PREFIX}{}", address_suffix(address))
}

/// Per-host kubelet serving certificate name
#[must_use]
pub fn kubelet_cert_name(address: &str) -> String {
    format!("{KUBELET_CERT_PREFIX}{}", address_suffix(address))
}

/// Whether `name` is a per-host etcd certificate
#[must_use]
pub fn is_etcd_cert(name: &str) -> bool {
    name.starts_with(ETCD_CERT_PREFIX)
}

/// Whether `name` is a per-host kubelet serving certificate
#[must_use]
pub fn is_kubelet_cert(name: &str) -> bool {
    name.starts_with(KUBELET_CERT_PREFIX)
}

/// Whether `name` is self-signed (a CA) rather than a leaf
#[must_use]
pub fn is_ca(name: &str) -> bool {
    name == CA_CERT_NAME || name == REQUEST_HEADER_CA_CERT_NAME
}

/// CA that signs the leaf `name`
#[must_use]
pub fn issuer_of(name: &str) -> &'static str {
    if name == API_PROXY_CLIENT_CERT_NAME {
        REQUEST_HEADER_CA_CERT_NAME
    } else {
        CA_CERT_NAME
    }
}

/// Host path of the certificate
#[must_use]
pub fn cert_path(name: &str) -> String {
    format!("{SSL_DIR}/{name}.pem")
}

/// Host path of the key
#[must_use]
pub fn key_path(name: &str) -> String {
    format!("{SSL_DIR}/{name}-key.pem")
}

/// Host path of the kubeconfig
#[must_use]
pub fn config_path(name: &str) -> String {
    format!("{SSL_DIR}/kubecfg-{name}.yaml")
}

/// `kube-apiserver` -> `KUBE_APISERVER`
#[must_use]
pub fn env_name(name: &str) -> String {
    name.to_uppercase().replace('-', "_")
}

/// `kube-apiserver` -> `KUBE_APISERVER_KEY`
#[must_use]
pub fn key_env_name(name: &str) -> String {
    format!("{}_KEY", env_name(name))
}

/// `kube-node` -> `KUBECFG_KUBE_NODE`
#[must_use]
pub fn config_env_name(name: &str) -> String {
    format!("KUBECFG_{}", env_name(name))
}

/// Bundle entries owned by a rotatable service
///
/// Per-host entries are matched by prefix, so the returned predicate is
/// applied to every name in the bundle.
#[must_use]
pub fn service_owns(service: &str, name: &str) -> bool {
    match service {
        "etcd" => is_etcd_cert(name),
        "kubelet" => is_kubelet_cert(name) || name == KUBE_NODE_CERT_NAME,
        "kube-apiserver" => matches!(
            name,
            KUBE_API_CERT_NAME | KUBE_API_KUBELET_CLIENT_CERT_NAME | API_PROXY_CLIENT_CERT_NAME
        ),
        "kube-controller-manager" => name == KUBE_CONTROLLER_CERT_NAME,
        "kube-scheduler" => name == KUBE_SCHEDULER_CERT_NAME,
        "kube-proxy" => name == KUBE_PROXY_CERT_NAME,
        _ => false,
    }
}

/// Services accepted by `cert rotate --service`
pub const ROTATABLE_SERVICES: &[&str] = &[
    "etcd",
    "kubelet",
    "kube-apiserver",
    "kube-controller-manager",
    "kube-scheduler",
    "kube-proxy",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_host_names_replace_dots() {
        assert_eq!(etcd_cert_name("10.0.0.1"), "kube-etcd-10-0-0-1");
        assert_eq!(kubelet_cert_name("10.0.0.1"), "kube-kubelet-10-0-0-1");
    }

    #[test]
    fn test_env_names() {
        assert_eq!(env_name("kube-apiserver"), "KUBE_APISERVER");
        assert_eq!(key_env_name("kube-etcd-10-0-0-1"), "KUBE_ETCD_10_0_0_1_KEY");
        assert_eq!(config_env_name("kube-node"), "KUBECFG_KUBE_NODE");
    }

    #[test]
    fn test_paths() {
        assert_eq!(cert_path("kube-ca"), "/etc/kubernetes/ssl/kube-ca.pem");
        assert_eq!(key_path("kube-ca"), "/etc/kubernetes/ssl/kube-ca-key.pem");
        assert_eq!(config_path("kube-node"), "/etc/kubernetes/ssl/kubecfg-kube-node.yaml");
    }

    #[test]
    fn test_service_ownership() {
        assert!(service_owns("etcd", "kube-etcd-10-0-0-1"));
        assert!(service_owns("kubelet", "kube-node"));
        assert!(!service_owns("kube-proxy", "kube-node"));
        assert_eq!(issuer_of(API_PROXY_CLIENT_CERT_NAME), REQUEST_HEADER_CA_CERT_NAME);
    }
}
