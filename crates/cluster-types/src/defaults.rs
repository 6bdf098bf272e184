//! Defaults applied to a parsed cluster file before validation

use crate::cluster_spec::ClusterSpec;

/// Service network CIDR
pub const DEFAULT_SERVICE_CLUSTER_IP_RANGE: &str = "10.43.0.0/16";
/// NodePort range
pub const DEFAULT_NODE_PORT_RANGE: &str = "30000-32767";
/// Pod network CIDR
pub const DEFAULT_CLUSTER_CIDR: &str = "10.42.0.0/16";
/// Cluster DNS service address
pub const DEFAULT_CLUSTER_DNS_SERVICE: &str = "10.43.0.10";
/// Cluster DNS domain
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
/// Cluster name
pub const DEFAULT_CLUSTER_NAME: &str = "local";
/// SSH key path
pub const DEFAULT_SSH_KEY_PATH: &str = "~/.ssh/id_rsa";
/// SSH port
pub const DEFAULT_SSH_PORT: &str = "22";
/// Remote Docker socket
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";
/// Authentication strategy
pub const DEFAULT_AUTH_STRATEGY: &str = "x509";
/// Authorization mode
pub const DEFAULT_AUTHORIZATION_MODE: &str = "rbac";
/// Network plugin
pub const DEFAULT_NETWORK_PLUGIN: &str = "canal";
/// Ingress controller
pub const DEFAULT_INGRESS_PROVIDER: &str = "nginx";
/// DNS provider
pub const DEFAULT_DNS_PROVIDER: &str = "coredns";
/// Metrics provider
pub const DEFAULT_MONITORING_PROVIDER: &str = "metrics-server";
/// etcd key prefix used by the API server
pub const DEFAULT_ETCD_PATH: &str = "/registry";
/// Hours between rolling snapshots
pub const DEFAULT_BACKUP_INTERVAL_HOURS: u32 = 12;
/// Rolling snapshots kept
pub const DEFAULT_BACKUP_RETENTION: u32 = 6;
/// S3 endpoint for snapshot upload
pub const DEFAULT_S3_ENDPOINT: &str = "s3.amazonaws.com";
/// Seconds to wait for an addon job
pub const DEFAULT_ADDON_JOB_TIMEOUT: u64 = 30;

fn set_if_empty(field: &mut String, value: &str) {
    if field.is_empty() {
        *field = value.to_string();
    }
}

/// Fill every unset field with its default
pub fn apply(spec: &mut ClusterSpec) {
    set_if_empty(&mut spec.cluster_name, DEFAULT_CLUSTER_NAME);
    set_if_empty(&mut spec.ssh_key_path, DEFAULT_SSH_KEY_PATH);

    for node in &mut spec.nodes {
        set_if_empty(&mut node.port, DEFAULT_SSH_PORT);
        set_if_empty(&mut node.docker_socket, DEFAULT_DOCKER_SOCKET);
        if node.internal_address.is_empty() {
            node.internal_address.clone_from(&node.address);
        }
        if node.hostname_override.is_empty() {
            node.hostname_override.clone_from(&node.address);
        }
        // Hostnames are case-insensitive in Kubernetes
        node.hostname_override = node.hostname_override.to_lowercase();
        node.role.sort();
        node.role.dedup();
    }

    let services = &mut spec.services;
    set_if_empty(&mut services.kube_api.service_cluster_ip_range, DEFAULT_SERVICE_CLUSTER_IP_RANGE);
    set_if_empty(&mut services.kube_api.service_node_port_range, DEFAULT_NODE_PORT_RANGE);
    set_if_empty(&mut services.kube_controller.service_cluster_ip_range, DEFAULT_SERVICE_CLUSTER_IP_RANGE);
    set_if_empty(&mut services.kube_controller.cluster_cidr, DEFAULT_CLUSTER_CIDR);
    set_if_empty(&mut services.kubelet.cluster_dns_server, DEFAULT_CLUSTER_DNS_SERVICE);
    set_if_empty(&mut services.kubelet.cluster_domain, DEFAULT_CLUSTER_DOMAIN);
    set_if_empty(&mut services.etcd.path, DEFAULT_ETCD_PATH);

    let backup = &mut services.etcd.backup_config;
    if backup.interval_hours == 0 {
        backup.interval_hours = DEFAULT_BACKUP_INTERVAL_HOURS;
    }
    if backup.retention == 0 {
        backup.retention = DEFAULT_BACKUP_RETENTION;
    }
    if let Some(s3) = backup.s3_backup_config.as_mut() {
        set_if_empty(&mut s3.endpoint, DEFAULT_S3_ENDPOINT);
    }

    set_if_empty(&mut spec.authentication.strategy, DEFAULT_AUTH_STRATEGY);
    set_if_empty(&mut spec.authorization.mode, DEFAULT_AUTHORIZATION_MODE);
    set_if_empty(&mut spec.network.plugin, DEFAULT_NETWORK_PLUGIN);
    set_if_empty(&mut spec.ingress.provider, DEFAULT_INGRESS_PROVIDER);
    set_if_empty(&mut spec.dns.provider, DEFAULT_DNS_PROVIDER);
    set_if_empty(&mut spec.monitoring.provider, DEFAULT_MONITORING_PROVIDER);

    if spec.addon_job_timeout == 0 {
        spec.addon_job_timeout = DEFAULT_ADDON_JOB_TIMEOUT;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster_spec::{NodeConfig, Role};

    #[test]
    fn test_defaults_fill_unset_fields() {
        let mut spec = ClusterSpec {
            nodes: vec![NodeConfig {
                address: "10.0.0.1".to_string(),
                role: vec![Role::Worker, Role::Etcd, Role::Worker],
                ..Default::default()
            }],
            ..Default::default()
        };
        apply(&mut spec);

        assert_eq!(spec.cluster_name, "local");
        assert_eq!(spec.services.kube_api.service_cluster_ip_range, "10.43.0.0/16");
        assert_eq!(spec.services.kubelet.cluster_domain, "cluster.local");
        assert_eq!(spec.network.plugin, "canal");
        assert_eq!(spec.nodes[0].internal_address, "10.0.0.1");
        assert_eq!(spec.nodes[0].hostname_override, "10.0.0.1");
        assert_eq!(spec.nodes[0].port, "22");
        assert_eq!(spec.nodes[0].role, vec![Role::Etcd, Role::Worker]);
    }

    #[test]
    fn test_defaults_keep_explicit_values() {
        let mut spec = ClusterSpec {
            cluster_name: "prod".to_string(),
            ..Default::default()
        };
        spec.network.plugin = "flannel".to_string();
        apply(&mut spec);

        assert_eq!(spec.cluster_name, "prod");
        assert_eq!(spec.network.plugin, "flannel");
    }
}
