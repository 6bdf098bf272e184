//! Cluster file validation
//!
//! Runs after defaults are applied. Every problem is collected so the user
//! sees the whole list at once.

use crate::cluster_spec::{ClusterSpec, Role};
use crate::error::ConfigError;
use ipnet::IpNet;
use std::collections::HashSet;

const NETWORK_PLUGINS: &[&str] = &["canal", "flannel", "calico", "none"];
const DNS_PROVIDERS: &[&str] = &["coredns", "kube-dns", "none"];
const INGRESS_PROVIDERS: &[&str] = &["nginx", "none"];
const MONITORING_PROVIDERS: &[&str] = &["metrics-server", "none"];
const AUTHORIZATION_MODES: &[&str] = &["rbac", "none"];

/// Validate a defaulted cluster file
///
/// # Errors
///
/// Returns `ConfigError::Invalid` listing every violated rule.
pub fn validate(spec: &ClusterSpec) -> Result<(), ConfigError> {
    let mut problems = Vec::new();
    validate_nodes(spec, &mut problems);
    validate_services(spec, &mut problems);
    validate_options(spec, &mut problems);

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::invalid(problems.join("; ")))
    }
}

fn validate_nodes(spec: &ClusterSpec, problems: &mut Vec<String>) {
    if spec.nodes.is_empty() {
        problems.push("cluster must have at least one node".to_string());
        return;
    }

    let mut addresses = HashSet::new();
    let mut hostnames = HashSet::new();
    for node in &spec.nodes {
        if node.address.is_empty() {
            problems.push("node address must not be empty".to_string());
            continue;
        }
        if node.user.is_empty() {
            problems.push(format!("user for host {} is not provided", node.address));
        }
        if node.role.is_empty() {
            problems.push(format!("role for host {} is not provided", node.address));
        }
        if !addresses.insert(node.address.as_str()) {
            problems.push(format!("duplicate node address {}", node.address));
        }
        if !hostnames.insert(node.hostname()) {
            problems.push(format!("duplicate hostname {}", node.hostname()));
        }
    }

    if spec.hosts_with_role(Role::ControlPlane).count() == 0 {
        problems.push("cluster must have at least one controlplane host".to_string());
    }

    let etcd_count = spec.hosts_with_role(Role::Etcd).count();
    if spec.uses_external_etcd() {
        if etcd_count > 0 {
            problems.push("etcd hosts must not be set when external etcd is used".to_string());
        }
    } else if etcd_count == 0 {
        problems.push("cluster must have at least one etcd host".to_string());
    } else if etcd_count % 2 == 0 {
        problems.push(format!("etcd host count must be odd, found {etcd_count}"));
    }
}

fn validate_cidr(name: &str, value: &str, problems: &mut Vec<String>) {
    if value.parse::<IpNet>().is_err() {
        problems.push(format!("{name} is not a valid CIDR: {value}"));
    }
}

fn validate_services(spec: &ClusterSpec, problems: &mut Vec<String>) {
    let services = &spec.services;
    validate_cidr(
        "kube-api service_cluster_ip_range",
        &services.kube_api.service_cluster_ip_range,
        problems,
    );
    validate_cidr(
        "kube-controller service_cluster_ip_range",
        &services.kube_controller.service_cluster_ip_range,
        problems,
    );
    validate_cidr("kube-controller cluster_cidr", &services.kube_controller.cluster_cidr, problems);

    if services.kube_api.service_cluster_ip_range != services.kube_controller.service_cluster_ip_range {
        problems.push("kube-api and kube-controller service_cluster_ip_range must match".to_string());
    }
    if services.kubelet.cluster_domain.is_empty() {
        problems.push("kubelet cluster_domain must not be empty".to_string());
    }
    if services.kubelet.cluster_dns_server.parse::<std::net::IpAddr>().is_err() {
        problems.push(format!(
            "kubelet cluster_dns_server is not an IP address: {}",
            services.kubelet.cluster_dns_server
        ));
    }

    if spec.uses_external_etcd() {
        let etcd = &services.etcd;
        if etcd.ca_cert.is_empty() || etcd.cert.is_empty() || etcd.key.is_empty() {
            problems.push("external etcd requires ca_cert, cert and key".to_string());
        }
    }

    if let Some(custom) = services.kube_api.encryption().and_then(|c| c.custom_config.as_ref()) {
        let kind = custom.get("kind").and_then(serde_json::Value::as_str);
        if kind != Some("EncryptionConfiguration") {
            problems.push("secrets_encryption_config custom_config must be an EncryptionConfiguration".to_string());
        } else if !custom.get("resources").is_some_and(serde_json::Value::is_array) {
            problems.push("secrets_encryption_config custom_config must list resources".to_string());
        }
    }

    if let Some(s3) = &services.etcd.backup_config.s3_backup_config {
        if s3.bucket_name.is_empty() {
            problems.push("s3 backup requires bucket_name".to_string());
        }
    }
}

fn one_of(name: &str, value: &str, allowed: &[&str], problems: &mut Vec<String>) {
    if !allowed.contains(&value) {
        problems.push(format!(
            "{name} {value} is not supported, expected one of {}",
            allowed.join(", ")
        ));
    }
}

fn validate_options(spec: &ClusterSpec, problems: &mut Vec<String>) {
    one_of("network plugin", &spec.network.plugin, NETWORK_PLUGINS, problems);
    one_of("dns provider", &spec.dns.provider, DNS_PROVIDERS, problems);
    one_of("ingress provider", &spec.ingress.provider, INGRESS_PROVIDERS, problems);
    one_of("monitoring provider", &spec.monitoring.provider, MONITORING_PROVIDERS, problems);
    one_of("authorization mode", &spec.authorization.mode, AUTHORIZATION_MODES, problems);

    if spec.authentication.strategy != "x509" {
        problems.push(format!(
            "authentication strategy {} is not supported",
            spec.authentication.strategy
        ));
    }

    if spec.restore.restore && spec.restore.snapshot_name.is_empty() {
        problems.push("restore requires snapshot_name".to_string());
    }

    let defaults = spec.private_registries.iter().filter(|r| r.is_default).count();
    if defaults > 1 {
        problems.push("only one private registry can be marked is_default".to_string());
    }
}
