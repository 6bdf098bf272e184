//! Unit tests for cluster file validation

#[cfg(test)]
mod tests {
    use crate::cluster_spec::{ClusterSpec, NodeConfig, Role};
    use crate::{ConfigError, defaults, validate};

    fn node(address: &str, roles: &[Role]) -> NodeConfig {
        NodeConfig {
            address: address.to_string(),
            user: "ubuntu".to_string(),
            role: roles.to_vec(),
            ..Default::default()
        }
    }

    fn defaulted(nodes: Vec<NodeConfig>) -> ClusterSpec {
        let mut spec = ClusterSpec {
            kubernetes_version: "v1.30.4-rancher1-1".to_string(),
            nodes,
            ..Default::default()
        };
        defaults::apply(&mut spec);
        spec
    }

    fn problems(spec: &ClusterSpec) -> String {
        match validate(spec) {
            Err(ConfigError::Invalid(msg)) => msg,
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn test_single_node_cluster_is_valid() {
        let spec = defaulted(vec![node("10.0.0.1", &[Role::Etcd, Role::ControlPlane, Role::Worker])]);
        assert!(validate(&spec).is_ok());
    }

    #[test]
    fn test_missing_controlplane_is_rejected() {
        let spec = defaulted(vec![node("10.0.0.1", &[Role::Etcd, Role::Worker])]);
        assert!(problems(&spec).contains("at least one controlplane host"));
    }

    #[test]
    fn test_missing_etcd_is_rejected() {
        let spec = defaulted(vec![node("10.0.0.1", &[Role::ControlPlane])]);
        assert!(problems(&spec).contains("at least one etcd host"));
    }

    #[test]
    fn test_even_etcd_count_is_rejected() {
        let spec = defaulted(vec![
            node("10.0.0.1", &[Role::Etcd, Role::ControlPlane]),
            node("10.0.0.2", &[Role::Etcd]),
        ]);
        assert!(problems(&spec).contains("etcd host count must be odd, found 2"));
    }

    #[test]
    fn test_duplicate_hostnames_are_rejected() {
        let mut first = node("10.0.0.1", &[Role::Etcd, Role::ControlPlane]);
        first.hostname_override = "node-a".to_string();
        let mut second = node("10.0.0.2", &[Role::Worker]);
        second.hostname_override = "NODE-A".to_string();
        let spec = defaulted(vec![first, second]);
        assert!(problems(&spec).contains("duplicate hostname node-a"));
    }

    #[test]
    fn test_all_problems_are_reported() {
        let mut spec = defaulted(vec![node("10.0.0.1", &[Role::Worker])]);
        spec.network.plugin = "weave".to_string();
        let msg = problems(&spec);
        assert!(msg.contains("controlplane"));
        assert!(msg.contains("etcd host"));
        assert!(msg.contains("network plugin weave is not supported"));
    }

    #[test]
    fn test_invalid_cidr_is_rejected() {
        let mut spec = defaulted(vec![node("10.0.0.1", &[Role::Etcd, Role::ControlPlane])]);
        spec.services.kube_controller.cluster_cidr = "10.42.0.0".to_string();
        assert!(problems(&spec).contains("cluster_cidr is not a valid CIDR"));
    }

    #[test]
    fn test_external_etcd_needs_certificates() {
        let mut spec = defaulted(vec![node("10.0.0.1", &[Role::ControlPlane, Role::Worker])]);
        spec.services.etcd.external_urls = vec!["https://etcd.example.com:2379".to_string()];
        assert!(problems(&spec).contains("external etcd requires ca_cert, cert and key"));
    }

    #[test]
    fn test_restore_requires_snapshot_name() {
        let mut spec = defaulted(vec![node("10.0.0.1", &[Role::Etcd, Role::ControlPlane])]);
        spec.restore.restore = true;
        assert!(problems(&spec).contains("restore requires snapshot_name"));
    }

    #[test]
    fn test_cluster_file_round_trips_through_yaml() {
        let yaml = r#"
nodes:
  - address: 10.0.0.1
    user: ubuntu
    role: [controlplane, etcd, worker]
services:
  kube-api:
    service_cluster_ip_range: 10.50.0.0/16
  kube-controller:
    service_cluster_ip_range: 10.50.0.0/16
    extra_args:
      node-monitor-grace-period: 20s
"#;
        let mut spec = ClusterSpec::from_yaml(yaml).unwrap();
        defaults::apply(&mut spec);
        assert!(validate(&spec).is_ok());
        assert_eq!(spec.services.kube_api.service_cluster_ip_range, "10.50.0.0/16");
        assert_eq!(
            spec.services.kube_controller.base.extra_args["node-monitor-grace-period"],
            "20s"
        );
        assert!(spec.nodes[0].has_role(Role::ControlPlane));
    }

    #[test]
    fn test_custom_encryption_config_must_be_an_encryption_configuration() {
        let yaml = r#"
nodes:
  - address: 10.0.0.1
    user: ubuntu
    role: [controlplane, etcd, worker]
services:
  kube-api:
    secrets_encryption_config:
      enabled: true
      custom_config:
        apiVersion: apiserver.config.k8s.io/v1
        kind: EncryptionConfiguration
        resources:
          - resources: [secrets]
            providers:
              - identity: {}
"#;
        let mut spec = ClusterSpec::from_yaml(yaml).unwrap();
        defaults::apply(&mut spec);
        assert!(validate(&spec).is_ok());
        assert!(spec.services.kube_api.encryption().is_some());

        let custom = spec
            .services
            .kube_api
            .secrets_encryption_config
            .as_mut()
            .and_then(|c| c.custom_config.as_mut())
            .unwrap();
        custom["kind"] = serde_json::Value::String("ConfigMap".to_string());
        assert!(problems(&spec).contains("must be an EncryptionConfiguration"));
    }
}
