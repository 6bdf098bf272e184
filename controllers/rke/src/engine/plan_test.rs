use super::*;
use crate::operator::ROLE_LABEL;
use crate::services::tests::{context, node};
use crate::services::{KUBE_APISERVER_CONTAINER, KUBELET_CONTAINER, KUBEPROXY_CONTAINER, NGINX_PROXY_CONTAINER};
use host_driver::ContainerInfo;
use pki::{KeyAlgorithm, PkiOptions};

const TOKEN: &str = "etcd-cluster-test";

fn running(role: &str, spec: &ContainerSpec) -> ContainerInfo {
    let spec = labelled(spec.clone(), role);
    ContainerInfo {
        id: format!("id-{}", spec.name),
        name: spec.name.clone(),
        image: spec.image.clone(),
        cmd: spec.cmd.clone(),
        env: spec.env.clone(),
        binds: spec.binds.clone(),
        labels: spec.labels.clone(),
        running: true,
        exit_code: None,
    }
}

/// Hosts running exactly what `ctx` wants
fn converged(ctx: &ServiceContext) -> BTreeMap<String, HostState> {
    let members = ctx.spec.nodes_with_role(Role::Etcd);
    let bootstrap = EtcdBootstrap::new_cluster(TOKEN, &members);
    let mut observed = BTreeMap::new();
    for node in &ctx.spec.nodes {
        let mut state = HostState {
            address: node.address.clone(),
            docker_version: "24.0.9".to_string(),
            containers: BTreeMap::new(),
        };
        let mut add = |role: &str, spec: ContainerSpec| {
            state.containers.insert(spec.name.clone(), running(role, &spec));
        };
        if node.has_role(Role::Etcd) {
            add(Role::Etcd.as_str(), etcd::etcd_container(ctx, node, &bootstrap).unwrap());
        }
        for (role, spec) in kubernetes_containers(ctx, node).unwrap() {
            add(role.as_str(), spec);
        }
        observed.insert(node.address.clone(), state);
    }
    observed
}

fn three_nodes() -> ServiceContext {
    context(vec![
        node("10.0.0.1", &[Role::ControlPlane, Role::Etcd]),
        node("10.0.0.2", &[Role::Worker]),
        node("10.0.0.3", &[Role::Worker]),
    ])
}

fn fast_pki() -> PkiOptions {
    PkiOptions {
        ca_algorithm: KeyAlgorithm::EcdsaP256,
        leaf_algorithm: KeyAlgorithm::EcdsaP256,
    }
}

/// Plan against a bundle generated for `ctx`, so per-host certificate
/// names are known
fn compute(
    ctx: &ServiceContext,
    previous: Option<&ClusterSpec>,
    observed: &BTreeMap<String, HostState>,
    changed: &BTreeSet<String>,
    update_only: bool,
) -> Plan {
    let bundle = pki::generate(&ctx.spec, &fast_pki()).unwrap();
    Plan::compute(PlanInput {
        ctx,
        previous,
        observed,
        bundle: &bundle,
        changed_certs: changed,
        addons: Vec::new(),
        update_only,
    })
    .unwrap()
}

fn step<'a>(plan: &'a Plan, layer: Layer, host: &str, component: &str) -> &'a PlanStep {
    plan.steps(layer)
        .iter()
        .find(|s| s.host == host && s.component == component)
        .unwrap_or_else(|| panic!("no {component} step on {host} in {layer}"))
}

#[test]
fn test_fresh_cluster_deploys_everything() {
    let ctx = three_nodes();
    let plan = compute(&ctx, None, &BTreeMap::new(), &BTreeSet::new(), false);

    assert_eq!(plan.steps(Layer::Certificates).len(), 6);
    assert!(plan.steps(Layer::Certificates).iter().all(|s| s.action == Action::Deploy));
    assert_eq!(step(&plan, Layer::Etcd, "10.0.0.1", ETCD_CONTAINER).action, Action::Deploy);
    assert_eq!(step(&plan, Layer::Etcd, "10.0.0.1", ROLLING_SNAPSHOT_CONTAINER).action, Action::Noop);
    assert_eq!(plan.steps(Layer::ControlPlane).len(), 3);
    assert_eq!(step(&plan, Layer::Workers, "10.0.0.2", NGINX_PROXY_CONTAINER).action, Action::Deploy);
    assert!(plan.steps(Layer::Removals).is_empty());
    assert_eq!(plan.hosts(Layer::Workers).len(), 3);
}

#[test]
fn test_converged_cluster_is_noop() {
    let ctx = three_nodes();
    let observed = converged(&ctx);
    let plan = compute(&ctx, Some(&ctx.spec), &observed, &BTreeSet::new(), false);
    let busy: Vec<String> = Layer::ALL
        .iter()
        .flat_map(|l| plan.active(*l))
        .map(|s| s.to_string())
        .collect();
    assert!(plan.is_noop(), "active steps: {busy:?}");
    assert_eq!(plan.counts().get(&Action::Deploy), None);
}

#[test]
fn test_changed_flag_upgrades_only_that_component() {
    let ctx = three_nodes();
    let observed = converged(&ctx);
    let mut changed = three_nodes();
    changed
        .spec
        .services
        .kubelet
        .base
        .extra_args
        .insert("max-pods".to_string(), "150".to_string());

    let plan = compute(&changed, Some(&ctx.spec), &observed, &BTreeSet::new(), false);
    let active = plan.active(Layer::Workers);
    assert_eq!(active.len(), 3);
    assert!(active.iter().all(|s| s.component == KUBELET_CONTAINER && s.action == Action::Upgrade));
    assert!(plan.active(Layer::ControlPlane).is_empty());
    assert!(plan.active(Layer::Etcd).is_empty());
}

#[test]
fn test_stopped_container_is_restarted() {
    let ctx = three_nodes();
    let mut observed = converged(&ctx);
    if let Some(info) = observed
        .get_mut("10.0.0.2")
        .and_then(|h| h.containers.get_mut(KUBEPROXY_CONTAINER))
    {
        info.running = false;
    }
    let plan = compute(&ctx, Some(&ctx.spec), &observed, &BTreeSet::new(), false);
    assert_eq!(step(&plan, Layer::Workers, "10.0.0.2", KUBEPROXY_CONTAINER).action, Action::Upgrade);
    assert_eq!(plan.active(Layer::Workers).len(), 1);
}

#[test]
fn test_departed_host_is_removed_and_cleaned() {
    let previous = three_nodes();
    let observed = converged(&previous);
    let ctx = context(vec![
        node("10.0.0.1", &[Role::ControlPlane, Role::Etcd]),
        node("10.0.0.2", &[Role::Worker]),
    ]);

    let plan = compute(&ctx, Some(&previous.spec), &observed, &BTreeSet::new(), false);
    let removals = plan.steps(Layer::Removals);
    assert!(removals.iter().all(|s| s.host == "10.0.0.3" && s.action == Action::Remove));
    assert!(removals.iter().any(|s| s.component == KUBELET_CONTAINER));
    assert_eq!(removals.last().map(|s| s.component.as_str()), Some(CLEANUP));
    assert!(plan.steps(Layer::Certificates).iter().all(|s| s.host != "10.0.0.3"));
}

#[test]
fn test_role_change_removes_control_plane() {
    let previous = three_nodes();
    let observed = converged(&previous);
    let ctx = context(vec![
        node("10.0.0.1", &[Role::Worker]),
        node("10.0.0.2", &[Role::ControlPlane, Role::Etcd]),
        node("10.0.0.3", &[Role::Worker]),
    ]);

    let plan = compute(&ctx, Some(&previous.spec), &observed, &BTreeSet::new(), false);
    let removed: Vec<&PlanStep> = plan
        .steps(Layer::Removals)
        .iter()
        .filter(|s| s.host == "10.0.0.1")
        .collect();
    assert_eq!(removed.len(), 3);
    assert!(removed.iter().all(|s| s.role == Role::ControlPlane.as_str()));
    assert_eq!(step(&plan, Layer::Workers, "10.0.0.1", NGINX_PROXY_CONTAINER).action, Action::Deploy);
    assert_eq!(step(&plan, Layer::Certificates, "10.0.0.1", CERTIFICATES).action, Action::Upgrade);
    assert_eq!(step(&plan, Layer::Etcd, "10.0.0.1", ETCD_CONTAINER).action, Action::Remove);
    assert_eq!(step(&plan, Layer::Etcd, "10.0.0.2", ETCD_CONTAINER).action, Action::Deploy);
}

#[test]
fn test_observed_role_label_names_removal_role() {
    let ctx = three_nodes();
    let mut observed = converged(&ctx);
    let stray = running(Role::Worker.as_str(), &crate::services::worker::nginx_proxy(&ctx).unwrap());
    assert_eq!(stray.labels.get(ROLE_LABEL).map(String::as_str), Some("worker"));
    if let Some(host) = observed.get_mut("10.0.0.1") {
        host.containers.insert(NGINX_PROXY_CONTAINER.to_string(), stray);
    }
    let plan = compute(&ctx, Some(&ctx.spec), &observed, &BTreeSet::new(), false);
    let removal = step(&plan, Layer::Removals, "10.0.0.1", NGINX_PROXY_CONTAINER);
    assert_eq!(removal.action, Action::Remove);
    assert_eq!(removal.role, Role::Worker.as_str());
}

#[test]
fn test_changed_certificate_restarts_consumers() {
    let ctx = three_nodes();
    let observed = converged(&ctx);
    let changed = BTreeSet::from([pki::names::KUBE_API_CERT_NAME.to_string()]);

    let plan = compute(&ctx, Some(&ctx.spec), &observed, &changed, false);
    assert_eq!(step(&plan, Layer::Certificates, "10.0.0.1", CERTIFICATES).action, Action::Upgrade);
    assert_eq!(step(&plan, Layer::Certificates, "10.0.0.2", CERTIFICATES).action, Action::Noop);

    let apiserver = step(&plan, Layer::ControlPlane, "10.0.0.1", KUBE_APISERVER_CONTAINER);
    assert_eq!(apiserver.action, Action::Upgrade);
    assert!(apiserver.is_restart());
    assert!(apiserver.to_string().ends_with("(restart)"));
    assert_eq!(plan.active(Layer::ControlPlane).len(), 1);
    assert!(plan.active(Layer::Workers).is_empty());
}

#[test]
fn test_ca_change_restarts_every_consumer() {
    let ctx = three_nodes();
    let observed = converged(&ctx);
    let changed = BTreeSet::from([pki::names::CA_CERT_NAME.to_string()]);

    let plan = compute(&ctx, Some(&ctx.spec), &observed, &changed, false);
    let etcd = step(&plan, Layer::Etcd, "10.0.0.1", ETCD_CONTAINER);
    assert!(etcd.is_restart());
    assert!(plan.active(Layer::Workers).iter().all(PlanStep::is_restart));
    assert_eq!(plan.active(Layer::Workers).len(), 6);
    assert_eq!(plan.active(Layer::ControlPlane).len(), 3);
}

#[test]
fn test_update_only_limits_changes_to_workers() {
    let ctx = three_nodes();
    let observed = converged(&ctx);
    let mut changed = three_nodes();
    changed
        .spec
        .services
        .kubeproxy
        .extra_args
        .insert("v".to_string(), "4".to_string());
    changed
        .spec
        .services
        .kube_api
        .base
        .extra_args
        .insert("v".to_string(), "4".to_string());
    changed.spec.nodes.push(node("10.0.0.4", &[Role::Etcd]));

    let plan = compute(&changed, Some(&ctx.spec), &observed, &BTreeSet::new(), true);
    assert!(plan.active(Layer::ControlPlane).is_empty());
    assert!(plan.active(Layer::Etcd).is_empty());
    let worker_hosts: BTreeSet<String> = plan
        .active(Layer::Workers)
        .into_iter()
        .filter(|s| s.component == KUBEPROXY_CONTAINER)
        .map(|s| s.host)
        .collect();
    assert_eq!(worker_hosts, BTreeSet::from(["10.0.0.2".to_string(), "10.0.0.3".to_string()]));
    // certificates still reach the new host
    assert_eq!(step(&plan, Layer::Certificates, "10.0.0.4", CERTIFICATES).action, Action::Deploy);
}

#[test]
fn test_backup_toggle_manages_rolling_snapshots() {
    let mut ctx = three_nodes();
    ctx.spec.services.etcd.backup_config.enabled = true;
    let plan = compute(&ctx, None, &BTreeMap::new(), &BTreeSet::new(), false);
    assert_eq!(step(&plan, Layer::Etcd, "10.0.0.1", ROLLING_SNAPSHOT_CONTAINER).action, Action::Deploy);

    let mut observed = converged(&ctx);
    let rolling = etcd::rolling_snapshots(&ctx, &ctx.spec.nodes[0]).unwrap();
    if let Some(host) = observed.get_mut("10.0.0.1") {
        host.containers.insert(rolling.name.clone(), running(Role::Etcd.as_str(), &rolling));
    }
    let plan = compute(&ctx, Some(&ctx.spec), &observed, &BTreeSet::new(), false);
    assert_eq!(step(&plan, Layer::Etcd, "10.0.0.1", ROLLING_SNAPSHOT_CONTAINER).action, Action::Noop);

    let mut disabled = three_nodes();
    disabled.spec.services.etcd.backup_config.enabled = false;
    let plan = compute(&disabled, Some(&ctx.spec), &observed, &BTreeSet::new(), false);
    assert_eq!(step(&plan, Layer::Etcd, "10.0.0.1", ROLLING_SNAPSHOT_CONTAINER).action, Action::Remove);
}

#[test]
fn test_external_etcd_has_no_etcd_layer() {
    let mut ctx = three_nodes();
    ctx.spec.services.etcd.external_urls = vec!["https://etcd.example.com:2379".to_string()];
    let plan = compute(&ctx, None, &BTreeMap::new(), &BTreeSet::new(), false);
    assert!(plan.steps(Layer::Etcd).is_empty());
}

#[test]
fn test_encryption_config_change_restarts_apiserver() {
    let custom = |secret: &str| cluster_types::SecretsEncryptionConfig {
        enabled: true,
        custom_config: Some(serde_json::json!({
            "apiVersion": "apiserver.config.k8s.io/v1",
            "kind": "EncryptionConfiguration",
            "resources": [{"resources": ["secrets"], "providers": [{"aescbc": {"keys": [{"name": "key1", "secret": secret}]}}]}],
        })),
    };
    let mut ctx = three_nodes();
    ctx.spec.services.kube_api.secrets_encryption_config = Some(custom("bmV3"));
    ctx.encryption_config = Some("kind: EncryptionConfiguration\n".to_string());
    let observed = converged(&ctx);
    let mut previous = ctx.spec.clone();
    previous.services.kube_api.secrets_encryption_config = Some(custom("b2xk"));

    let plan = compute(&ctx, Some(&previous), &observed, &BTreeSet::new(), false);
    assert_eq!(step(&plan, Layer::Certificates, "10.0.0.1", HOST_FILES).action, Action::Upgrade);
    assert_eq!(step(&plan, Layer::Certificates, "10.0.0.1", CERTIFICATES).action, Action::Noop);
    let apiserver = step(&plan, Layer::ControlPlane, "10.0.0.1", KUBE_APISERVER_CONTAINER);
    assert_eq!(apiserver.action, Action::Upgrade);
    assert_eq!(apiserver.params.get(RESTART_PARAM).map(String::as_str), Some(ENCRYPTION));
    assert_eq!(plan.active(Layer::ControlPlane).len(), 1);
    assert!(plan.active(Layer::Workers).is_empty());

    let unchanged = compute(&ctx, Some(&ctx.spec), &observed, &BTreeSet::new(), false);
    assert!(unchanged.is_noop());
}
