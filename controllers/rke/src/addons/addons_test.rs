use super::*;
use crate::services::tests::{context, node};
use k8s_client::MockKubeApi;
use std::io::Write;
use tokio_util::sync::CancellationToken;

fn cluster() -> ServiceContext {
    context(vec![
        node("10.0.0.1", &[Role::ControlPlane, Role::Etcd]),
        node("10.0.0.2", &[Role::Worker]),
    ])
}

fn scheduler() -> Scheduler {
    Scheduler::new(4, CancellationToken::new())
}

fn names(addons: &[Addon]) -> Vec<&str> {
    addons.iter().map(|a| a.name.as_str()).collect()
}

#[test]
fn test_default_addons_network_first() {
    let ctx = cluster();
    let reconciler = AddonReconciler::new(&ctx, None).unwrap();
    assert_eq!(
        names(reconciler.desired()),
        vec![NETWORK_PLUGIN_ADDON, COREDNS_ADDON, METRICS_ADDON, INGRESS_ADDON]
    );
    assert!(reconciler.removed().is_empty());
    let network = &reconciler.desired()[0];
    assert!(network.manifest.contains("10.42.0.0/16"));
    assert_eq!(network.hash().len(), 64);
}

#[test]
fn test_disabled_providers_and_user_addon() {
    let mut ctx = cluster();
    ctx.spec.network.plugin = "none".to_string();
    ctx.spec.ingress.provider = "none".to_string();
    ctx.spec.dns.provider = "kube-dns".to_string();
    ctx.spec.addons = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: team-a\n".to_string();

    let reconciler = AddonReconciler::new(&ctx, None).unwrap();
    assert_eq!(
        names(reconciler.desired()),
        vec![KUBEDNS_ADDON, METRICS_ADDON, USER_ADDON]
    );
}

#[test]
fn test_includes_are_concatenated() {
    let mut first = tempfile::NamedTempFile::new().unwrap();
    writeln!(first, "---\nkind: Namespace\nmetadata:\n  name: a").unwrap();
    let mut second = tempfile::NamedTempFile::new().unwrap();
    writeln!(second, "kind: Namespace\nmetadata:\n  name: b").unwrap();

    let paths = vec![
        first.path().display().to_string(),
        second.path().display().to_string(),
    ];
    let addon = read_includes(&paths).unwrap().unwrap();
    assert_eq!(addon.name, USER_INCLUDES_ADDON);
    assert_eq!(
        addon.manifest,
        "kind: Namespace\nmetadata:\n  name: a\n---\nkind: Namespace\nmetadata:\n  name: b"
    );
}

#[test]
fn test_includes_reject_missing_and_remote() {
    assert!(read_includes(&[]).unwrap().is_none());
    assert!(matches!(
        read_includes(&["/nonexistent/addon.yaml".to_string()]),
        Err(EngineError::ConfigInvalid(_))
    ));
    assert!(matches!(
        read_includes(&["https://example.com/addon.yaml".to_string()]),
        Err(EngineError::ConfigInvalid(_))
    ));
}

#[tokio::test]
async fn test_plan_without_api_deploys_everything() {
    let ctx = cluster();
    let reconciler = AddonReconciler::new(&ctx, None).unwrap();
    let steps = reconciler.plan(None).await;
    assert_eq!(steps.len(), 4);
    assert!(steps.iter().all(|s| s.action == Action::Deploy && s.host == "10.0.0.1"));
    assert!(steps.iter().all(|s| s.role == ADDONS_ROLE));
}

#[tokio::test]
async fn test_plan_skips_completed_jobs_with_same_hash() {
    let ctx = cluster();
    let reconciler = AddonReconciler::new(&ctx, None).unwrap();
    let api = MockKubeApi::new();
    let network = &reconciler.desired()[0];
    api.add_job("rke-network-plugin-deploy-job", &network.hash(), JobState::Complete);
    api.add_job("rke-coredns-deploy-job", "stale", JobState::Complete);

    let steps = reconciler.plan(Some(&api as &dyn KubeApi)).await;
    let action = |name: &str| steps.iter().find(|s| s.component == name).map(|s| s.action);
    assert_eq!(action(NETWORK_PLUGIN_ADDON), Some(Action::Noop));
    assert_eq!(action(COREDNS_ADDON), Some(Action::Upgrade));
    assert_eq!(action(METRICS_ADDON), Some(Action::Deploy));
}

#[tokio::test]
async fn test_apply_runs_jobs_in_order() {
    let ctx = cluster();
    let reconciler = AddonReconciler::new(&ctx, None).unwrap();
    let api = MockKubeApi::new();
    let steps = reconciler.plan(Some(&api as &dyn KubeApi)).await;

    let failures = reconciler.apply(&api, &steps, &scheduler()).await.unwrap();
    assert!(failures.is_empty());
    assert!(api.job_deployer_ready());
    let ops = api.ops();
    assert_eq!(ops[0], "deployer rke-job-deployer");
    assert_eq!(ops[1], "configmap rke-network-plugin");
    assert_eq!(ops[2], "create-job rke-network-plugin-deploy-job");
    assert_eq!(
        api.ops_of("create-job"),
        vec![
            "rke-network-plugin-deploy-job",
            "rke-coredns-deploy-job",
            "rke-metrics-addon-deploy-job",
            "rke-ingress-controller-deploy-job",
        ]
    );
    assert_eq!(
        api.config_map(NETWORK_PLUGIN_ADDON).as_deref(),
        Some(reconciler.desired()[0].manifest.as_str())
    );

    // Second run is a no-op
    let steps = reconciler.plan(Some(&api as &dyn KubeApi)).await;
    assert!(steps.iter().all(PlanStep::is_noop));
}

#[tokio::test]
async fn test_failed_addon_does_not_stop_the_others() {
    let ctx = cluster();
    let reconciler = AddonReconciler::new(&ctx, None).unwrap();
    let api = MockKubeApi::new();
    api.set_job_outcome("rke-coredns-deploy-job", JobState::Failed("BackoffLimitExceeded".to_string()));
    let steps = reconciler.plan(Some(&api as &dyn KubeApi)).await;

    let failures = reconciler.apply(&api, &steps, &scheduler()).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert!(matches!(&failures[0], EngineError::AddonApplyFailed { addon, .. } if addon == COREDNS_ADDON));
    assert!(failures[0].is_non_fatal());
    assert!(api.job("rke-ingress-controller-deploy-job").is_some());
}

#[tokio::test]
async fn test_stuck_job_reports_timeout() {
    let mut ctx = cluster();
    ctx.spec.network.plugin = "none".to_string();
    ctx.spec.ingress.provider = "none".to_string();
    ctx.spec.monitoring.provider = "none".to_string();
    let reconciler = AddonReconciler::new(&ctx, None).unwrap();
    let api = MockKubeApi::new();
    api.set_job_outcome("rke-coredns-deploy-job", JobState::Active);
    let steps = reconciler.plan(Some(&api as &dyn KubeApi)).await;

    let failures = reconciler.apply(&api, &steps, &scheduler()).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].to_string().contains("did not complete"));
}

#[tokio::test]
async fn test_changed_manifest_replaces_job() {
    let ctx = cluster();
    let reconciler = AddonReconciler::new(&ctx, None).unwrap();
    let api = MockKubeApi::new();
    api.add_job("rke-network-plugin-deploy-job", "old-hash", JobState::Complete);
    let steps: Vec<PlanStep> = reconciler
        .plan(Some(&api as &dyn KubeApi))
        .await
        .into_iter()
        .filter(|s| s.component == NETWORK_PLUGIN_ADDON)
        .collect();

    reconciler.apply(&api, &steps, &scheduler()).await.unwrap();
    let ops = api.ops();
    let delete = ops.iter().position(|o| o == "delete-job rke-network-plugin-deploy-job").unwrap();
    let create = ops.iter().position(|o| o == "create-job rke-network-plugin-deploy-job").unwrap();
    assert!(delete < create);
    let hash = reconciler.desired()[0].hash();
    assert_eq!(
        api.job("rke-network-plugin-deploy-job").unwrap().manifest_hash(),
        Some(hash.as_str())
    );
}

#[tokio::test]
async fn test_switching_provider_off_runs_delete_job() {
    let previous = cluster();
    let mut ctx = cluster();
    ctx.spec.ingress.provider = "none".to_string();

    let reconciler = AddonReconciler::new(&ctx, Some(&previous.spec)).unwrap();
    assert_eq!(names(reconciler.removed()), vec![INGRESS_ADDON]);

    let api = MockKubeApi::new();
    let steps = reconciler.plan(Some(&api as &dyn KubeApi)).await;
    let removal = steps.iter().find(|s| s.component == INGRESS_ADDON).unwrap();
    assert_eq!(removal.action, Action::Remove);

    reconciler.apply(&api, &steps, &scheduler()).await.unwrap();
    assert_eq!(api.ops_of("create-job").last().map(String::as_str), Some("rke-ingress-controller-delete-job"));
    assert!(api.config_map(INGRESS_ADDON).unwrap().contains("ingress"));
}

#[tokio::test]
async fn test_nothing_to_apply_skips_the_deployer() {
    let ctx = cluster();
    let reconciler = AddonReconciler::new(&ctx, None).unwrap();
    let api = MockKubeApi::new();
    let steps: Vec<PlanStep> = reconciler
        .plan(None)
        .await
        .into_iter()
        .map(|mut s| {
            s.action = Action::Noop;
            s
        })
        .collect();
    assert!(reconciler.apply(&api, &steps, &scheduler()).await.unwrap().is_empty());
    assert!(!api.job_deployer_ready());
}
