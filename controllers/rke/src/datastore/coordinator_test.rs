use super::*;
use crate::backoff::RetryPolicy;
use crate::services::args::flag_value;
use crate::services::tests::{context, node};
use datastore_client::MockEtcd;
use host_driver::{ContainerInfo, ExecOutput, MockDialer};

struct Fixture {
    dialer: MockDialer,
    etcd: MockEtcd,
    operator: ContainerOperator,
}

impl Fixture {
    fn new(addresses: &[&str]) -> Self {
        let dialer = MockDialer::new();
        for address in addresses {
            dialer.add_host(address);
        }
        let ctx = context(Vec::new());
        let operator = ContainerOperator::new(
            ctx.registries.clone(),
            RetryPolicy {
                attempts: 2,
                base: Duration::from_millis(1),
                max: Duration::from_millis(1),
            },
        );
        Self {
            dialer,
            etcd: MockEtcd::new(),
            operator,
        }
    }

    fn coordinator<'a>(&'a self, ctx: &'a ServiceContext) -> DatastoreCoordinator<'a> {
        DatastoreCoordinator::new(
            ctx,
            &self.operator,
            Arc::new(self.etcd.clone()),
            Duration::from_millis(50),
            Duration::from_millis(1),
        )
    }

    async fn hosts(&self, ctx: &ServiceContext) -> Hosts {
        let (hosts, failures) = Hosts::connect(&self.dialer, &ctx.spec.nodes, 8).await;
        assert!(failures.is_empty());
        hosts
    }

    fn etcd_cmd(&self, address: &str) -> Vec<String> {
        self.dialer
            .docker(address)
            .and_then(|d| d.container(ETCD_CONTAINER))
            .map(|c| c.cmd)
            .unwrap_or_default()
    }
}

fn etcd_ctx(addresses: &[&str]) -> ServiceContext {
    context(addresses.iter().map(|a| node(a, &[Role::Etcd])).collect())
}

#[tokio::test]
async fn test_bootstrap_new_ensemble() {
    let fixture = Fixture::new(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    let ctx = etcd_ctx(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    let hosts = fixture.hosts(&ctx).await;
    let coordinator = fixture.coordinator(&ctx);

    coordinator.reconcile(&hosts, &[]).await.unwrap();

    assert_eq!(fixture.etcd.members().len(), 3);
    let tokens: BTreeSet<String> = ["10.0.0.1", "10.0.0.2", "10.0.0.3"]
        .iter()
        .map(|a| {
            let cmd = fixture.etcd_cmd(a);
            assert_eq!(flag_value(&cmd, "initial-cluster-state"), Some("new"));
            flag_value(&cmd, "initial-cluster-token").unwrap_or_default().to_string()
        })
        .collect();
    assert_eq!(tokens.len(), 1);
    assert!(fixture.etcd.ops().is_empty());

    let creates = fixture.dialer.journal().ops("create").len();
    coordinator.reconcile(&hosts, &ctx.spec.nodes).await.unwrap();
    assert_eq!(fixture.dialer.journal().ops("create").len(), creates);
}

#[tokio::test]
async fn test_add_members_one_at_a_time() {
    let fixture = Fixture::new(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5"]);
    let initial = etcd_ctx(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    let hosts = fixture.hosts(&etcd_ctx(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5"])).await;
    fixture.coordinator(&initial).reconcile(&hosts, &[]).await.unwrap();
    let token = flag_value(&fixture.etcd_cmd("10.0.0.1"), "initial-cluster-token").map(str::to_string);

    let grown = etcd_ctx(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5"]);
    fixture.coordinator(&grown).reconcile(&hosts, &initial.spec.nodes).await.unwrap();

    assert_eq!(
        fixture.etcd.ops(),
        vec!["add https://10.0.0.4:2380", "add https://10.0.0.5:2380"]
    );
    assert_eq!(fixture.etcd.members().len(), 5);

    let fourth = fixture.etcd_cmd("10.0.0.4");
    assert_eq!(flag_value(&fourth, "initial-cluster-state"), Some("existing"));
    assert_eq!(flag_value(&fourth, "initial-cluster-token").map(str::to_string), token);
    let cluster = flag_value(&fourth, "initial-cluster").unwrap_or_default();
    assert!(cluster.contains("etcd-node-10-0-0-4=https://10.0.0.4:2380"));
    assert!(!cluster.contains("10.0.0.5"));
    assert!(flag_value(&fixture.etcd_cmd("10.0.0.5"), "initial-cluster").unwrap_or_default().contains("10.0.0.4"));

    // existing members keep their flags
    assert_eq!(flag_value(&fixture.etcd_cmd("10.0.0.1"), "initial-cluster-state"), Some("new"));
}

#[tokio::test]
async fn test_remove_member() {
    let fixture = Fixture::new(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    let initial = etcd_ctx(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    let hosts = fixture.hosts(&initial).await;
    fixture.coordinator(&initial).reconcile(&hosts, &[]).await.unwrap();
    let removed = fixture
        .etcd
        .members()
        .into_iter()
        .find(|m| m.has_peer_url("https://10.0.0.3:2380"))
        .map(|m| m.id)
        .unwrap();

    let shrunk = etcd_ctx(&["10.0.0.1", "10.0.0.2"]);
    fixture.coordinator(&shrunk).reconcile(&hosts, &initial.spec.nodes).await.unwrap();

    assert_eq!(fixture.etcd.ops(), vec![format!("remove {removed:x}")]);
    assert!(fixture.etcd_cmd("10.0.0.3").is_empty());
    assert_eq!(fixture.etcd.members().len(), 2);
}

#[tokio::test]
async fn test_removal_refused_without_quorum() {
    let fixture = Fixture::new(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    let initial = etcd_ctx(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    let hosts = fixture.hosts(&initial).await;
    fixture.coordinator(&initial).reconcile(&hosts, &[]).await.unwrap();
    fixture.etcd.set_unhealthy("10.0.0.2", true);

    let shrunk = etcd_ctx(&["10.0.0.1", "10.0.0.2"]);
    let err = fixture
        .coordinator(&shrunk)
        .reconcile(&hosts, &initial.spec.nodes)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::QuorumViolation(_)), "{err:?}");
    assert!(fixture.etcd.ops().is_empty());
    assert!(!fixture.etcd_cmd("10.0.0.3").is_empty());
}

#[tokio::test]
async fn test_lost_quorum_is_reported() {
    let fixture = Fixture::new(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    let ctx = etcd_ctx(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    let hosts = fixture.hosts(&ctx).await;
    let coordinator = fixture.coordinator(&ctx);
    coordinator.reconcile(&hosts, &[]).await.unwrap();

    fixture.etcd.set_unhealthy("10.0.0.1", true);
    fixture.etcd.set_unhealthy("10.0.0.2", true);
    let observation = coordinator.observe(&hosts, &ctx.spec.nodes).await.unwrap();
    assert_eq!(observation.state, EnsembleState::Lost { healthy: 1, total: 3 });
    let err = coordinator.reconcile(&hosts, &ctx.spec.nodes).await.unwrap_err();
    assert!(matches!(err, EngineError::QuorumViolation(_)));
    assert_eq!(err.exit_code(), 3);
}

#[tokio::test]
async fn test_member_replacement_refused_without_quorum() {
    let fixture = Fixture::new(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    let ctx = etcd_ctx(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    let hosts = fixture.hosts(&ctx).await;
    fixture.coordinator(&ctx).reconcile(&hosts, &[]).await.unwrap();

    let mut tuned = etcd_ctx(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    tuned
        .spec
        .services
        .etcd
        .base
        .extra_args
        .insert("snapshot-count".to_string(), "5000".to_string());
    fixture.etcd.set_unhealthy("10.0.0.2", true);
    fixture.etcd.set_unhealthy("10.0.0.3", true);
    fixture.dialer.journal().clear();
    let coordinator = fixture.coordinator(&tuned);
    let first = &tuned.spec.nodes[0];

    let err = coordinator.upgrade_member(&hosts, first).await.unwrap_err();
    assert!(matches!(&err, EngineError::QuorumViolation(reason) if reason.contains("10.0.0.1")), "{err:?}");
    let err = coordinator.restart_member(&hosts, first).await.unwrap_err();
    assert!(matches!(err, EngineError::QuorumViolation(_)), "{err:?}");

    assert!(fixture.dialer.journal().ops("create").is_empty());
    assert!(fixture.dialer.journal().ops("stop").is_empty());
    assert_eq!(flag_value(&fixture.etcd_cmd("10.0.0.1"), "snapshot-count"), None);
}

#[tokio::test]
async fn test_unhealthy_member_times_out() {
    let fixture = Fixture::new(&["10.0.0.1"]);
    let ctx = etcd_ctx(&["10.0.0.1"]);
    let hosts = fixture.hosts(&ctx).await;
    fixture.etcd.set_unhealthy("10.0.0.1", true);

    let err = fixture.coordinator(&ctx).reconcile(&hosts, &[]).await.unwrap_err();
    assert!(
        matches!(&err, EngineError::ComponentNotReady { host, component, .. } if host == "10.0.0.1" && component == "etcd")
    );
}

#[tokio::test]
async fn test_snapshot_save_and_list() {
    let fixture = Fixture::new(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    let ctx = etcd_ctx(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    let hosts = fixture.hosts(&ctx).await;
    let coordinator = fixture.coordinator(&ctx);
    coordinator.reconcile(&hosts, &[]).await.unwrap();

    let saved = coordinator.save_snapshot(&hosts, "nightly").await.unwrap();
    assert_eq!(saved.len(), 3);
    let journal = fixture.dialer.journal();
    for address in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
        assert!(journal.position(address, "create", "etcd-snapshot-once").is_some());
        assert!(journal.position(address, "remove", "etcd-snapshot-once").is_some());
    }

    fixture.dialer.shell("10.0.0.1").unwrap().respond(
        "find /opt/rke/etcd-snapshots",
        ExecOutput {
            exit_code: 0,
            stdout: "nightly 2048 1700000100.5\nolder 1024 1700000000.0\n".to_string(),
            stderr: String::new(),
        },
    );
    fixture.dialer.shell("10.0.0.2").unwrap().respond(
        "find /opt/rke/etcd-snapshots",
        ExecOutput {
            exit_code: 0,
            stdout: "nightly 2048 1700000100.0\n".to_string(),
            stderr: String::new(),
        },
    );
    let listed = coordinator.list_snapshots(&hosts).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].file.name, "nightly");
    assert_eq!(listed[0].hosts, vec!["10.0.0.1", "10.0.0.2"]);
    assert_eq!(listed[1].hosts, vec!["10.0.0.1"]);
}

#[tokio::test]
async fn test_remove_snapshot_rejects_paths() {
    let fixture = Fixture::new(&["10.0.0.1"]);
    let ctx = etcd_ctx(&["10.0.0.1"]);
    let hosts = fixture.hosts(&ctx).await;
    let coordinator = fixture.coordinator(&ctx);

    let err = coordinator.remove_snapshot(&hosts, "../etc/passwd").await.unwrap_err();
    assert!(matches!(err, EngineError::ConfigInvalid(_)));

    coordinator.remove_snapshot(&hosts, "nightly.zip").await.unwrap();
    let commands = fixture.dialer.shell("10.0.0.1").unwrap().commands();
    assert_eq!(
        commands,
        vec!["rm -f '/opt/rke/etcd-snapshots/nightly' '/opt/rke/etcd-snapshots/nightly.zip'"]
    );
}

#[tokio::test]
async fn test_restore_rebuilds_ensemble() {
    let fixture = Fixture::new(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    let ctx = context(vec![
        node("10.0.0.1", &[Role::Etcd, Role::ControlPlane]),
        node("10.0.0.2", &[Role::Etcd]),
        node("10.0.0.3", &[Role::Etcd]),
    ]);
    let hosts = fixture.hosts(&ctx).await;
    let coordinator = fixture.coordinator(&ctx);
    coordinator.reconcile(&hosts, &[]).await.unwrap();
    let old_token = flag_value(&fixture.etcd_cmd("10.0.0.1"), "initial-cluster-token").map(str::to_string);
    fixture.dialer.docker("10.0.0.1").unwrap().add_container(ContainerInfo {
        name: "kube-apiserver".to_string(),
        running: true,
        ..Default::default()
    });

    coordinator.restore(&hosts, "nightly.zip").await.unwrap();

    let journal = fixture.dialer.journal();
    let stop_api = journal.position("10.0.0.1", "stop", "kube-apiserver").unwrap();
    let remove_etcd = journal.position("10.0.0.1", "remove", "etcd").unwrap();
    let restore = journal.position("10.0.0.1", "create", "etcd-restore").unwrap();
    assert!(stop_api < remove_etcd && remove_etcd < restore);
    for address in ["10.0.0.2", "10.0.0.3"] {
        assert!(journal.position(address, "create", "etcd-restore").is_some());
    }

    let cmd = fixture.etcd_cmd("10.0.0.1");
    assert_eq!(flag_value(&cmd, "initial-cluster-state"), Some("new"));
    assert_ne!(flag_value(&cmd, "initial-cluster-token").map(str::to_string), old_token);
    assert!(fixture.dialer.docker("10.0.0.1").unwrap().container("kube-apiserver").is_none());
}

#[tokio::test]
async fn test_restore_requires_snapshot_on_every_host() {
    let fixture = Fixture::new(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    let ctx = etcd_ctx(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    let hosts = fixture.hosts(&ctx).await;
    let coordinator = fixture.coordinator(&ctx);
    coordinator.reconcile(&hosts, &[]).await.unwrap();
    fixture.dialer.shell("10.0.0.3").unwrap().respond(
        "test -f",
        ExecOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: String::new(),
        },
    );

    let err = coordinator.restore(&hosts, "missing").await.unwrap_err();
    assert!(matches!(&err, EngineError::Datastore { reason, .. } if reason.contains("10.0.0.3")));
    assert!(fixture.dialer.journal().ops("create").iter().all(|e| e.target != "etcd-restore"));
}
