//! etcd member container

use super::args::{flag_map, flag_value, merge_args};
use super::{ETCD_CONTAINER, KUBERNETES_BIND, ROLLING_SNAPSHOT_CONTAINER, ServiceContext};
use crate::error::EngineError;
use crate::metadata::image;
use cluster_types::{ClusterSpec, NodeConfig, Role, S3BackupConfig};
use datastore_client::snapshot::SNAPSHOT_DIR;
use datastore_client::{client_url, peer_url};
use host_driver::{ContainerInfo, ContainerSpec, RestartPolicy};
use pki::names::{self, CA_CERT_NAME};
use std::fmt;
use uuid::Uuid;

/// Data directory inside the container
pub const DATA_DIR: &str = "/var/lib/rancher/etcd/";
/// Host directory bound to `DATA_DIR`
pub const HOST_DATA_DIR: &str = "/var/lib/etcd";

/// `--initial-cluster-state`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialState {
    New,
    Existing,
}

impl InitialState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Existing => "existing",
        }
    }
}

impl fmt::Display for InitialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flags a member is started with to find its peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdBootstrap {
    pub token: String,
    pub state: InitialState,
    /// `name=peer-url,...`
    pub initial_cluster: String,
}

impl EtcdBootstrap {
    /// Every member of `members` starting together
    #[must_use]
    pub fn new_cluster(token: &str, members: &[NodeConfig]) -> Self {
        Self {
            token: token.to_string(),
            state: InitialState::New,
            initial_cluster: initial_cluster(members),
        }
    }

    /// A member joining an existing ensemble
    #[must_use]
    pub fn joining(token: &str, peers: &[(String, String)]) -> Self {
        Self {
            token: token.to_string(),
            state: InitialState::Existing,
            initial_cluster: peers
                .iter()
                .map(|(name, url)| format!("{name}={url}"))
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    /// Recover the flags of a running member
    ///
    /// The member keeps its original flags so its hash stays stable.
    #[must_use]
    pub fn from_container(info: &ContainerInfo) -> Option<Self> {
        let token = flag_value(&info.cmd, "initial-cluster-token")?;
        let initial_cluster = flag_value(&info.cmd, "initial-cluster")?;
        let state = match flag_value(&info.cmd, "initial-cluster-state")? {
            "existing" => InitialState::Existing,
            _ => InitialState::New,
        };
        Some(Self {
            token: token.to_string(),
            state,
            initial_cluster: initial_cluster.to_string(),
        })
    }
}

/// Fresh `etcd-cluster-<uuid>` token
#[must_use]
pub fn new_token() -> String {
    format!("etcd-cluster-{}", Uuid::new_v4().simple())
}

/// `etcd-<hostname>`
#[must_use]
pub fn member_name(node: &NodeConfig) -> String {
    format!("etcd-{}", node.hostname())
}

/// `--initial-cluster` for `members`
#[must_use]
pub fn initial_cluster(members: &[NodeConfig]) -> String {
    members
        .iter()
        .map(|n| format!("{}={}", member_name(n), peer_url(n.internal_ip())))
        .collect::<Vec<_>>()
        .join(",")
}

/// Client endpoints the control plane talks to
#[must_use]
pub fn endpoints(spec: &ClusterSpec) -> Vec<String> {
    if spec.uses_external_etcd() {
        return spec.services.etcd.external_urls.clone();
    }
    spec.hosts_with_role(Role::Etcd)
        .map(|n| client_url(n.internal_ip()))
        .collect()
}

/// The `etcd` container of `node`
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` when the release lacks the etcd image.
pub fn etcd_container(ctx: &ServiceContext, node: &NodeConfig, bootstrap: &EtcdBootstrap) -> Result<ContainerSpec, EngineError> {
    let service = &ctx.spec.services.etcd;
    let ip = node.internal_ip();
    let cert = names::etcd_cert_name(ip);
    let ca = names::cert_path(CA_CERT_NAME);
    let computed = flag_map([
        ("name", member_name(node)),
        ("data-dir", DATA_DIR.to_string()),
        ("listen-client-urls", "https://0.0.0.0:2379".to_string()),
        ("advertise-client-urls", client_url(ip)),
        ("listen-peer-urls", "https://0.0.0.0:2380".to_string()),
        ("initial-advertise-peer-urls", peer_url(ip)),
        ("initial-cluster", bootstrap.initial_cluster.clone()),
        ("initial-cluster-token", bootstrap.token.clone()),
        ("initial-cluster-state", bootstrap.state.as_str().to_string()),
        ("trusted-ca-file", ca.clone()),
        ("peer-trusted-ca-file", ca.clone()),
        ("cert-file", names::cert_path(&cert)),
        ("key-file", names::key_path(&cert)),
        ("peer-cert-file", names::cert_path(&cert)),
        ("peer-key-file", names::key_path(&cert)),
    ]);
    let mut cmd = vec!["/usr/local/bin/etcd".to_string()];
    cmd.extend(merge_args(ctx.defaults(ETCD_CONTAINER), computed, &service.base.extra_args));

    let mut env = vec![
        "ETCDCTL_API=3".to_string(),
        format!("ETCDCTL_CACERT={ca}"),
        format!("ETCDCTL_CERT={}", names::cert_path(&cert)),
        format!("ETCDCTL_KEY={}", names::key_path(&cert)),
        "ETCDCTL_ENDPOINTS=https://127.0.0.1:2379".to_string(),
    ];
    env.extend(service.base.extra_env.iter().cloned());

    let mut binds = vec![
        format!("{HOST_DATA_DIR}:{DATA_DIR}:z"),
        KUBERNETES_BIND.to_string(),
        format!("{SNAPSHOT_DIR}:{SNAPSHOT_DIR}:z"),
    ];
    binds.extend(service.base.extra_binds.iter().cloned());

    Ok(ContainerSpec {
        name: ETCD_CONTAINER.to_string(),
        image: ctx.service_image(&service.base, image::ETCD)?,
        cmd,
        env,
        binds,
        network_mode: "host".to_string(),
        restart_policy: RestartPolicy::Always,
        ..Default::default()
    })
}

/// S3 flags and secret env shared by every snapshot sidecar
#[must_use]
pub fn s3_flags(s3: Option<&S3BackupConfig>) -> (Vec<String>, Vec<String>) {
    let Some(s3) = s3 else {
        return (Vec::new(), Vec::new());
    };
    let mut args = vec![
        "--s3-backup".to_string(),
        format!("--s3-endpoint={}", s3.endpoint),
        format!("--s3-bucketName={}", s3.bucket_name),
        format!("--s3-region={}", s3.region),
    ];
    if !s3.folder.is_empty() {
        args.push(format!("--s3-folder={}", s3.folder));
    }
    let env = vec![format!("S3_ACCESS_KEY={}", s3.access_key), format!("S3_SECRET_KEY={}", s3.secret_key)];
    (args, env)
}

fn snapshot_tool(ctx: &ServiceContext, node: &NodeConfig, name: &str, args: Vec<String>, s3: Option<&S3BackupConfig>) -> Result<ContainerSpec, EngineError> {
    let cert = names::etcd_cert_name(node.internal_ip());
    let (s3_args, s3_env) = s3_flags(s3);
    let mut cmd = vec!["/opt/rke-tools/rke-etcd-backup".to_string(), "etcd-backup".to_string()];
    cmd.extend(args);
    cmd.extend([
        format!("--endpoints={}", client_url(node.internal_ip())),
        format!("--cacert={}", names::cert_path(CA_CERT_NAME)),
        format!("--cert={}", names::cert_path(&cert)),
        format!("--key={}", names::key_path(&cert)),
        format!("--local-endpoint={}", client_url(node.internal_ip())),
    ]);
    cmd.extend(s3_args);
    Ok(ContainerSpec {
        name: name.to_string(),
        image: ctx.image(image::ALPINE)?,
        cmd,
        env: s3_env,
        binds: vec![KUBERNETES_BIND.to_string(), format!("{SNAPSHOT_DIR}:/backup:z")],
        network_mode: "host".to_string(),
        ..Default::default()
    })
}

/// Long-running `etcd-rolling-snapshots` sidecar
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` when the release lacks the tools image.
pub fn rolling_snapshots(ctx: &ServiceContext, node: &NodeConfig) -> Result<ContainerSpec, EngineError> {
    let backup = &ctx.spec.services.etcd.backup_config;
    let mut spec = snapshot_tool(
        ctx,
        node,
        ROLLING_SNAPSHOT_CONTAINER,
        vec![
            "save".to_string(),
            format!("--creation={}h", backup.interval_hours),
            format!("--retention={}", backup.retention),
        ],
        backup.s3_backup_config.as_ref(),
    )?;
    spec.restart_policy = RestartPolicy::Always;
    Ok(spec)
}

/// One-shot container saving snapshot `name`
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` when the release lacks the tools image.
pub fn snapshot_once(ctx: &ServiceContext, node: &NodeConfig, name: &str, s3: Option<&S3BackupConfig>) -> Result<ContainerSpec, EngineError> {
    snapshot_tool(ctx, node, "etcd-snapshot-once", vec!["save".to_string(), "--once".to_string(), format!("--name={name}")], s3)
}

/// One-shot container fetching snapshot `name` from S3
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` when the release lacks the tools image.
pub fn download_snapshot(ctx: &ServiceContext, node: &NodeConfig, name: &str, s3: &S3BackupConfig) -> Result<ContainerSpec, EngineError> {
    snapshot_tool(ctx, node, "etcd-download-backup", vec!["download".to_string(), format!("--name={name}")], Some(s3))
}

/// One-shot container deleting snapshot `name` from S3
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` when the release lacks the tools image.
pub fn remove_s3_snapshot(ctx: &ServiceContext, node: &NodeConfig, name: &str, s3: &S3BackupConfig) -> Result<ContainerSpec, EngineError> {
    snapshot_tool(ctx, node, "etcd-remove-snapshot", vec!["delete".to_string(), format!("--name={name}")], Some(s3))
}

/// One-shot container restoring `snapshot` into a fresh data directory
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` when the release lacks the etcd image.
pub fn restore_container(
    ctx: &ServiceContext,
    node: &NodeConfig,
    snapshot: &str,
    bootstrap: &EtcdBootstrap,
) -> Result<ContainerSpec, EngineError> {
    let ip = node.internal_ip();
    let cert = names::etcd_cert_name(ip);
    let script = format!(
        "rm -rf {DATA_DIR}member && etcdctl snapshot restore {path} --data-dir={DATA_DIR} --name={name} \
--initial-cluster={cluster} --initial-cluster-token={token} --initial-advertise-peer-urls={peer}",
        path = datastore_client::snapshot::snapshot_path(snapshot),
        name = member_name(node),
        cluster = bootstrap.initial_cluster,
        token = bootstrap.token,
        peer = peer_url(ip),
    );
    Ok(ContainerSpec {
        name: "etcd-restore".to_string(),
        image: ctx.service_image(&ctx.spec.services.etcd.base, image::ETCD)?,
        entrypoint: vec!["/bin/sh".to_string(), "-c".to_string()],
        cmd: vec![script],
        env: vec![
            "ETCDCTL_API=3".to_string(),
            format!("ETCDCTL_CACERT={}", names::cert_path(CA_CERT_NAME)),
            format!("ETCDCTL_CERT={}", names::cert_path(&cert)),
            format!("ETCDCTL_KEY={}", names::key_path(&cert)),
        ],
        binds: vec![
            format!("{HOST_DATA_DIR}:{DATA_DIR}:z"),
            KUBERNETES_BIND.to_string(),
            format!("{SNAPSHOT_DIR}:{SNAPSHOT_DIR}:z"),
        ],
        network_mode: "host".to_string(),
        ..Default::default()
    })
}
