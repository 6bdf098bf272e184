//! Reconciliation Engine
//!
//! A run loads the cluster file and the last converged state, connects to
//! every host, observes it and computes an immutable plan. The plan's layers
//! are then released one at a time: certificates, etcd, control plane,
//! workers, removals and addons. The state is written last, and only when no
//! fatal layer failed.

pub mod observe;
pub mod plan;
pub mod preflight;
pub mod scheduler;
pub mod state;
pub mod summary;

use self::observe::observe;
use self::plan::{Action, Layer, Plan, PlanInput};
use self::scheduler::Scheduler;
use self::state::StateFiles;
use self::summary::RunSummary;
use crate::addons::AddonReconciler;
use crate::config::RuntimeConfig;
use crate::datastore::DatastoreCoordinator;
use crate::datastore::snapshot::SnapshotListing;
use crate::deployers::Deployers;
use crate::encryption;
use crate::error::EngineError;
use crate::hosts::Hosts;
use crate::metadata::Catalog;
use crate::operator::ContainerOperator;
use crate::operator::ecr::{AwsEcrTokens, EcrTokenProvider};
use crate::operator::registry::Registries;
use crate::services::{ServiceContext, etcd};
use chrono::Utc;
use cluster_types::{
    ClusterSpec, ClusterState, FullState, NodeConfig, Role, RotateCertificates, S3BackupConfig,
};
use datastore_client::{EtcdClientFactory, EtcdConnector, EtcdTls};
use host_driver::HostDialer;
use k8s_client::{KubeApi, KubeClientFactory, KubeConnector, KubeTls};
use pki::CertBundle;
use pki::names::{CA_CERT_NAME, KUBE_ADMIN_CERT_NAME, KUBE_NODE_CERT_NAME, cert_path, key_path};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Builds the etcd and Kubernetes connectors of a run from its credentials
pub trait ClusterConnectors: Send + Sync {
    /// Connector for the etcd ensemble
    ///
    /// # Errors
    ///
    /// Fails when the TLS material is rejected.
    fn etcd(&self, tls: Option<EtcdTls>) -> Result<Arc<dyn EtcdConnector>, EngineError>;

    /// Connector for the API servers
    ///
    /// # Errors
    ///
    /// Fails when the TLS material is rejected.
    fn kube(&self, tls: Option<KubeTls>) -> Result<Arc<dyn KubeConnector>, EngineError>;
}

/// Connectors talking to real clusters
#[derive(Debug, Clone)]
pub struct LiveConnectors {
    probe_timeout: Duration,
}

impl LiveConnectors {
    #[must_use]
    pub fn new(probe_timeout: Duration) -> Self {
        Self { probe_timeout }
    }
}

impl ClusterConnectors for LiveConnectors {
    fn etcd(&self, tls: Option<EtcdTls>) -> Result<Arc<dyn EtcdConnector>, EngineError> {
        let factory = EtcdClientFactory::new(tls, self.probe_timeout).map_err(|e| EngineError::datastore("etcd", e))?;
        Ok(Arc::new(factory))
    }

    fn kube(&self, tls: Option<KubeTls>) -> Result<Arc<dyn KubeConnector>, EngineError> {
        Ok(Arc::new(KubeClientFactory::new(tls.as_ref(), self.probe_timeout)?))
    }
}

/// Options of a converging run
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Only touch worker-only hosts
    pub update_only: bool,
    pub skip_port_check: bool,
}

/// Parse, default and validate the cluster file at `path`
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` when the file cannot be read, does
/// not parse, or fails validation.
pub fn load_cluster_file(path: &Path) -> Result<ClusterSpec, EngineError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| EngineError::ConfigInvalid(format!("cannot read {}: {e}", path.display())))?;
    let mut spec = ClusterSpec::from_yaml(&raw)?;
    cluster_types::defaults::apply(&mut spec);
    cluster_types::validate(&spec)?;
    Ok(spec)
}

/// etcd client credentials: the external certificates, or the CA and the
/// node certificate of `bundle`
#[must_use]
pub fn etcd_tls(spec: &ClusterSpec, bundle: &CertBundle) -> Option<EtcdTls> {
    if spec.uses_external_etcd() {
        let external = &spec.services.etcd;
        if external.ca_cert.is_empty() {
            return None;
        }
        return Some(EtcdTls {
            ca_pem: external.ca_cert.clone(),
            cert_pem: external.cert.clone(),
            key_pem: external.key.clone(),
        });
    }
    let ca = bundle.get(CA_CERT_NAME)?;
    let client = bundle.get(KUBE_NODE_CERT_NAME)?;
    Some(EtcdTls {
        ca_pem: ca.certificate_pem.clone(),
        cert_pem: client.certificate_pem.clone(),
        key_pem: client.key_pem.clone(),
    })
}

/// Admin credentials of `bundle` for direct API server probes
#[must_use]
pub fn kube_tls(bundle: &CertBundle) -> Option<KubeTls> {
    let ca = bundle.get(CA_CERT_NAME)?;
    let admin = bundle.get(KUBE_ADMIN_CERT_NAME)?;
    Some(KubeTls {
        ca_pem: ca.certificate_pem.clone(),
        cert_pem: admin.certificate_pem.clone(),
        key_pem: admin.key_pem.clone(),
    })
}

/// Hosts of `previous` that `spec` no longer lists
fn departed(spec: &ClusterSpec, previous: &ClusterState) -> Vec<NodeConfig> {
    previous
        .rke_config
        .as_ref()
        .map(|p| p.nodes.iter().filter(|n| spec.node(&n.address).is_none()).cloned().collect())
        .unwrap_or_default()
}

fn holds_core_role(node: &NodeConfig) -> bool {
    node.has_role(Role::Etcd) || node.has_role(Role::ControlPlane)
}

/// The cluster file as stored in the state, without one-shot requests
fn stored_spec(spec: &ClusterSpec) -> ClusterSpec {
    let mut stored = spec.clone();
    stored.rotate_certificates = None;
    stored
}

/// Hosts and collaborators of a datastore command
struct DatastoreSession {
    ctx: ServiceContext,
    operator: ContainerOperator,
    etcd: Arc<dyn EtcdConnector>,
    hosts: Hosts,
    ready_timeout: Duration,
    poll_interval: Duration,
}

impl DatastoreSession {
    fn coordinator(&self) -> DatastoreCoordinator<'_> {
        DatastoreCoordinator::new(
            &self.ctx,
            &self.operator,
            self.etcd.clone(),
            self.ready_timeout,
            self.poll_interval,
        )
    }

    async fn close(self) {
        self.hosts.close().await;
    }
}

/// Drives runs against one cluster file at a time
pub struct Engine {
    dialer: Arc<dyn HostDialer>,
    connectors: Arc<dyn ClusterConnectors>,
    runtime: RuntimeConfig,
    catalog: &'static Catalog,
    ecr: Arc<dyn EcrTokenProvider>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("runtime", &self.runtime)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Engine {
    #[must_use]
    pub fn new(
        dialer: Arc<dyn HostDialer>,
        connectors: Arc<dyn ClusterConnectors>,
        runtime: RuntimeConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            dialer,
            connectors,
            runtime,
            catalog: Catalog::builtin(),
            ecr: Arc::new(AwsEcrTokens),
            cancel,
        }
    }

    fn context(&self, spec: ClusterSpec) -> Result<ServiceContext, EngineError> {
        let release = self.catalog.resolve(&spec.kubernetes_version, &spec.system_images)?;
        let registries = Registries::new(spec.private_registries.clone(), self.ecr.clone());
        Ok(ServiceContext::new(spec, release, registries))
    }

    fn scheduler(&self, hosts: usize) -> Scheduler {
        Scheduler::new(self.runtime.fan_out(hosts), self.cancel.clone())
    }

    fn operator(&self, ctx: &ServiceContext) -> ContainerOperator {
        ContainerOperator::new(ctx.registries.clone(), self.runtime.pull_retry)
    }

    fn deployers<'a>(
        &self,
        ctx: &'a ServiceContext,
        operator: &'a ContainerOperator,
        hosts: &'a Hosts,
        scheduler: &'a Scheduler,
        kube: Arc<dyn KubeConnector>,
    ) -> Deployers<'a> {
        Deployers {
            ctx,
            operator,
            hosts,
            scheduler,
            kube,
            ready_timeout: self.runtime.ready_timeout,
            poll_interval: self.runtime.poll_interval,
        }
    }

    /// Dial `nodes`; failing to reach an etcd or control plane host of
    /// `spec` is fatal, other failures are logged
    async fn connect(&self, spec: &ClusterSpec, nodes: &[NodeConfig]) -> Result<Hosts, EngineError> {
        let (hosts, failures) = Hosts::connect(self.dialer.as_ref(), nodes, self.runtime.fan_out(nodes.len())).await;
        let mut fatal = None;
        for failure in failures {
            let core = failure
                .host_address()
                .and_then(|address| spec.node(address))
                .is_some_and(holds_core_role);
            if core && fatal.is_none() {
                fatal = Some(failure);
            } else {
                warn!("[dialer] {}", failure);
            }
        }
        match fatal {
            Some(e) => {
                hosts.close().await;
                Err(e)
            }
            None => Ok(hosts),
        }
    }

    /// Read the converged state from etcd using certificates found on an
    /// etcd host
    async fn recover_state(&self, hosts: &Hosts, spec: &ClusterSpec) -> Result<Option<ClusterState>, EngineError> {
        let tls = if spec.uses_external_etcd() {
            etcd_tls(spec, &CertBundle::default())
        } else {
            let Some(node) = spec.hosts_with_role(Role::Etcd).find(|n| hosts.contains(&n.address)) else {
                return Ok(None);
            };
            let conn = hosts.get(&node.address, "state")?;
            let mut pems = Vec::with_capacity(3);
            for path in [
                cert_path(CA_CERT_NAME),
                cert_path(KUBE_NODE_CERT_NAME),
                key_path(KUBE_NODE_CERT_NAME),
            ] {
                let output = conn
                    .run(&format!("cat {path}"))
                    .await
                    .map_err(|e| EngineError::host(&node.address, "state", e))?;
                if !output.success() || output.stdout.trim().is_empty() {
                    return Ok(None);
                }
                pems.push(output.stdout);
            }
            let mut pems = pems.into_iter();
            match (pems.next(), pems.next(), pems.next()) {
                (Some(ca_pem), Some(cert_pem), Some(key_pem)) => Some(EtcdTls {
                    ca_pem,
                    cert_pem,
                    key_pem,
                }),
                _ => None,
            }
        };
        let Some(tls) = tls else {
            return Ok(None);
        };
        let api = self
            .connectors
            .etcd(Some(tls))?
            .connect(&etcd::endpoints(spec))
            .await
            .map_err(|e| EngineError::datastore("state", e))?;
        state::load_remote(api.as_ref()).await
    }

    /// State file contents, or the copy kept in etcd
    async fn previous_state(&self, files: &StateFiles, hosts: &Hosts, spec: &ClusterSpec) -> FullState {
        match self.recover_state(hosts, spec).await {
            Ok(Some(current)) => {
                info!(
                    "[state] No state file at {}, recovered revision {} from etcd",
                    files.state.display(),
                    current.revision
                );
                FullState {
                    desired_state: current.clone(),
                    current_state: current,
                }
            }
            Ok(None) => FullState::default(),
            Err(e) => {
                debug!("[state] No cluster state in etcd: {}", e);
                FullState::default()
            }
        }
    }

    /// Open API client through the admin kubeconfig, when the cluster answers
    async fn cluster_api(&self, kube: &Arc<dyn KubeConnector>, bundle: &CertBundle) -> Option<Arc<dyn KubeApi>> {
        let kubeconfig = bundle.admin_kubeconfig()?;
        match kube.connect(kubeconfig).await {
            Ok(api) => Some(api),
            Err(e) => {
                warn!("[state] Cannot reach the Kubernetes API: {}", e);
                None
            }
        }
    }

    /// Certificates of this run, built from `base`
    fn certificates(&self, spec: &ClusterSpec, base: &CertBundle) -> Result<CertBundle, EngineError> {
        let options = &self.runtime.pki;
        let bundle = if base.is_empty() {
            info!("[certificates] Generating cluster certificates");
            pki::generate(spec, options)?
        } else if let Some(rotation) = &spec.rotate_certificates {
            info!(
                "[certificates] Rotating certificates of {}{}",
                if rotation.services.is_empty() {
                    "all services".to_string()
                } else {
                    rotation.services.join(", ")
                },
                if rotation.ca_certificates { " and the CA" } else { "" }
            );
            pki::rotate(spec, base, &rotation.services, rotation.ca_certificates, options)?.bundle
        } else {
            let change = pki::reconcile(spec, base, options)?;
            if change.is_changed() {
                info!(
                    "[certificates] Regenerated {} and dropped {} certificate(s)",
                    change.regenerated.len(),
                    change.removed.len()
                );
            }
            change.bundle
        };
        if let Some(problem) = bundle.verify().into_iter().next() {
            return Err(EngineError::CertGenerationFailed(problem.to_string()));
        }
        Ok(bundle)
    }

    /// Converge the cluster described by `config`
    ///
    /// # Errors
    ///
    /// Returns the first fatal failure. Worker and addon failures are
    /// recorded in the summary instead.
    pub async fn up(&self, config: &Path, options: RunOptions) -> Result<RunSummary, EngineError> {
        let spec = load_cluster_file(config)?;
        info!("Building Kubernetes cluster {}", spec.cluster_name);
        self.converge("up", config, spec, options).await
    }

    /// Re-issue certificates of `services` (all when empty) and restart
    /// their consumers; with `rotate_ca` the CA and every leaf are replaced
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ConfigInvalid` for an unknown service name, or
    /// the first fatal failure of the run.
    pub async fn rotate_certificates(
        &self,
        config: &Path,
        services: Vec<String>,
        rotate_ca: bool,
    ) -> Result<RunSummary, EngineError> {
        let mut spec = load_cluster_file(config)?;
        spec.rotate_certificates = Some(RotateCertificates {
            ca_certificates: rotate_ca,
            services,
        });
        self.converge("cert rotate", config, spec, RunOptions::default()).await
    }

    async fn converge(
        &self,
        command: &'static str,
        config: &Path,
        spec: ClusterSpec,
        options: RunOptions,
    ) -> Result<RunSummary, EngineError> {
        let files = StateFiles::for_config(config);
        let mut ctx = self.context(spec)?;

        let (state, hosts) = match files.read()? {
            Some(state) => {
                let mut nodes = ctx.spec.nodes.clone();
                nodes.extend(departed(&ctx.spec, &state.current_state));
                let hosts = self.connect(&ctx.spec, &nodes).await?;
                (state, hosts)
            }
            None => {
                let mut hosts = self.connect(&ctx.spec, &ctx.spec.nodes).await?;
                let state = self.previous_state(&files, &hosts, &ctx.spec).await;
                let gone = departed(&ctx.spec, &state.current_state);
                if !gone.is_empty() {
                    let (extra, _) = Hosts::connect(self.dialer.as_ref(), &gone, self.runtime.fan_out(gone.len())).await;
                    hosts.merge(extra);
                }
                (state, hosts)
            }
        };

        let result = match encryption::resolve(&ctx.spec, &state.current_state) {
            Ok(config) => {
                ctx.encryption_config = config;
                self.run_layers(command, &ctx, &hosts, &files, state, options).await
            }
            Err(e) => Err(e),
        };
        hosts.close().await;
        result
    }

    async fn run_layers(
        &self,
        command: &'static str,
        ctx: &ServiceContext,
        hosts: &Hosts,
        files: &StateFiles,
        mut state: FullState,
        options: RunOptions,
    ) -> Result<RunSummary, EngineError> {
        let mut summary = RunSummary::new(command);
        let scheduler = self.scheduler(hosts.len());
        let previous = state.current_state.rke_config.clone();
        match &previous {
            Some(_) => info!("[state] Reconciling against state revision {}", state.current_state.revision),
            None => info!("[state] No previous cluster state, installing"),
        }

        scheduler.checkpoint()?;
        let observed = observe(hosts, &scheduler).await?;
        if !options.skip_port_check {
            preflight::check_ports(hosts, &ctx.spec.nodes, &observed, &scheduler).await?;
        }

        let converged = CertBundle::from_map(state.current_state.certificates_bundle.clone());
        let base = if state.desired_state.certificates_bundle.is_empty() {
            converged.clone()
        } else {
            CertBundle::from_map(state.desired_state.certificates_bundle.clone())
        };
        let bundle = self.certificates(&ctx.spec, &base)?;
        let changed: BTreeSet<String> = bundle.changed_since(&converged).into_iter().collect();

        state.desired_state = ClusterState {
            rke_config: Some(stored_spec(&ctx.spec)),
            certificates_bundle: bundle.as_map().clone(),
            encryption_config: ctx.encryption_config.clone(),
            revision: state.current_state.revision,
            updated_at: None,
        };
        files.write(&state)?;

        let kube = self.connectors.kube(kube_tls(&bundle))?;
        let addons = AddonReconciler::new(ctx, previous.as_ref())?;
        let api = match previous {
            Some(_) => self.cluster_api(&kube, &bundle).await,
            None => None,
        };
        let addon_steps = addons.plan(api.as_deref()).await;

        let plan = Plan::compute(PlanInput {
            ctx,
            previous: previous.as_ref(),
            observed: &observed,
            bundle: &bundle,
            changed_certs: &changed,
            addons: addon_steps,
            update_only: options.update_only,
        })?;
        for layer in Layer::ALL {
            for step in plan.active(layer) {
                debug!("[plan] {}", step);
            }
        }
        summary.counts = plan.counts();
        if plan.is_noop() {
            info!("[plan] Cluster is up to date");
        }

        let operator = self.operator(ctx);
        let deployers = self.deployers(ctx, &operator, hosts, &scheduler, kube.clone());

        scheduler.checkpoint()?;
        summary.record(deployers.distribute(&bundle, &plan.active(Layer::Certificates)).await?);

        scheduler.checkpoint()?;
        let etcd_connector = self.connectors.etcd(etcd_tls(&ctx.spec, &bundle))?;
        let previous_etcd = previous
            .as_ref()
            .map(|p| p.nodes_with_role(Role::Etcd))
            .unwrap_or_default();
        let control_plane = plan.active(Layer::ControlPlane);
        deployers
            .deploy_etcd(
                etcd_connector.clone(),
                &plan.active(Layer::Etcd),
                &previous_etcd,
                !control_plane.is_empty(),
            )
            .await?;

        scheduler.checkpoint()?;
        deployers.deploy_control_plane(&control_plane).await?;
        let rewrite = ctx.encryption_config.is_some()
            && !options.update_only
            && previous.as_ref().is_some_and(|p| encryption::changed(p, &ctx.spec));
        if rewrite {
            let api = self
                .cluster_api(&kube, &bundle)
                .await
                .ok_or_else(|| EngineError::Kube("cannot rewrite secrets: the Kubernetes API is unreachable".to_string()))?;
            api.rewrite_secrets().await?;
        }

        scheduler.checkpoint()?;
        let workers = plan.active(Layer::Workers);
        if !workers.is_empty() {
            let api = self.cluster_api(&kube, &bundle).await;
            summary.record(deployers.deploy_workers(api, &workers).await?);
        }

        scheduler.checkpoint()?;
        deployers.remove_components(&plan.active(Layer::Removals)).await?;

        scheduler.checkpoint()?;
        let addon_steps = plan.active(Layer::Addons);
        if !addon_steps.is_empty() {
            match self.cluster_api(&kube, &bundle).await {
                Some(api) => summary.record(addons.apply(api.as_ref(), &addon_steps, &scheduler).await?),
                None => summary.record(addon_steps.iter().map(|s| EngineError::AddonApplyFailed {
                    addon: s.component.clone(),
                    reason: "the Kubernetes API is unreachable".to_string(),
                })),
            }
        }

        let admin_kubeconfig = bundle.admin_kubeconfig().map(ToString::to_string);
        let current = ClusterState {
            rke_config: Some(stored_spec(&ctx.spec)),
            certificates_bundle: bundle.into_map(),
            encryption_config: ctx.encryption_config.clone(),
            revision: state.current_state.revision + 1,
            updated_at: Some(Utc::now()),
        };
        state.desired_state = current.clone();
        state.current_state = current;
        files.write(&state)?;
        if let Some(kubeconfig) = admin_kubeconfig {
            files.write_kubeconfig(&kubeconfig)?;
        }
        match etcd_connector.connect(&etcd::endpoints(&ctx.spec)).await {
            Ok(api) => {
                if let Err(e) = state::save_remote(api.as_ref(), &state.current_state).await {
                    warn!("[state] Cannot store the cluster state in etcd: {}", e);
                }
            }
            Err(e) => warn!("[state] Cannot store the cluster state in etcd: {}", e),
        }
        info!(
            "[state] Cluster state revision {} written to {}",
            state.current_state.revision,
            files.state.display()
        );
        summary.revision = Some(state.current_state.revision);
        Ok(summary)
    }

    /// Remove every cluster container from every known host and delete the
    /// local state
    ///
    /// Unreachable hosts are skipped and reported in the summary.
    ///
    /// # Errors
    ///
    /// Fails when a reachable host refuses a removal.
    pub async fn remove(&self, config: &Path) -> Result<RunSummary, EngineError> {
        let spec = load_cluster_file(config)?;
        let files = StateFiles::for_config(config);
        let state = files.read()?.unwrap_or_default();
        let mut nodes = spec.nodes.clone();
        nodes.extend(departed(&spec, &state.current_state));
        let ctx = self.context(spec)?;

        info!("Tearing down Kubernetes cluster {}", ctx.spec.cluster_name);
        let mut summary = RunSummary::new("remove");
        let (hosts, failures) = Hosts::connect(self.dialer.as_ref(), &nodes, self.runtime.fan_out(nodes.len())).await;
        summary.record(failures);
        let reachable: Vec<NodeConfig> = nodes.into_iter().filter(|n| hosts.contains(&n.address)).collect();

        let scheduler = self.scheduler(hosts.len());
        let operator = self.operator(&ctx);
        let result = match self.connectors.kube(None) {
            Ok(kube) => {
                self.deployers(&ctx, &operator, &hosts, &scheduler, kube)
                    .teardown(&reachable)
                    .await
            }
            Err(e) => Err(e),
        };
        hosts.close().await;
        result?;

        files.remove()?;
        summary.counts.insert(Action::Remove, reachable.len());
        Ok(summary)
    }

    async fn datastore_session(&self, config: &Path, s3: Option<S3BackupConfig>) -> Result<DatastoreSession, EngineError> {
        let mut spec = load_cluster_file(config)?;
        if spec.uses_external_etcd() {
            return Err(EngineError::ConfigInvalid(
                "snapshots are only available for etcd managed by the cluster".to_string(),
            ));
        }
        if s3.is_some() {
            spec.services.etcd.backup_config.s3_backup_config = s3;
        }
        let files = StateFiles::for_config(config);
        let current = files.read()?.map(|s| s.current_state).unwrap_or_default();
        if !current.is_installed() {
            return Err(EngineError::State(format!(
                "no cluster state at {}, run up first",
                files.state.display()
            )));
        }
        let bundle = CertBundle::from_map(current.certificates_bundle);
        let etcd = self.connectors.etcd(etcd_tls(&spec, &bundle))?;
        let ctx = self.context(spec)?;
        let core: Vec<NodeConfig> = ctx.spec.nodes.iter().filter(|n| holds_core_role(n)).cloned().collect();
        let hosts = self.connect(&ctx.spec, &core).await?;
        let operator = self.operator(&ctx);
        Ok(DatastoreSession {
            ctx,
            operator,
            etcd,
            hosts,
            ready_timeout: self.runtime.ready_timeout,
            poll_interval: self.runtime.poll_interval,
        })
    }

    /// Take snapshot `name` on every healthy etcd host; returns those hosts
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Datastore` when no member is healthy or a
    /// snapshot container fails.
    pub async fn snapshot_save(
        &self,
        config: &Path,
        name: &str,
        s3: Option<S3BackupConfig>,
    ) -> Result<Vec<String>, EngineError> {
        let session = self.datastore_session(config, s3).await?;
        let result = session.coordinator().save_snapshot(&session.hosts, name).await;
        session.close().await;
        result
    }

    /// Snapshots present on the etcd hosts
    ///
    /// # Errors
    ///
    /// Fails when no etcd host can be listed.
    pub async fn snapshot_list(&self, config: &Path) -> Result<Vec<SnapshotListing>, EngineError> {
        let session = self.datastore_session(config, None).await?;
        let result = session.coordinator().list_snapshots(&session.hosts).await;
        session.close().await;
        result
    }

    /// Delete snapshot `name` from every etcd host and the bucket
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ConfigInvalid` for a name with a path, or the
    /// first host failure.
    pub async fn snapshot_remove(&self, config: &Path, name: &str, s3: Option<S3BackupConfig>) -> Result<(), EngineError> {
        let session = self.datastore_session(config, s3).await?;
        let result = session.coordinator().remove_snapshot(&session.hosts, name).await;
        session.close().await;
        result
    }

    /// Rebuild etcd from snapshot `name`, then converge the cluster so the
    /// API servers come back against the restored data
    ///
    /// # Errors
    ///
    /// Returns the restore failure, or the first fatal failure of the
    /// following run.
    pub async fn snapshot_restore(
        &self,
        config: &Path,
        name: &str,
        s3: Option<S3BackupConfig>,
    ) -> Result<RunSummary, EngineError> {
        let session = self.datastore_session(config, s3.clone()).await?;
        let result = session.coordinator().restore(&session.hosts, name).await;
        session.close().await;
        result?;

        info!("[etcd] Snapshot {} restored, converging the cluster", name);
        let mut spec = load_cluster_file(config)?;
        if s3.is_some() {
            spec.services.etcd.backup_config.s3_backup_config = s3;
        }
        let options = RunOptions {
            skip_port_check: true,
            ..RunOptions::default()
        };
        self.converge("etcd snapshot-restore", config, spec, options).await
    }

    /// Kubernetes version reported by the cluster of `config`, `None` when
    /// no cluster was brought up from it
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Kube` when the API server cannot be queried.
    pub async fn cluster_version(&self, config: &Path) -> Result<Option<String>, EngineError> {
        let Some(state) = StateFiles::for_config(config).read()? else {
            return Ok(None);
        };
        if !state.current_state.is_installed() {
            return Ok(None);
        }
        let bundle = CertBundle::from_map(state.current_state.certificates_bundle);
        let Some(kubeconfig) = bundle.admin_kubeconfig() else {
            return Ok(None);
        };
        let api = self.connectors.kube(kube_tls(&bundle))?.connect(kubeconfig).await?;
        Ok(Some(api.server_version().await?))
    }
}
