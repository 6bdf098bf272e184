//! Addon Reconciler
//!
//! Cluster addons are rendered into manifests at plan time and applied by a
//! one-shot `kubectl` job pinned to the first control plane node. The job
//! carries the manifest hash as an annotation; a completed job with the same
//! hash means the addon is already applied.

pub mod params;

use crate::engine::plan::{Action, PlanStep};
use crate::engine::scheduler::Scheduler;
use crate::error::EngineError;
use crate::metadata::{image, template};
use crate::services::ServiceContext;
use crate::templates;
use cluster_types::{ClusterSpec, Role};
use k8s_client::{AddonJob, JobState, KubeApi, KubeApiError};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const NETWORK_PLUGIN_ADDON: &str = "rke-network-plugin";
pub const COREDNS_ADDON: &str = "rke-coredns";
pub const KUBEDNS_ADDON: &str = "rke-kube-dns";
pub const METRICS_ADDON: &str = "rke-metrics-addon";
pub const INGRESS_ADDON: &str = "rke-ingress-controller";
pub const USER_ADDON: &str = "rke-user-addon";
pub const USER_INCLUDES_ADDON: &str = "rke-user-includes-addons";

/// Role recorded on addon plan steps
pub const ADDONS_ROLE: &str = "addons";

/// Provider value that disables an addon
const NONE: &str = "none";

/// A rendered addon manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addon {
    pub name: String,
    pub manifest: String,
}

impl Addon {
    fn new(name: &str, manifest: String) -> Self {
        Self {
            name: name.to_string(),
            manifest,
        }
    }

    /// Hex sha256 of the manifest
    #[must_use]
    pub fn hash(&self) -> String {
        hex::encode(Sha256::digest(self.manifest.as_bytes()))
    }
}

fn enabled(provider: &str) -> bool {
    !provider.is_empty() && provider != NONE
}

/// Built-in addons of `ctx`, network plugin first
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` for an unknown provider or a
/// template that fails to render.
pub fn builtin(ctx: &ServiceContext) -> Result<Vec<Addon>, EngineError> {
    let spec = &ctx.spec;
    let mut out = Vec::new();

    if enabled(&spec.network.plugin) {
        let (key, values) = params::network(ctx, &spec.network.plugin)?;
        let manifest = templates::render(key, ctx.release.templates.get(key)?, &values)?;
        out.push(Addon::new(NETWORK_PLUGIN_ADDON, manifest));
    }
    if enabled(&spec.dns.provider) {
        let (key, values) = params::dns(ctx, &spec.dns.provider)?;
        let name = if key == template::KUBEDNS { KUBEDNS_ADDON } else { COREDNS_ADDON };
        let manifest = templates::render(key, ctx.release.templates.get(key)?, &values)?;
        out.push(Addon::new(name, manifest));
    }
    if enabled(&spec.monitoring.provider) {
        let values = params::metrics_server(ctx)?;
        let key = template::METRICS_SERVER;
        out.push(Addon::new(
            METRICS_ADDON,
            templates::render(key, ctx.release.templates.get(key)?, &values)?,
        ));
    }
    if enabled(&spec.ingress.provider) {
        if spec.ingress.provider != "nginx" {
            return Err(EngineError::ConfigInvalid(format!(
                "unsupported ingress provider {}",
                spec.ingress.provider
            )));
        }
        let values = params::nginx_ingress(ctx)?;
        let key = template::NGINX_INGRESS;
        out.push(Addon::new(
            INGRESS_ADDON,
            templates::render(key, ctx.release.templates.get(key)?, &values)?,
        ));
    }
    if !spec.addons.trim().is_empty() {
        out.push(Addon::new(USER_ADDON, spec.addons.clone()));
    }
    Ok(out)
}

/// Concatenate the `addons_include` files into one manifest
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` for a remote location or a file that
/// cannot be read.
pub fn read_includes(paths: &[String]) -> Result<Option<Addon>, EngineError> {
    if paths.is_empty() {
        return Ok(None);
    }
    let mut documents = Vec::with_capacity(paths.len());
    for path in paths {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Err(EngineError::ConfigInvalid(format!(
                "addons_include {path}: remote locations are not supported"
            )));
        }
        let body = std::fs::read_to_string(path)
            .map_err(|e| EngineError::ConfigInvalid(format!("addons_include {path}: {e}")))?;
        documents.push(body.trim().trim_start_matches("---").trim().to_string());
    }
    Ok(Some(Addon::new(USER_INCLUDES_ADDON, documents.join("\n---\n"))))
}

/// Plans and applies addon jobs for one run
#[derive(Debug)]
pub struct AddonReconciler<'a> {
    ctx: &'a ServiceContext,
    desired: Vec<Addon>,
    removed: Vec<Addon>,
}

impl<'a> AddonReconciler<'a> {
    /// Render the desired addons and find those `previous` had that are gone
    ///
    /// # Errors
    ///
    /// Fails when a desired addon cannot be rendered or an include file
    /// cannot be read.
    pub fn new(ctx: &'a ServiceContext, previous: Option<&ClusterSpec>) -> Result<Self, EngineError> {
        let mut desired = builtin(ctx)?;
        desired.extend(read_includes(&ctx.spec.addons_include)?);

        let mut removed = Vec::new();
        if let Some(previous) = previous {
            let prev_ctx = ServiceContext::new(previous.clone(), ctx.release.clone(), ctx.registries.clone());
            match builtin(&prev_ctx) {
                Ok(addons) => removed.extend(
                    addons
                        .into_iter()
                        .filter(|a| !desired.iter().any(|d| d.name == a.name)),
                ),
                Err(e) => warn!("[addons] Cannot render the previous addons, skipping removals: {}", e),
            }
        }
        Ok(Self { ctx, desired, removed })
    }

    /// Desired addons in apply order
    #[must_use]
    pub fn desired(&self) -> &[Addon] {
        &self.desired
    }

    /// Addons to delete
    #[must_use]
    pub fn removed(&self) -> &[Addon] {
        &self.removed
    }

    fn job_host(&self) -> Option<(String, String)> {
        self.ctx
            .spec
            .hosts_with_role(Role::ControlPlane)
            .next()
            .map(|n| (n.address.clone(), n.hostname().to_string()))
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.ctx.spec.addon_job_timeout.max(1))
    }

    /// Plan steps for every addon
    ///
    /// With `api` the existing deploy jobs are looked up: a completed job
    /// carrying the manifest hash is a no-op. Without it every desired addon
    /// is deployed.
    pub async fn plan(&self, api: Option<&dyn KubeApi>) -> Vec<PlanStep> {
        let host = self.job_host().map(|(address, _)| address).unwrap_or_default();
        let mut steps = Vec::with_capacity(self.desired.len() + self.removed.len());
        for addon in &self.desired {
            let action = match api {
                Some(api) => match api.get_job(&self.job(addon, false).job_name()).await {
                    Ok(None) => Action::Deploy,
                    Ok(Some(job)) if job.state == JobState::Complete && job.manifest_hash() == Some(addon.hash().as_str()) => {
                        Action::Noop
                    }
                    Ok(Some(_)) => Action::Upgrade,
                    Err(e) => {
                        debug!("[addons] Job lookup for {} failed: {}", addon.name, e);
                        Action::Deploy
                    }
                },
                None => Action::Deploy,
            };
            steps.push(PlanStep::new(&host, ADDONS_ROLE, &addon.name, action));
        }
        for addon in &self.removed {
            steps.push(PlanStep::new(&host, ADDONS_ROLE, &addon.name, Action::Remove));
        }
        steps
    }

    fn job(&self, addon: &Addon, delete: bool) -> AddonJob {
        AddonJob {
            addon: addon.name.clone(),
            node_name: self.job_host().map(|(_, name)| name).unwrap_or_default(),
            image: String::new(),
            delete,
            manifest_hash: addon.hash(),
        }
    }

    async fn run_job(&self, api: &dyn KubeApi, addon: &Addon, delete: bool) -> Result<(), EngineError> {
        let mut job = self.job(addon, delete);
        job.image = self.ctx.image(image::ALPINE)?;
        let name = job.job_name();

        if let Some(existing) = api.get_job(&name).await? {
            let applied = existing.state == JobState::Complete
                && existing.manifest_hash() == Some(job.manifest_hash.as_str());
            if applied && !delete {
                debug!("[addons] Job {} is already complete", name);
                return Ok(());
            }
            info!("[addons] Replacing job {}", name);
            api.delete_job(&name).await?;
        }
        api.apply_config_map(&addon.name, &addon.manifest).await?;
        api.create_job(&job).await?;
        match api.wait_job(&name, self.timeout()).await {
            Ok(_) => Ok(()),
            Err(KubeApiError::Timeout { .. }) => Err(EngineError::AddonApplyFailed {
                addon: addon.name.clone(),
                reason: format!("job {name} did not complete within {}s", self.timeout().as_secs()),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply the active addon steps, in order, and return the failures
    ///
    /// Each failure is recorded as `EngineError::AddonApplyFailed` and the
    /// next addon still runs.
    ///
    /// # Errors
    ///
    /// Fails only on cancellation or when the job service account cannot be
    /// created.
    pub async fn apply(
        &self,
        api: &dyn KubeApi,
        steps: &[PlanStep],
        scheduler: &Scheduler,
    ) -> Result<Vec<EngineError>, EngineError> {
        let active: Vec<&PlanStep> = steps.iter().filter(|s| !s.is_noop()).collect();
        if active.is_empty() {
            return Ok(Vec::new());
        }
        api.ensure_job_deployer().await?;

        let mut failures = Vec::new();
        for step in active {
            scheduler.checkpoint()?;
            let delete = step.action == Action::Remove;
            let pool = if delete { &self.removed } else { &self.desired };
            let Some(addon) = pool.iter().find(|a| a.name == step.component) else {
                continue;
            };
            if delete {
                info!("[addons] Removing addon {}", addon.name);
            } else {
                info!("[addons] Applying addon {}", addon.name);
            }
            match self.run_job(api, addon, delete).await {
                Ok(()) => info!("[addons] Addon {} is {}", addon.name, if delete { "removed" } else { "applied" }),
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => {
                    let failure = match e {
                        EngineError::AddonApplyFailed { .. } => e,
                        other => EngineError::AddonApplyFailed {
                            addon: addon.name.clone(),
                            reason: other.to_string(),
                        },
                    };
                    warn!("{}", failure);
                    failures.push(failure);
                }
            }
        }
        Ok(failures)
    }
}

#[cfg(test)]
#[path = "addons_test.rs"]
mod addons_test;
