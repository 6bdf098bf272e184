//! kube-rs backed implementation

use crate::error::KubeApiError;
use crate::k8s_trait::{KubeApi, KubeConnector};
use crate::models::{
    AddonJob, JOB_ROLE_BINDING, JOB_SERVICE_ACCOUNT, JobInfo, JobState, PodRef, SYSTEM_NAMESPACE,
    addon_config_map, is_evictable, job_state,
};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, ResourceExt};
use kube_runtime::wait::{await_condition, conditions};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

const FIELD_MANAGER: &str = "rke";
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const DELETE_TIMEOUT: Duration = Duration::from_secs(60);

/// Cluster API client
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl fmt::Debug for KubeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeClient").finish_non_exhaustive()
    }
}

impl KubeClient {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from kubeconfig YAML
    ///
    /// # Errors
    ///
    /// Returns `KubeApiError::Kubeconfig` if the document does not parse or
    /// names no usable context.
    pub async fn from_kubeconfig(yaml: &str) -> Result<Self, KubeApiError> {
        let kubeconfig: Kubeconfig =
            serde_yaml::from_str(yaml).map_err(|e| KubeApiError::Kubeconfig(e.to_string()))?;
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| KubeApiError::Kubeconfig(e.to_string()))?;
        config.connect_timeout = Some(CONNECT_TIMEOUT);
        config.read_timeout = Some(READ_TIMEOUT);
        Ok(Self::new(Client::try_from(config)?))
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), SYSTEM_NAMESPACE)
    }

    async fn set_unschedulable(&self, node: &str, unschedulable: bool) -> Result<(), KubeApiError> {
        let patch = json!({ "spec": { "unschedulable": unschedulable } });
        match self
            .nodes()
            .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(KubeApiError::NodeNotFound(node.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn evictable_pods(&self, node: &str) -> Result<Vec<PodRef>, KubeApiError> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node}"));
        Ok(pods
            .list(&params)
            .await?
            .items
            .iter()
            .filter(|pod| is_evictable(pod))
            .map(|pod| PodRef {
                namespace: pod.namespace().unwrap_or_default(),
                name: pod.name_any(),
            })
            .collect())
    }

    async fn evict(&self, pod: &PodRef) -> Result<(), KubeApiError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        match api.evict(&pod.name, &EvictParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl KubeApi for KubeClient {
    async fn server_version(&self) -> Result<String, KubeApiError> {
        Ok(self.client.apiserver_version().await?.git_version)
    }

    async fn node_ready(&self, node: &str) -> Result<Option<bool>, KubeApiError> {
        let Some(found) = self.nodes().get_opt(node).await? else {
            return Ok(None);
        };
        let ready = found
            .status
            .and_then(|s| s.conditions)
            .unwrap_or_default()
            .iter()
            .any(|c| c.type_ == "Ready" && c.status == "True");
        Ok(Some(ready))
    }

    async fn cordon(&self, node: &str) -> Result<(), KubeApiError> {
        debug!("Cordoning node {}", node);
        self.set_unschedulable(node, true).await
    }

    async fn uncordon(&self, node: &str) -> Result<(), KubeApiError> {
        debug!("Uncordoning node {}", node);
        self.set_unschedulable(node, false).await
    }

    async fn drain(&self, node: &str, limit: Duration) -> Result<(), KubeApiError> {
        let pods = self.evictable_pods(node).await?;
        info!("Draining node {}: evicting {} pods", node, pods.len());
        futures::future::try_join_all(pods.iter().map(|pod| self.evict(pod))).await?;

        let deadline = Instant::now() + limit;
        loop {
            let remaining = self.evictable_pods(node).await?;
            if remaining.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(KubeApiError::Timeout {
                    what: format!("{} pods to leave node {node}", remaining.len()),
                    secs: limit.as_secs(),
                });
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn apply_config_map(&self, name: &str, manifest: &str) -> Result<(), KubeApiError> {
        let cm = addon_config_map(name, manifest)?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), SYSTEM_NAMESPACE);
        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&cm))
            .await?;
        Ok(())
    }

    async fn ensure_job_deployer(&self) -> Result<(), KubeApiError> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), SYSTEM_NAMESPACE);
        let account = json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": { "name": JOB_SERVICE_ACCOUNT, "namespace": SYSTEM_NAMESPACE },
        });
        accounts.patch(JOB_SERVICE_ACCOUNT, &params, &Patch::Apply(&account)).await?;

        let bindings: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        let binding = json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRoleBinding",
            "metadata": { "name": JOB_ROLE_BINDING },
            "roleRef": {
                "apiGroup": "rbac.authorization.k8s.io",
                "kind": "ClusterRole",
                "name": "cluster-admin",
            },
            "subjects": [{
                "kind": "ServiceAccount",
                "name": JOB_SERVICE_ACCOUNT,
                "namespace": SYSTEM_NAMESPACE,
            }],
        });
        bindings.patch(JOB_ROLE_BINDING, &params, &Patch::Apply(&binding)).await?;
        Ok(())
    }

    async fn get_job(&self, name: &str) -> Result<Option<JobInfo>, KubeApiError> {
        Ok(self.jobs().get_opt(name).await?.map(|job| JobInfo {
            name: job.name_any(),
            annotations: job.annotations().clone(),
            state: job_state(&job),
        }))
    }

    async fn create_job(&self, job: &AddonJob) -> Result<(), KubeApiError> {
        let object = job.to_job()?;
        self.jobs().create(&PostParams::default(), &object).await?;
        Ok(())
    }

    async fn delete_job(&self, name: &str) -> Result<(), KubeApiError> {
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..DeleteParams::default()
        };
        let deleted = match self.jobs().delete(name, &params).await {
            Ok(deleted) => deleted,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if let Some(uid) = deleted.left().and_then(|job| job.uid()) {
            timeout(
                DELETE_TIMEOUT,
                await_condition(self.jobs(), name, conditions::is_deleted(&uid)),
            )
            .await
            .map_err(|_elapsed| KubeApiError::Timeout {
                what: format!("job {name} deletion"),
                secs: DELETE_TIMEOUT.as_secs(),
            })?
            .map_err(|e| KubeApiError::Wait(e.to_string()))?;
        }
        Ok(())
    }

    async fn rewrite_secrets(&self) -> Result<usize, KubeApiError> {
        let all: Api<Secret> = Api::all(self.client.clone());
        let secrets = all.list(&ListParams::default()).await?;
        let mut written = 0;
        for secret in secrets {
            let Some(namespace) = secret.namespace() else {
                continue;
            };
            let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
            api.replace(&secret.name_any(), &PostParams::default(), &secret).await?;
            written += 1;
        }
        info!("Rewrote {} secrets with the current encryption provider", written);
        Ok(written)
    }

    async fn wait_job(&self, name: &str, limit: Duration) -> Result<JobState, KubeApiError> {
        let finished = |job: Option<&Job>| job.is_some_and(|j| job_state(j) != JobState::Active);
        let job = timeout(limit, await_condition(self.jobs(), name, finished))
            .await
            .map_err(|_elapsed| KubeApiError::Timeout {
                what: format!("job {name}"),
                secs: limit.as_secs(),
            })?
            .map_err(|e| KubeApiError::Wait(e.to_string()))?;
        match job.as_ref().map(job_state) {
            Some(JobState::Complete) => Ok(JobState::Complete),
            Some(JobState::Failed(reason)) => Err(KubeApiError::JobFailed {
                name: name.to_string(),
                reason,
            }),
            _ => {
                warn!("Job {} disappeared while waiting", name);
                Err(KubeApiError::JobFailed {
                    name: name.to_string(),
                    reason: "job deleted".to_string(),
                })
            }
        }
    }
}

/// Client certificate material for talking to API servers directly
#[derive(Clone)]
pub struct KubeTls {
    pub ca_pem: String,
    pub cert_pem: String,
    pub key_pem: String,
}

impl fmt::Debug for KubeTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeTls").finish_non_exhaustive()
    }
}

/// Connector used by the engine
#[derive(Debug, Clone)]
pub struct KubeClientFactory {
    http: reqwest::Client,
}

impl KubeClientFactory {
    /// Build a connector; `tls` authenticates the `/healthz` probe
    ///
    /// # Errors
    ///
    /// Returns `KubeApiError::Tls` if the PEM material is rejected.
    pub fn new(tls: Option<&KubeTls>, probe_timeout: Duration) -> Result<Self, KubeApiError> {
        let mut builder = reqwest::Client::builder().timeout(probe_timeout);
        if let Some(tls) = tls {
            let ca = reqwest::Certificate::from_pem(tls.ca_pem.as_bytes())
                .map_err(|e| KubeApiError::Tls(format!("invalid CA certificate: {e}")))?;
            let identity = reqwest::Identity::from_pem(format!("{}\n{}", tls.cert_pem, tls.key_pem).as_bytes())
                .map_err(|e| KubeApiError::Tls(format!("invalid client certificate: {e}")))?;
            builder = builder.add_root_certificate(ca).identity(identity);
        }
        Ok(Self { http: builder.build()? })
    }
}

#[async_trait::async_trait]
impl KubeConnector for KubeClientFactory {
    async fn connect(&self, kubeconfig: &str) -> Result<Arc<dyn KubeApi>, KubeApiError> {
        Ok(Arc::new(KubeClient::from_kubeconfig(kubeconfig).await?))
    }

    async fn healthz(&self, server: &str) -> Result<bool, KubeApiError> {
        let url = format!("{}/healthz", server.trim_end_matches('/'));
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            debug!("{} returned {}", url, response.status());
            return Ok(false);
        }
        Ok(response.text().await?.trim() == "ok")
    }
}
