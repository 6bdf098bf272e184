//! Addon job and drain data types

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use serde_json::json;
use std::collections::BTreeMap;

/// Namespace addon jobs and their manifests live in
pub const SYSTEM_NAMESPACE: &str = "kube-system";
/// Service account the addon jobs run as
pub const JOB_SERVICE_ACCOUNT: &str = "rke-job-deployer";
/// Cluster role binding granting the job account `cluster-admin`
pub const JOB_ROLE_BINDING: &str = "rke-job-deployer";
/// Annotation carrying the manifest hash on an addon job
pub const MANIFEST_HASH_ANNOTATION: &str = "rke.cattle.io/manifest-hash";
/// Where the job mounts the addon ConfigMap
pub const CONFIG_MOUNT_PATH: &str = "/etc/config";

const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Terminal or running state of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Pods still running or pending
    Active,
    /// `Complete` condition is true
    Complete,
    /// `Failed` condition is true, with its message
    Failed(String),
}

/// What the reconciler needs to know about an existing job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub name: String,
    pub annotations: BTreeMap<String, String>,
    pub state: JobState,
}

impl JobInfo {
    #[must_use]
    pub fn manifest_hash(&self) -> Option<&str> {
        self.annotations.get(MANIFEST_HASH_ANNOTATION).map(String::as_str)
    }
}

/// One-shot `kubectl apply|delete` job for an addon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonJob {
    /// Addon name; also the ConfigMap name and the manifest file stem
    pub addon: String,
    /// Control-plane node the job is pinned to
    pub node_name: String,
    /// kubectl-capable image
    pub image: String,
    /// Run `kubectl delete` instead of `apply`
    pub delete: bool,
    /// Content hash of the manifest
    pub manifest_hash: String,
}

impl AddonJob {
    /// `<addon>-deploy-job`, or `<addon>-delete-job` for removals
    #[must_use]
    pub fn job_name(&self) -> String {
        if self.delete {
            format!("{}-delete-job", self.addon)
        } else {
            format!("{}-deploy-job", self.addon)
        }
    }

    /// The kubectl invocation run in the job container
    #[must_use]
    pub fn command(&self) -> Vec<String> {
        let verb = if self.delete { "delete" } else { "apply" };
        vec![
            "kubectl".to_string(),
            verb.to_string(),
            "-f".to_string(),
            format!("{CONFIG_MOUNT_PATH}/{}.yaml", self.addon),
        ]
    }

    /// Build the batch/v1 Job object
    ///
    /// # Errors
    ///
    /// Returns an error if the generated object does not deserialize into a
    /// `Job`.
    pub fn to_job(&self) -> Result<Job, serde_json::Error> {
        serde_json::from_value(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": self.job_name(),
                "namespace": SYSTEM_NAMESPACE,
                "annotations": { MANIFEST_HASH_ANNOTATION: self.manifest_hash },
            },
            "spec": {
                "backoffLimit": 10,
                "template": {
                    "metadata": { "name": "rke-deploy" },
                    "spec": {
                        "nodeName": self.node_name,
                        "serviceAccountName": JOB_SERVICE_ACCOUNT,
                        "hostNetwork": true,
                        "restartPolicy": "Never",
                        "tolerations": [{ "operator": "Exists" }],
                        "containers": [{
                            "name": format!("{}-pod", self.job_name()),
                            "image": self.image,
                            "command": self.command(),
                            "volumeMounts": [{
                                "name": "config-volume",
                                "mountPath": CONFIG_MOUNT_PATH,
                            }],
                        }],
                        "volumes": [{
                            "name": "config-volume",
                            "configMap": {
                                "name": self.addon,
                                "items": [{ "key": self.addon, "path": format!("{}.yaml", self.addon) }],
                            },
                        }],
                    },
                },
            },
        }))
    }
}

/// ConfigMap `<addon>` holding the rendered manifest under key `<addon>`
///
/// # Errors
///
/// Returns an error if the generated object does not deserialize.
pub fn addon_config_map(addon: &str, manifest: &str) -> Result<ConfigMap, serde_json::Error> {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": addon, "namespace": SYSTEM_NAMESPACE },
        "data": { addon: manifest },
    }))
}

/// Pod as seen by drain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

/// Mirror pods and DaemonSet pods are left on a drained node
#[must_use]
pub fn is_evictable(pod: &Pod) -> bool {
    let meta = &pod.metadata;
    let mirror = meta
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION));
    let daemonset = meta
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.kind == "DaemonSet"));
    let finished = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Succeeded" || phase == "Failed");
    !mirror && !daemonset && !finished
}

/// State of a job from its status conditions
#[must_use]
pub fn job_state(job: &Job) -> JobState {
    let conditions = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();
    for condition in conditions {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" => return JobState::Complete,
            "Failed" => {
                return JobState::Failed(
                    condition
                        .message
                        .clone()
                        .unwrap_or_else(|| "job failed".to_string()),
                );
            }
            _ => {}
        }
    }
    JobState::Active
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn job() -> AddonJob {
        AddonJob {
            addon: "rke-network-plugin".to_string(),
            node_name: "cp-1".to_string(),
            image: "rancher/hyperkube:v1.30.4-rancher1".to_string(),
            delete: false,
            manifest_hash: "abc123".to_string(),
        }
    }

    #[test]
    fn test_job_is_pinned_and_annotated() {
        let job = job().to_job().unwrap();
        assert_eq!(job.metadata.name.as_deref(), Some("rke-network-plugin-deploy-job"));
        assert_eq!(job.metadata.namespace.as_deref(), Some(SYSTEM_NAMESPACE));
        assert_eq!(
            job.metadata.annotations.unwrap().get(MANIFEST_HASH_ANNOTATION).map(String::as_str),
            Some("abc123")
        );
        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.node_name.as_deref(), Some("cp-1"));
        assert_eq!(pod.service_account_name.as_deref(), Some(JOB_SERVICE_ACCOUNT));
        assert_eq!(
            pod.containers[0].command.as_ref().unwrap().join(" "),
            "kubectl apply -f /etc/config/rke-network-plugin.yaml"
        );
    }

    #[test]
    fn test_delete_job_uses_delete_verb() {
        let mut addon = job();
        addon.delete = true;
        assert_eq!(addon.job_name(), "rke-network-plugin-delete-job");
        assert_eq!(addon.command()[1], "delete");
    }

    #[test]
    fn test_config_map_holds_manifest() {
        let cm = addon_config_map("rke-coredns", "kind: Deployment").unwrap();
        assert_eq!(cm.data.unwrap().get("rke-coredns").map(String::as_str), Some("kind: Deployment"));
    }

    #[test]
    fn test_evictable_pods() {
        let mut pod = Pod::default();
        assert!(is_evictable(&pod));

        pod.metadata.owner_references = Some(vec![OwnerReference {
            kind: "DaemonSet".to_string(),
            ..OwnerReference::default()
        }]);
        assert!(!is_evictable(&pod));

        let mut mirror = Pod::default();
        mirror.metadata.annotations = Some(BTreeMap::from([(MIRROR_POD_ANNOTATION.to_string(), "x".to_string())]));
        assert!(!is_evictable(&mirror));
    }

    #[test]
    fn test_job_state_from_conditions() {
        let complete: Job = serde_json::from_value(json!({
            "status": { "conditions": [{ "type": "Complete", "status": "True" }] }
        }))
        .unwrap();
        assert_eq!(job_state(&complete), JobState::Complete);

        let failed: Job = serde_json::from_value(json!({
            "status": { "conditions": [{ "type": "Failed", "status": "True", "message": "BackoffLimitExceeded" }] }
        }))
        .unwrap();
        assert_eq!(job_state(&failed), JobState::Failed("BackoffLimitExceeded".to_string()));
        assert_eq!(job_state(&Job::default()), JobState::Active);
    }
}
