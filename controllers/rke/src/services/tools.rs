//! One-shot tool containers: certificate and file deployers, host cleanup

use super::controlplane::{EXTERNAL_ETCD_CA_PATH, EXTERNAL_ETCD_CERT_PATH, EXTERNAL_ETCD_KEY_PATH};
use super::worker::KUBELET_DOCKER_CONFIG_PATH;
use super::{KUBERNETES_BIND, ServiceContext};
use crate::cloud::CLOUD_CONFIG_PATH;
use crate::encryption::ENCRYPTION_CONFIG_PATH;
use crate::error::EngineError;
use crate::metadata::image;
use cluster_types::{NodeConfig, Role};
use host_driver::ContainerSpec;
use pki::CertBundle;

pub const CERT_DEPLOYER_CONTAINER: &str = "cert-deployer";
pub const FILE_DEPLOYER_CONTAINER: &str = "file-deployer";
pub const CLEANER_CONTAINER: &str = "kube-cleaner";

/// Host directories wiped when a node leaves the cluster
pub const CLEANUP_PATHS: &[&str] = &[
    "/etc/kubernetes",
    "/var/lib/etcd",
    "/var/lib/kubelet",
    "/var/lib/rancher/rke/log",
    "/var/lib/cni",
    "/etc/cni",
    "/opt/cni",
    "/var/run/calico",
    "/opt/rke",
];

/// Single-quote `s` for `sh`
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// `printf` each variable into a temp file, then move it over the target
fn write_script(files: &[(String, String)]) -> String {
    let mut lines = vec!["set -e".to_string()];
    for (path, var) in files {
        let dir = path.rsplit_once('/').map_or("/", |(d, _)| d);
        let tmp = format!("{path}.tmp");
        lines.push(format!("mkdir -p {}", quote(dir)));
        lines.push(format!("printf '%s' \"${var}\" > {}", quote(&tmp)));
        lines.push(format!("mv -f {} {}", quote(&tmp), quote(path)));
    }
    lines.join("\n")
}

fn tool(ctx: &ServiceContext, name: &str, script: String, env: Vec<String>, binds: Vec<String>) -> Result<ContainerSpec, EngineError> {
    Ok(ContainerSpec {
        name: name.to_string(),
        image: ctx.image(image::CERT_DOWNLOADER)?,
        cmd: vec!["sh".to_string(), "-c".to_string(), script],
        env,
        binds,
        network_mode: "none".to_string(),
        ..Default::default()
    })
}

/// Writes the `wanted` bundle entries under the SSL directory
///
/// Certificates, keys (CA keys excluded) and component kubeconfigs travel
/// as environment variables; each file is written to a temp path first so
/// readers never see a partial PEM.
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` when the release lacks the image.
pub fn cert_deployer(ctx: &ServiceContext, bundle: &CertBundle, wanted: &[String]) -> Result<ContainerSpec, EngineError> {
    let env = bundle.deployer_env(wanted);
    let mut files = Vec::new();
    for entry in env.iter().filter_map(|e| e.split_once('=')).map(|(k, _)| k) {
        let Some(target) = wanted.iter().filter_map(|n| bundle.get(n)).find_map(|c| {
            if c.env_name == entry {
                Some(c.path.clone())
            } else if c.key_env_name == entry {
                Some(c.key_path.clone())
            } else if c.config_env_name == entry {
                Some(c.config_path.clone())
            } else {
                None
            }
        }) else {
            continue;
        };
        files.push((target, entry.to_string()));
    }
    tool(ctx, CERT_DEPLOYER_CONTAINER, write_script(&files), env, vec![KUBERNETES_BIND.to_string()])
}

/// Files `node` needs besides certificates, as `(host path, contents)`
///
/// # Errors
///
/// Fails when the cloud config cannot be rendered or registry credentials
/// cannot be fetched.
pub async fn host_files(ctx: &ServiceContext, node: &NodeConfig) -> Result<Vec<(String, String)>, EngineError> {
    let mut files = Vec::new();
    if node.is_kubernetes_node() {
        if let Some(cloud) = ctx.cloud() {
            files.push((CLOUD_CONFIG_PATH.to_string(), cloud.generate_cloud_config_file()?));
        }
        if let Some(config) = ctx.registries.kubelet_docker_config().await? {
            files.push((KUBELET_DOCKER_CONFIG_PATH.to_string(), config));
        }
    }
    if let Some(config) = ctx.encryption_config.as_ref().filter(|_| node.has_role(Role::ControlPlane)) {
        files.push((ENCRYPTION_CONFIG_PATH.to_string(), config.clone()));
    }
    let etcd = &ctx.spec.services.etcd;
    if node.has_role(Role::ControlPlane) && ctx.spec.uses_external_etcd() {
        files.push((EXTERNAL_ETCD_CA_PATH.to_string(), etcd.ca_cert.clone()));
        files.push((EXTERNAL_ETCD_CERT_PATH.to_string(), etcd.cert.clone()));
        files.push((EXTERNAL_ETCD_KEY_PATH.to_string(), etcd.key.clone()));
    }
    Ok(files)
}

/// Writes arbitrary `files` onto the host
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` when the release lacks the image.
pub fn file_deployer(ctx: &ServiceContext, files: &[(String, String)]) -> Result<ContainerSpec, EngineError> {
    let mut env = Vec::with_capacity(files.len());
    let mut targets = Vec::with_capacity(files.len());
    for (i, (path, contents)) in files.iter().enumerate() {
        let var = format!("FILE_{i}");
        env.push(format!("{var}={contents}"));
        targets.push((path.clone(), var));
    }
    let binds = vec![
        KUBERNETES_BIND.to_string(),
        "/var/lib/kubelet:/var/lib/kubelet:z".to_string(),
    ];
    let script = format!("umask 077\n{}", write_script(&targets));
    tool(ctx, FILE_DEPLOYER_CONTAINER, script, env, binds)
}

/// Removes the cluster's host directories
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` when the release lacks the image.
pub fn cleanup(ctx: &ServiceContext) -> Result<ContainerSpec, EngineError> {
    let mut binds = Vec::new();
    let mut targets = Vec::new();
    for (i, path) in CLEANUP_PATHS.iter().enumerate() {
        let mount = format!("/clean/{i}");
        binds.push(format!("{path}:{mount}:z"));
        targets.push(format!("{mount}/*"));
    }
    let script = format!("rm -rf {}", targets.join(" "));
    tool(ctx, CLEANER_CONTAINER, script, Vec::new(), binds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::tests::{context, node};
    use cluster_types::Role;

    #[test]
    fn test_cert_deployer_writes_atomically() {
        let cp = node("10.0.0.1", &[Role::ControlPlane, Role::Etcd]);
        let ctx = context(vec![cp.clone()]);
        let bundle = pki::generate(&ctx.spec, &pki::PkiOptions::default()).unwrap();
        let wanted = bundle.names_for_host(&ctx.spec, &cp);

        let spec = cert_deployer(&ctx, &bundle, &wanted).unwrap();
        let script = &spec.cmd[2];
        assert!(script.contains("printf '%s' \"$KUBE_APISERVER\" > '/etc/kubernetes/ssl/kube-apiserver.pem.tmp'"));
        assert!(script.contains("mv -f '/etc/kubernetes/ssl/kube-apiserver.pem.tmp' '/etc/kubernetes/ssl/kube-apiserver.pem'"));
        assert!(!spec.env.iter().any(|e| e.starts_with("KUBE_CA_KEY=")));
        assert!(spec.env.iter().any(|e| e.starts_with("KUBE_CA=")));
        assert!(!spec.env.iter().any(|e| e.starts_with("KUBECFG_KUBE_ADMIN=")));
    }

    #[tokio::test]
    async fn test_host_files_for_external_etcd() {
        let cp = node("10.0.0.1", &[Role::ControlPlane]);
        let mut ctx = context(vec![cp.clone()]);
        ctx.spec.services.etcd.external_urls = vec!["https://etcd.example:2379".to_string()];
        ctx.spec.services.etcd.ca_cert = "CA".to_string();
        ctx.spec.services.etcd.cert = "CERT".to_string();
        ctx.spec.services.etcd.key = "KEY".to_string();

        let files = host_files(&ctx, &cp).await.unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(files[0], (EXTERNAL_ETCD_CA_PATH.to_string(), "CA".to_string()));

        let spec = file_deployer(&ctx, &files).unwrap();
        assert_eq!(spec.env[1], "FILE_1=CERT");
        assert!(spec.cmd[2].contains("mkdir -p '/etc/kubernetes/ssl'"));
    }

    #[tokio::test]
    async fn test_encryption_file_only_on_control_plane() {
        let cp = node("10.0.0.1", &[Role::ControlPlane, Role::Etcd]);
        let worker = node("10.0.0.2", &[Role::Worker]);
        let mut ctx = context(vec![cp.clone(), worker.clone()]);
        ctx.encryption_config = Some("kind: EncryptionConfiguration\n".to_string());

        let files = host_files(&ctx, &cp).await.unwrap();
        assert!(files.iter().any(|(path, _)| path == ENCRYPTION_CONFIG_PATH));
        assert!(host_files(&ctx, &worker).await.unwrap().is_empty());

        let spec = file_deployer(&ctx, &files).unwrap();
        assert!(spec.cmd[2].starts_with("umask 077\n"));
    }

    #[test]
    fn test_cleanup_mounts_each_path() {
        let ctx = context(vec![node("10.0.0.1", &[Role::Worker])]);
        let spec = cleanup(&ctx).unwrap();
        assert_eq!(spec.binds.len(), CLEANUP_PATHS.len());
        assert!(spec.binds[0].starts_with("/etc/kubernetes:/clean/0"));
        assert!(spec.cmd[2].starts_with("rm -rf /clean/0/*"));
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("a'b"), r"'a'\''b'");
    }
}
