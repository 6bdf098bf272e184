//! Kubernetes release catalog
//!
//! Each supported release line carries its system images, the default flags
//! of every component and the addon templates that match it. The catalog is
//! built once per process and never mutated; a run resolves one `Release`
//! from it (applying the cluster file's `system_images` overrides) and passes
//! that value to whoever needs it.

use crate::error::EngineError;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

/// Version used when the cluster file names none
pub const DEFAULT_KUBERNETES_VERSION: &str = "v1.30.6-rancher1-1";

/// System image keys
pub mod image {
    pub const ETCD: &str = "etcd";
    pub const KUBERNETES: &str = "kubernetes";
    /// rke-tools: cert/file deployers, sidecars, kubectl for addon jobs
    pub const ALPINE: &str = "alpine";
    pub const NGINX_PROXY: &str = "nginx_proxy";
    pub const CERT_DOWNLOADER: &str = "cert_downloader";
    pub const SERVICE_SIDEKICK: &str = "kubernetes_services_sidecar";
    pub const POD_INFRA: &str = "pod_infra_container";
    pub const COREDNS: &str = "coredns";
    pub const KUBEDNS: &str = "kubedns";
    pub const DNSMASQ: &str = "dnsmasq";
    pub const KUBEDNS_SIDECAR: &str = "kubedns_sidecar";
    pub const FLANNEL: &str = "flannel";
    pub const FLANNEL_CNI: &str = "flannel_cni";
    pub const CALICO_NODE: &str = "calico_node";
    pub const CALICO_CNI: &str = "calico_cni";
    pub const CALICO_CONTROLLERS: &str = "calico_controllers";
    pub const CANAL_NODE: &str = "canal_node";
    pub const CANAL_CNI: &str = "canal_cni";
    pub const CANAL_FLANNEL: &str = "canal_flannel";
    pub const METRICS_SERVER: &str = "metrics_server";
    pub const INGRESS: &str = "ingress";
    pub const INGRESS_BACKEND: &str = "ingress_backend";
}

/// Addon template keys
pub mod template {
    pub const FLANNEL: &str = "flannel";
    pub const CANAL: &str = "canal";
    pub const CALICO: &str = "calico";
    pub const COREDNS: &str = "coredns";
    pub const KUBEDNS: &str = "kube-dns";
    pub const METRICS_SERVER: &str = "metrics-server";
    pub const NGINX_INGRESS: &str = "nginx";
}

const FLANNEL_TEMPLATE: &str = include_str!("templates/flannel.yaml");
const CANAL_TEMPLATE: &str = include_str!("templates/canal.yaml");
const CALICO_TEMPLATE: &str = include_str!("templates/calico.yaml");
const COREDNS_TEMPLATE: &str = include_str!("templates/coredns.yaml");
const KUBEDNS_TEMPLATE: &str = include_str!("templates/kube-dns.yaml");
const METRICS_SERVER_V06_TEMPLATE: &str = include_str!("templates/metrics-server-v0.6.yaml");
const METRICS_SERVER_V07_TEMPLATE: &str = include_str!("templates/metrics-server-v0.7.yaml");
const NGINX_INGRESS_TEMPLATE: &str = include_str!("templates/nginx-ingress.yaml");

/// Images by key
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SystemImages(BTreeMap<String, String>);

impl SystemImages {
    /// Image for `key`
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ConfigInvalid` when the release has no such image.
    pub fn get(&self, key: &str) -> Result<&str, EngineError> {
        self.0
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| EngineError::ConfigInvalid(format!("no system image {key} for this release")))
    }

    /// Every image, for pre-pull listings
    #[must_use]
    pub fn all(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    fn merge(&mut self, overrides: &BTreeMap<String, String>) {
        for (key, value) in overrides {
            if !value.is_empty() {
                self.0.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Default flags per component (`kube-apiserver`, `kubelet`, ...)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceOptions(BTreeMap<String, BTreeMap<String, String>>);

impl ServiceOptions {
    /// Defaults of `component`; empty for unknown components
    #[must_use]
    pub fn for_component(&self, component: &str) -> BTreeMap<String, String> {
        self.0.get(component).cloned().unwrap_or_default()
    }
}

/// Addon templates of a release
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Templates(BTreeMap<&'static str, &'static str>);

impl Templates {
    /// Template source for `key`
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ConfigInvalid` for a provider without a template.
    pub fn get(&self, key: &str) -> Result<&'static str, EngineError> {
        self.0
            .get(key)
            .copied()
            .ok_or_else(|| EngineError::ConfigInvalid(format!("no addon template for {key}")))
    }
}

/// Everything a run needs to know about one Kubernetes release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    /// Full version, e.g. `v1.30.6-rancher1-1`
    pub version: String,
    pub images: SystemImages,
    pub service_options: ServiceOptions,
    pub templates: Templates,
}

/// All embedded releases
#[derive(Debug)]
pub struct Catalog {
    releases: BTreeMap<String, Release>,
}

static BUILTIN: LazyLock<Catalog> = LazyLock::new(|| {
    let releases = [
        release("v1.28.15-rancher1-1", "v1.28.15-rancher1", "v3.5.9", "1.10.1", "v0.6.3", METRICS_SERVER_V06_TEMPLATE),
        release("v1.29.10-rancher1-1", "v1.29.10-rancher1", "v3.5.10", "1.11.1", "v0.7.1", METRICS_SERVER_V07_TEMPLATE),
        release("v1.30.6-rancher1-1", "v1.30.6-rancher1", "v3.5.12", "1.11.1", "v0.7.1", METRICS_SERVER_V07_TEMPLATE),
    ];
    Catalog {
        releases: releases.into_iter().map(|r| (r.version.clone(), r)).collect(),
    }
});

impl Catalog {
    /// The embedded catalog
    #[must_use]
    pub fn builtin() -> &'static Catalog {
        &BUILTIN
    }

    /// Supported versions, oldest first
    pub fn versions(&self) -> impl Iterator<Item = &str> {
        self.releases.keys().map(String::as_str)
    }

    /// Distinct images of `version`, sorted, for pre-pulling
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ConfigInvalid` for an unsupported version.
    pub fn system_images(&self, version: &str) -> Result<Vec<String>, EngineError> {
        let release = self.resolve(version, &BTreeMap::new())?;
        let images: BTreeSet<String> = release.images.all().values().cloned().collect();
        Ok(images.into_iter().collect())
    }

    /// Resolve `version` and apply image `overrides`
    ///
    /// An exact match wins; otherwise the newest release of the same
    /// `vMAJOR.MINOR` line is used. An empty version resolves to
    /// `DEFAULT_KUBERNETES_VERSION`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ConfigInvalid` for an unsupported version.
    pub fn resolve(&self, version: &str, overrides: &BTreeMap<String, String>) -> Result<Release, EngineError> {
        let version = if version.trim().is_empty() {
            DEFAULT_KUBERNETES_VERSION
        } else {
            version.trim()
        };
        let found = self.releases.get(version).or_else(|| {
            let line = minor_line(version)?;
            self.releases
                .values()
                .filter(|r| minor_line(&r.version).as_deref() == Some(line.as_str()))
                .max_by_key(|r| patch_of(&r.version))
        });
        let mut release = found.cloned().ok_or_else(|| {
            EngineError::ConfigInvalid(format!(
                "unsupported kubernetes_version {version}, supported: {}",
                self.versions().collect::<Vec<_>>().join(", ")
            ))
        })?;
        release.images.merge(overrides);
        Ok(release)
    }
}

/// `v1.29.3-rancher1-1` -> `v1.29`
fn minor_line(version: &str) -> Option<String> {
    let trimmed = version.strip_prefix('v').unwrap_or(version);
    let mut parts = trimmed.split(['.', '-']);
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next()?.parse().ok()?;
    Some(format!("v{major}.{minor}"))
}

fn patch_of(version: &str) -> u32 {
    version
        .strip_prefix('v')
        .unwrap_or(version)
        .split(['.', '-'])
        .nth(2)
        .and_then(|p| p.parse().ok())
        .unwrap_or(0)
}

fn release(
    version: &str,
    kubernetes_tag: &str,
    etcd_tag: &str,
    coredns_tag: &str,
    metrics_tag: &str,
    metrics_template: &'static str,
) -> Release {
    let images = [
        (image::ETCD, format!("rancher/mirrored-coreos-etcd:{etcd_tag}")),
        (image::KUBERNETES, format!("rancher/hyperkube:{kubernetes_tag}")),
        (image::ALPINE, "rancher/rke-tools:v0.1.100".to_string()),
        (image::NGINX_PROXY, "rancher/rke-tools:v0.1.100".to_string()),
        (image::CERT_DOWNLOADER, "rancher/rke-tools:v0.1.100".to_string()),
        (image::SERVICE_SIDEKICK, "rancher/rke-tools:v0.1.100".to_string()),
        (image::POD_INFRA, "rancher/mirrored-pause:3.7".to_string()),
        (image::COREDNS, format!("rancher/mirrored-coredns-coredns:{coredns_tag}")),
        (image::KUBEDNS, "rancher/mirrored-k8s-dns-kube-dns:1.22.28".to_string()),
        (image::DNSMASQ, "rancher/mirrored-k8s-dns-dnsmasq-nanny:1.22.28".to_string()),
        (image::KUBEDNS_SIDECAR, "rancher/mirrored-k8s-dns-sidecar:1.22.28".to_string()),
        (image::FLANNEL, "rancher/mirrored-flannel-flannel:v0.25.1".to_string()),
        (image::FLANNEL_CNI, "rancher/flannel-cni:v1.4.1-rancher1".to_string()),
        (image::CALICO_NODE, "rancher/mirrored-calico-node:v3.28.1".to_string()),
        (image::CALICO_CNI, "rancher/calico-cni:v3.28.1-rancher1".to_string()),
        (image::CALICO_CONTROLLERS, "rancher/mirrored-calico-kube-controllers:v3.28.1".to_string()),
        (image::CANAL_NODE, "rancher/mirrored-calico-node:v3.28.1".to_string()),
        (image::CANAL_CNI, "rancher/calico-cni:v3.28.1-rancher1".to_string()),
        (image::CANAL_FLANNEL, "rancher/mirrored-flannel-flannel:v0.25.1".to_string()),
        (image::METRICS_SERVER, format!("rancher/mirrored-metrics-server:{metrics_tag}")),
        (image::INGRESS, "rancher/nginx-ingress-controller:nginx-1.11.2-rancher1".to_string()),
        (image::INGRESS_BACKEND, "rancher/mirrored-nginx-ingress-controller-defaultbackend:1.5-rancher2".to_string()),
    ];

    let templates = BTreeMap::from([
        (template::FLANNEL, FLANNEL_TEMPLATE),
        (template::CANAL, CANAL_TEMPLATE),
        (template::CALICO, CALICO_TEMPLATE),
        (template::COREDNS, COREDNS_TEMPLATE),
        (template::KUBEDNS, KUBEDNS_TEMPLATE),
        (template::METRICS_SERVER, metrics_template),
        (template::NGINX_INGRESS, NGINX_INGRESS_TEMPLATE),
    ]);

    Release {
        version: version.to_string(),
        images: SystemImages(images.into_iter().map(|(k, v)| (k.to_string(), v)).collect()),
        service_options: default_service_options(),
        templates: Templates(templates),
    }
}

fn flags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
}

const TLS_CIPHER_SUITES: &str = "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,\
TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305,TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,\
TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305,TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384";

fn default_service_options() -> ServiceOptions {
    ServiceOptions(BTreeMap::from([
        (
            "etcd".to_string(),
            flags(&[
                ("client-cert-auth", "true"),
                ("peer-client-cert-auth", "true"),
                ("heartbeat-interval", "500"),
                ("election-timeout", "5000"),
                ("cipher-suites", TLS_CIPHER_SUITES),
            ]),
        ),
        (
            "kube-apiserver".to_string(),
            flags(&[
                ("allow-privileged", "true"),
                ("anonymous-auth", "false"),
                ("bind-address", "0.0.0.0"),
                ("enable-admission-plugins", "NamespaceLifecycle,LimitRanger,ServiceAccount,DefaultStorageClass,DefaultTolerationSeconds,MutatingAdmissionWebhook,ValidatingAdmissionWebhook,ResourceQuota,NodeRestriction"),
                ("profiling", "false"),
                ("requestheader-extra-headers-prefix", "X-Remote-Extra-"),
                ("requestheader-group-headers", "X-Remote-Group"),
                ("requestheader-username-headers", "X-Remote-User"),
                ("secure-port", "6443"),
                ("service-account-lookup", "true"),
                ("storage-backend", "etcd3"),
                ("tls-cipher-suites", TLS_CIPHER_SUITES),
            ]),
        ),
        (
            "kube-controller-manager".to_string(),
            flags(&[
                ("allocate-node-cidrs", "true"),
                ("allow-untagged-cloud", "true"),
                ("configure-cloud-routes", "false"),
                ("enable-hostpath-provisioner", "false"),
                ("leader-elect", "true"),
                ("node-monitor-grace-period", "40s"),
                ("profiling", "false"),
                ("terminated-pod-gc-threshold", "1000"),
                ("v", "2"),
            ]),
        ),
        (
            "kube-scheduler".to_string(),
            flags(&[("leader-elect", "true"), ("profiling", "false"), ("v", "2")]),
        ),
        (
            "kubelet".to_string(),
            flags(&[
                ("address", "0.0.0.0"),
                ("anonymous-auth", "false"),
                ("authentication-token-webhook", "true"),
                ("cgroups-per-qos", "True"),
                ("container-runtime-endpoint", "unix:///var/run/cri-dockerd.sock"),
                ("event-qps", "0"),
                ("make-iptables-util-chains", "true"),
                ("read-only-port", "0"),
                ("resolv-conf", "/etc/resolv.conf"),
                ("streaming-connection-idle-timeout", "30m"),
                ("v", "2"),
                ("volume-plugin-dir", "/var/lib/kubelet/volumeplugins"),
            ]),
        ),
        (
            "kube-proxy".to_string(),
            flags(&[("healthz-bind-address", "127.0.0.1"), ("v", "2")]),
        ),
    ]))
}
