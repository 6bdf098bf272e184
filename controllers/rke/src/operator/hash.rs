//! Container content hash
//!
//! The hash label on a managed container is the only drift signal: two specs
//! with the same hash are considered identical.

use host_driver::ContainerSpec;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Label carrying the content hash
pub const HASH_LABEL: &str = "org.rancher.rke.container.hash";
/// Label carrying the role the container serves
pub const ROLE_LABEL: &str = "org.rancher.rke.container.role";
/// Label carrying the container name
pub const NAME_LABEL: &str = "org.rancher.rke.container.name";

/// Strip SELinux relabel options from a `host:container[:opts]` bind
///
/// `z` and `Z` are removed from the comma-separated options; when nothing
/// remains the `:opts` suffix is dropped. Strings with fewer than two
/// `:`-separated sections are returned unchanged.
#[must_use]
pub fn normalize_bind(bind: &str) -> String {
    let parts: Vec<&str> = bind.split(':').collect();
    if parts.len() < 3 {
        return bind.to_string();
    }
    let (paths, opts) = parts.split_at(parts.len() - 1);
    let kept: Vec<&str> = opts[0]
        .split(',')
        .filter(|o| !o.is_empty() && *o != "z" && *o != "Z")
        .collect();
    if kept.is_empty() {
        paths.join(":")
    } else {
        format!("{}:{}", paths.join(":"), kept.join(","))
    }
}

#[derive(Serialize)]
struct HashInput<'a> {
    image: &'a str,
    cmd: &'a [String],
    entrypoint: &'a [String],
    env: Vec<&'a str>,
    binds: Vec<String>,
    cap_add: Vec<&'a str>,
    network_mode: &'a str,
    pid_mode: &'a str,
    privileged: bool,
    restart_policy: &'static str,
    labels: BTreeMap<&'a str, &'a str>,
    volumes_from: Vec<&'a str>,
}

fn sorted<'a>(items: &'a [String]) -> Vec<&'a str> {
    let mut out: Vec<&str> = items.iter().map(String::as_str).collect();
    out.sort_unstable();
    out
}

/// SHA-256 over the canonical form of `spec`
///
/// Env, caps and binds are order-insensitive; the hash label itself is
/// excluded.
#[must_use]
pub fn spec_hash(spec: &ContainerSpec) -> String {
    let mut binds: Vec<String> = spec.binds.iter().map(|b| normalize_bind(b)).collect();
    binds.sort_unstable();
    let input = HashInput {
        image: &spec.image,
        cmd: &spec.cmd,
        entrypoint: &spec.entrypoint,
        env: sorted(&spec.env),
        binds,
        cap_add: sorted(&spec.cap_add),
        network_mode: &spec.network_mode,
        pid_mode: &spec.pid_mode,
        privileged: spec.privileged,
        restart_policy: spec.restart_policy.as_str(),
        labels: spec
            .labels
            .iter()
            .filter(|(k, _)| k.as_str() != HASH_LABEL)
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect(),
        volumes_from: sorted(&spec.volumes_from),
    };
    // Serializing borrowed strings and maps cannot fail
    let canonical = serde_json::to_vec(&input).unwrap_or_default();
    hex::encode(Sha256::digest(&canonical))
}

/// Copy of `spec` carrying its hash, role and name labels
#[must_use]
pub fn labelled(mut spec: ContainerSpec, role: &str) -> ContainerSpec {
    spec.labels.insert(ROLE_LABEL.to_string(), role.to_string());
    spec.labels.insert(NAME_LABEL.to_string(), spec.name.clone());
    let hash = spec_hash(&spec);
    spec.labels.insert(HASH_LABEL.to_string(), hash);
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use host_driver::RestartPolicy;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "kubelet".to_string(),
            image: "rancher/hyperkube:v1.30.6-rancher1".to_string(),
            cmd: vec!["kubelet".to_string(), "--v=2".to_string()],
            env: vec!["B=2".to_string(), "A=1".to_string()],
            binds: vec!["/etc/kubernetes:/etc/kubernetes:z".to_string(), "/var/lib/kubelet:/var/lib/kubelet:shared,z".to_string()],
            restart_policy: RestartPolicy::Always,
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_bind() {
        assert_eq!(normalize_bind("/a:/b:z"), "/a:/b");
        assert_eq!(normalize_bind("/a:/b:Z"), "/a:/b");
        assert_eq!(normalize_bind("/a:/b:ro,z"), "/a:/b:ro");
        assert_eq!(normalize_bind("/a:/b:rshared,Z,ro"), "/a:/b:rshared,ro");
        assert_eq!(normalize_bind("/a:/b"), "/a:/b");
        assert_eq!(normalize_bind("/a"), "/a");
        assert_eq!(normalize_bind("garbage"), "garbage");
    }

    #[test]
    fn test_normalize_bind_is_idempotent() {
        for bind in ["/a:/b:z", "/a:/b:ro,Z", "/a:/b", "/x:/y:rshared,ro"] {
            let once = normalize_bind(bind);
            assert_eq!(normalize_bind(&once), once);
        }
    }

    #[test]
    fn test_hash_ignores_order_and_selinux_labels() {
        let a = spec();
        let mut b = spec();
        b.env.reverse();
        b.binds = vec!["/var/lib/kubelet:/var/lib/kubelet:shared".to_string(), "/etc/kubernetes:/etc/kubernetes".to_string()];
        assert_eq!(spec_hash(&a), spec_hash(&b));
    }

    #[test]
    fn test_hash_tracks_content() {
        let a = spec();
        let mut b = spec();
        b.cmd.push("--fail-swap-on=false".to_string());
        assert_ne!(spec_hash(&a), spec_hash(&b));

        let mut c = spec();
        c.image = "rancher/hyperkube:v1.29.10-rancher1".to_string();
        assert_ne!(spec_hash(&a), spec_hash(&c));
    }

    #[test]
    fn test_labelled_hash_is_stable() {
        let first = labelled(spec(), "worker");
        let again = labelled(first.clone(), "worker");
        assert_eq!(first.labels.get(HASH_LABEL), again.labels.get(HASH_LABEL));
        assert_eq!(first.labels.get(NAME_LABEL).map(String::as_str), Some("kubelet"));
    }
}
