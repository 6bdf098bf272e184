//! Secrets encryption at rest
//!
//! The API server reads its provider file from the SSL directory. A custom
//! `EncryptionConfiguration` is written as given; otherwise an aescbc key is
//! generated once, kept in the cluster state and reused on later runs.

use crate::error::EngineError;
use crate::templates;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use cluster_types::{ClusterSpec, ClusterState, SecretsEncryptionConfig};
use rand::RngCore;
use serde_json::json;

/// Host path of the provider file
pub const ENCRYPTION_CONFIG_PATH: &str = "/etc/kubernetes/ssl/encryption.yaml";

const GENERATED_TEMPLATE: &str = "\
apiVersion: apiserver.config.k8s.io/v1
kind: EncryptionConfiguration
resources:
  - resources:
      - secrets
    providers:
      - aescbc:
          keys:
            - name: key1
              secret: {{ secret }}
      - identity: {}
";

fn is_generated(config: Option<&SecretsEncryptionConfig>) -> bool {
    config.is_some_and(|c| c.custom_config.is_none())
}

/// Provider file for `spec`, or `None` when encryption is off
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` when the custom configuration cannot
/// be serialized.
pub fn resolve(spec: &ClusterSpec, current: &ClusterState) -> Result<Option<String>, EngineError> {
    let Some(config) = spec.services.kube_api.encryption() else {
        return Ok(None);
    };
    if let Some(custom) = &config.custom_config {
        return serde_yaml::to_string(custom)
            .map(Some)
            .map_err(|e| EngineError::ConfigInvalid(format!("secrets_encryption_config: {e}")));
    }
    let previous = current.rke_config.as_ref().and_then(|p| p.services.kube_api.encryption());
    if let Some(existing) = current.encryption_config.as_ref().filter(|_| is_generated(previous)) {
        return Ok(Some(existing.clone()));
    }
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    templates::render("encryption.yaml", GENERATED_TEMPLATE, &json!({ "secret": STANDARD.encode(key) })).map(Some)
}

/// Whether the encryption settings differ between two cluster files
#[must_use]
pub fn changed(previous: &ClusterSpec, spec: &ClusterSpec) -> bool {
    previous.services.kube_api.encryption() != spec.services.kube_api.encryption()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with(config: Option<SecretsEncryptionConfig>) -> ClusterSpec {
        let mut spec = ClusterSpec::default();
        spec.services.kube_api.secrets_encryption_config = config;
        spec
    }

    fn generated() -> Option<SecretsEncryptionConfig> {
        Some(SecretsEncryptionConfig {
            enabled: true,
            custom_config: None,
        })
    }

    fn custom() -> Option<SecretsEncryptionConfig> {
        Some(SecretsEncryptionConfig {
            enabled: true,
            custom_config: Some(json!({
                "apiVersion": "apiserver.config.k8s.io/v1",
                "kind": "EncryptionConfiguration",
                "resources": [{"resources": ["secrets"], "providers": [{"identity": {}}]}],
            })),
        })
    }

    #[test]
    fn test_disabled_has_no_file() {
        let off = spec_with(Some(SecretsEncryptionConfig {
            enabled: false,
            custom_config: None,
        }));
        assert_eq!(resolve(&off, &ClusterState::default()).unwrap(), None);
        assert_eq!(resolve(&spec_with(None), &ClusterState::default()).unwrap(), None);
    }

    #[test]
    fn test_generated_key_is_kept_across_runs() {
        let spec = spec_with(generated());
        let first = resolve(&spec, &ClusterState::default()).unwrap().unwrap();
        assert!(first.contains("kind: EncryptionConfiguration"));
        assert!(first.contains("aescbc"));

        let state = ClusterState {
            rke_config: Some(spec.clone()),
            encryption_config: Some(first.clone()),
            ..Default::default()
        };
        assert_eq!(resolve(&spec, &state).unwrap(), Some(first));
    }

    #[test]
    fn test_custom_config_is_written_as_given() {
        let spec = spec_with(custom());
        let file = resolve(&spec, &ClusterState::default()).unwrap().unwrap();
        let parsed: serde_json::Value = serde_yaml::from_str(&file).unwrap();
        assert_eq!(parsed["kind"], "EncryptionConfiguration");
        assert_eq!(parsed["resources"][0]["providers"][0], json!({"identity": {}}));
    }

    #[test]
    fn test_leaving_custom_config_generates_a_key() {
        let previous = spec_with(custom());
        let state = ClusterState {
            encryption_config: resolve(&previous, &ClusterState::default()).unwrap(),
            rke_config: Some(previous),
            ..Default::default()
        };
        let file = resolve(&spec_with(generated()), &state).unwrap().unwrap();
        assert!(file.contains("aescbc"));
    }

    #[test]
    fn test_changed() {
        assert!(!changed(&spec_with(None), &spec_with(None)));
        assert!(changed(&spec_with(None), &spec_with(generated())));
        assert!(changed(&spec_with(generated()), &spec_with(custom())));
        assert!(!changed(&spec_with(custom()), &spec_with(custom())));
    }
}
