//! Cloud provider integrations
//!
//! A selected provider contributes a config file deployed to every host and
//! the `--cloud-provider`/`--cloud-config` flags of the API server,
//! controller manager and kubelet.

use crate::error::EngineError;
use cluster_types::CloudProviderConfig;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Host path of the rendered cloud config
pub const CLOUD_CONFIG_PATH: &str = "/etc/kubernetes/cloud-config";

/// Name under which the in-tree AWS provider is selected
pub const AWS_PROVIDER_NAME: &str = "aws";

/// A cloud provider integration
pub trait CloudProvider: Send + Sync + std::fmt::Debug {
    /// Value of `--cloud-provider`
    fn name(&self) -> &str;

    /// Contents of `CLOUD_CONFIG_PATH`
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ConfigInvalid` when the section is incomplete.
    fn generate_cloud_config_file(&self) -> Result<String, EngineError>;

    /// Flags added to components that talk to the cloud
    fn component_args(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("cloud-provider".to_string(), self.name().to_string()),
            ("cloud-config".to_string(), CLOUD_CONFIG_PATH.to_string()),
        ])
    }
}

/// In-tree AWS provider with a `[Global]` INI section
#[derive(Debug, Clone, Default)]
pub struct AwsCloudProvider {
    global: BTreeMap<String, String>,
}

impl AwsCloudProvider {
    #[must_use]
    pub fn init(config: &CloudProviderConfig) -> Self {
        Self {
            global: config
                .aws_cloud_provider
                .as_ref()
                .map(|aws| aws.global.clone())
                .unwrap_or_default(),
        }
    }
}

impl CloudProvider for AwsCloudProvider {
    fn name(&self) -> &str {
        AWS_PROVIDER_NAME
    }

    fn generate_cloud_config_file(&self) -> Result<String, EngineError> {
        let mut out = String::from("[Global]\n");
        for (key, value) in &self.global {
            if key.is_empty() || key.contains(['\n', '=']) || value.contains('\n') {
                return Err(EngineError::ConfigInvalid(format!(
                    "invalid aws_cloud_provider.global entry {key:?}"
                )));
            }
            let _ = writeln!(out, "{key}={value}");
        }
        Ok(out)
    }
}

/// Any other provider; the config file is taken verbatim
#[derive(Debug, Clone, Default)]
pub struct CustomCloudProvider {
    name: String,
    contents: String,
}

impl CustomCloudProvider {
    #[must_use]
    pub fn init(config: &CloudProviderConfig) -> Self {
        Self {
            name: config.name.clone(),
            contents: config.custom_cloud_provider.clone(),
        }
    }
}

impl CloudProvider for CustomCloudProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate_cloud_config_file(&self) -> Result<String, EngineError> {
        if self.contents.trim().is_empty() {
            return Err(EngineError::ConfigInvalid(format!(
                "cloud provider {} needs custom_cloud_provider contents",
                self.name
            )));
        }
        Ok(self.contents.clone())
    }
}

/// Provider selected by the cluster file; `None` when unset
#[must_use]
pub fn from_config(config: &CloudProviderConfig) -> Option<Box<dyn CloudProvider>> {
    match config.name.trim() {
        "" => None,
        AWS_PROVIDER_NAME => Some(Box::new(AwsCloudProvider::init(config))),
        _ => Some(Box::new(CustomCloudProvider::init(config))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_types::AwsCloudProvider as AwsSection;

    #[test]
    fn test_no_provider() {
        assert!(from_config(&CloudProviderConfig::default()).is_none());
    }

    #[test]
    fn test_aws_renders_global_section() {
        let config = CloudProviderConfig {
            name: "aws".to_string(),
            aws_cloud_provider: Some(AwsSection {
                global: BTreeMap::from([
                    ("Zone".to_string(), "us-east-1a".to_string()),
                    ("KubernetesClusterTag".to_string(), "prod".to_string()),
                ]),
            }),
            ..Default::default()
        };
        let provider = from_config(&config).unwrap();
        assert_eq!(provider.name(), "aws");
        assert_eq!(
            provider.generate_cloud_config_file().unwrap(),
            "[Global]\nKubernetesClusterTag=prod\nZone=us-east-1a\n"
        );
        let args = provider.component_args();
        assert_eq!(args.get("cloud-config").map(String::as_str), Some(CLOUD_CONFIG_PATH));
    }

    #[test]
    fn test_custom_requires_contents() {
        let mut config = CloudProviderConfig {
            name: "vsphere".to_string(),
            ..Default::default()
        };
        assert!(from_config(&config).unwrap().generate_cloud_config_file().is_err());
        config.custom_cloud_provider = "[Global]\nserver=vc.local\n".to_string();
        let provider = from_config(&config).unwrap();
        assert_eq!(provider.name(), "vsphere");
        assert!(provider.generate_cloud_config_file().unwrap().contains("vc.local"));
    }
}
