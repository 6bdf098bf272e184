//! Cloud provider section

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cloud provider selection
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct CloudProviderConfig {
    /// Provider name passed to `--cloud-provider`; empty disables
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Raw cloud config contents for providers without a generator
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub custom_cloud_provider: String,

    /// `[Global]` options for the aws provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_cloud_provider: Option<AwsCloudProvider>,
}

/// AWS in-tree provider options
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct AwsCloudProvider {
    /// Key/value pairs written under `[Global]`
    #[serde(default)]
    pub global: BTreeMap<String, String>,
}
