//! Private registry credentials

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// AWS credentials used to fetch ECR tokens
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct EcrCredentialPlugin {
    /// Access key id; empty uses the default AWS credential chain
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub aws_access_key_id: String,
    /// Secret access key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub aws_secret_access_key: String,
    /// Session token
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub aws_session_token: String,
}

/// A registry and the credentials to pull from it
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct PrivateRegistry {
    /// Registry URL, optionally with a path prefix (`repo.com/foo/bar`)
    pub url: String,
    /// Username
    #[serde(default)]
    pub user: String,
    /// Password
    #[serde(default)]
    pub password: String,
    /// Prefix system images with this registry
    #[serde(default)]
    pub is_default: bool,
    /// Fetch credentials from ECR instead of `user`/`password`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecr_credential_plugin: Option<EcrCredentialPlugin>,
}
