//! ECR credential plugin
//!
//! Registries whose host matches the ECR pattern get a short-lived
//! `AWS:<token>` login from `GetAuthorizationToken` instead of static
//! credentials.

use crate::error::EngineError;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ecr::config::Credentials;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use cluster_types::EcrCredentialPlugin;
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

static ECR_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(^[a-zA-Z0-9][a-zA-Z0-9_\-]*)\.dkr\.ecr(-fips)?\.([a-zA-Z0-9][a-zA-Z0-9_\-]*)\.amazonaws\.com(\.cn)?",
    )
    .ok()
});

/// Region of an ECR registry URL, `None` for other registries
#[must_use]
pub fn ecr_region(url: &str) -> Option<String> {
    let host = url.strip_prefix("https://").unwrap_or(url);
    let captures = ECR_PATTERN.as_ref()?.captures(host)?;
    captures.get(3).map(|m| m.as_str().to_string())
}

/// Decode an ECR authorization token into `(user, password)`
///
/// # Errors
///
/// Returns `EngineError::ConfigInvalid` with `No authorization data returned`
/// when the token is missing and `Invalid token` when it does not decode to
/// `user:password`.
pub fn decode_token(token: Option<&str>) -> Result<(String, String), EngineError> {
    let token = token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| EngineError::ConfigInvalid("No authorization data returned".to_string()))?;
    let decoded = STANDARD
        .decode(token)
        .map_err(|e| EngineError::ConfigInvalid(format!("Invalid token: {e}")))?;
    let decoded = String::from_utf8(decoded).map_err(|e| EngineError::ConfigInvalid(format!("Invalid token: {e}")))?;
    match decoded.split_once(':') {
        Some((user, password)) if !user.is_empty() => Ok((user.to_string(), password.to_string())),
        _ => Err(EngineError::ConfigInvalid("Invalid token".to_string())),
    }
}

/// Fetches ECR authorization tokens
#[async_trait::async_trait]
pub trait EcrTokenProvider: Send + Sync + std::fmt::Debug {
    /// Raw base64 token for `region`; static credentials when given, the
    /// default AWS chain otherwise
    async fn authorization_token(
        &self,
        region: &str,
        credentials: Option<&EcrCredentialPlugin>,
    ) -> Result<Option<String>, EngineError>;
}

/// `GetAuthorizationToken` through the AWS SDK
#[derive(Debug, Clone, Copy, Default)]
pub struct AwsEcrTokens;

#[async_trait::async_trait]
impl EcrTokenProvider for AwsEcrTokens {
    async fn authorization_token(
        &self,
        region: &str,
        credentials: Option<&EcrCredentialPlugin>,
    ) -> Result<Option<String>, EngineError> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));
        if let Some(creds) = credentials.filter(|c| !c.aws_access_key_id.is_empty()) {
            let session = (!creds.aws_session_token.is_empty()).then(|| creds.aws_session_token.clone());
            loader = loader.credentials_provider(Credentials::new(
                creds.aws_access_key_id.clone(),
                creds.aws_secret_access_key.clone(),
                session,
                None,
                "rke-cluster-file",
            ));
        }
        let config = loader.load().await;
        let client = aws_sdk_ecr::Client::new(&config);
        debug!("Requesting ECR authorization token in {}", region);
        let output = client
            .get_authorization_token()
            .send()
            .await
            .map_err(|e| EngineError::ConfigInvalid(format!("ECR GetAuthorizationToken in {region}: {e}")))?;
        Ok(output
            .authorization_data()
            .first()
            .and_then(|d| d.authorization_token())
            .map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ecr_region() {
        assert_eq!(
            ecr_region("123456789012.dkr.ecr.us-west-2.amazonaws.com").as_deref(),
            Some("us-west-2")
        );
        assert_eq!(
            ecr_region("https://123456789012.dkr.ecr-fips.us-gov-west-1.amazonaws.com").as_deref(),
            Some("us-gov-west-1")
        );
        assert_eq!(
            ecr_region("123456789012.dkr.ecr.cn-north-1.amazonaws.com.cn/team").as_deref(),
            Some("cn-north-1")
        );
        assert_eq!(ecr_region("repo.com/foo"), None);
    }

    #[test]
    fn test_decode_token() {
        let token = STANDARD.encode("user:password");
        assert_eq!(
            decode_token(Some(&token)).unwrap(),
            ("user".to_string(), "password".to_string())
        );
        assert_eq!(
            decode_token(None).unwrap_err().to_string(),
            "Invalid cluster configuration: No authorization data returned"
        );
        assert!(decode_token(Some(&STANDARD.encode("nocolon"))).unwrap_err().to_string().contains("Invalid token"));
        assert!(decode_token(Some("%%%")).is_err());
    }
}
