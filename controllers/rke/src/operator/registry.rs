//! Private registry selection

use super::ecr::{EcrTokenProvider, decode_token, ecr_region};
use crate::error::EngineError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use cluster_types::PrivateRegistry;
use host_driver::RegistryAuth;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

fn strip_scheme(url: &str) -> &str {
    url.strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url)
        .trim_end_matches('/')
}

/// Whether the first path segment of `image` names a registry host
#[must_use]
pub fn has_explicit_registry(image: &str) -> bool {
    match image.split_once('/') {
        Some((first, _)) => first.contains(['.', ':']) || first == "localhost",
        None => false,
    }
}

/// Registry credentials of a cluster
#[derive(Debug, Clone)]
pub struct Registries {
    registries: Vec<PrivateRegistry>,
    ecr: Arc<dyn EcrTokenProvider>,
}

impl Registries {
    #[must_use]
    pub fn new(registries: Vec<PrivateRegistry>, ecr: Arc<dyn EcrTokenProvider>) -> Self {
        Self { registries, ecr }
    }

    fn default_registry(&self) -> Option<&PrivateRegistry> {
        self.registries.iter().find(|r| r.is_default)
    }

    /// Prefix a system image with the default registry, if one is set
    #[must_use]
    pub fn system_image(&self, image: &str) -> String {
        match self.default_registry() {
            Some(registry) if !has_explicit_registry(image) => {
                format!("{}/{}", strip_scheme(&registry.url), image)
            }
            _ => image.to_string(),
        }
    }

    /// Registry whose URL is the longest prefix of `image`
    ///
    /// Images without a registry host use the default registry.
    #[must_use]
    pub fn lookup(&self, image: &str) -> Option<&PrivateRegistry> {
        if !has_explicit_registry(image) {
            return self.default_registry();
        }
        self.registries
            .iter()
            .filter(|r| {
                let url = strip_scheme(&r.url);
                !url.is_empty()
                    && image.starts_with(url)
                    && matches!(image.as_bytes().get(url.len()), None | Some(b'/' | b':'))
            })
            .max_by_key(|r| strip_scheme(&r.url).len())
    }

    async fn credentials(&self, registry: &PrivateRegistry) -> Result<Option<RegistryAuth>, EngineError> {
        let server = strip_scheme(&registry.url).to_string();
        let host = server.split('/').next().unwrap_or_default();
        let ecr = ecr_region(host)
            .filter(|_| registry.ecr_credential_plugin.is_some() || registry.user.is_empty());
        if let Some(region) = ecr {
            debug!("Using ECR credential plugin for {}", server);
            let token = self
                .ecr
                .authorization_token(&region, registry.ecr_credential_plugin.as_ref())
                .await?;
            let (username, password) = decode_token(token.as_deref())?;
            return Ok(Some(RegistryAuth {
                username,
                password,
                server_address: host.to_string(),
            }));
        }
        if registry.user.is_empty() && registry.password.is_empty() {
            return Ok(None);
        }
        Ok(Some(RegistryAuth {
            username: registry.user.clone(),
            password: registry.password.clone(),
            server_address: host.to_string(),
        }))
    }

    /// Credentials to pull `image`
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ConfigInvalid` when the ECR plugin fails.
    pub async fn auth_for(&self, image: &str) -> Result<Option<RegistryAuth>, EngineError> {
        match self.lookup(image) {
            Some(registry) => self.credentials(registry).await,
            None => Ok(None),
        }
    }

    /// Docker config JSON handed to the kubelet, `None` without credentials
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ConfigInvalid` when the ECR plugin fails.
    pub async fn kubelet_docker_config(&self) -> Result<Option<String>, EngineError> {
        let mut auths = BTreeMap::new();
        for registry in &self.registries {
            if let Some(auth) = self.credentials(registry).await? {
                let encoded = STANDARD.encode(format!("{}:{}", auth.username, auth.password));
                auths.insert(strip_scheme(&registry.url).to_string(), json!({ "auth": encoded }));
            }
        }
        if auths.is_empty() {
            return Ok(None);
        }
        Ok(Some(json!({ "auths": auths }).to_string()))
    }
}
