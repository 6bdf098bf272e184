//! Kubeconfig documents for components and the cluster admin

use crate::error::Result;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;

/// API endpoint used by components on every host (direct or via nginx-proxy)
pub const LOCAL_API_SERVER: &str = "https://127.0.0.1:6443";

const CLUSTER_NAME: &str = "local";
const CONTEXT_NAME: &str = "Default";

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct Cluster {
    server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    certificate_authority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    certificate_authority_data: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct User {
    #[serde(skip_serializing_if = "Option::is_none")]
    client_certificate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_certificate_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_key_data: Option<String>,
}

#[derive(Serialize)]
struct Named<T> {
    name: String,
    #[serde(flatten)]
    value: T,
}

#[derive(Serialize)]
struct ClusterEntry {
    cluster: Cluster,
}

#[derive(Serialize)]
struct UserEntry {
    user: User,
}

#[derive(Serialize)]
struct Context {
    cluster: String,
    user: String,
}

#[derive(Serialize)]
struct ContextEntry {
    context: Context,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct Kubeconfig {
    api_version: &'static str,
    kind: &'static str,
    clusters: Vec<Named<ClusterEntry>>,
    users: Vec<Named<UserEntry>>,
    contexts: Vec<Named<ContextEntry>>,
    current_context: String,
}

fn document(server: &str, cluster: Cluster, user_name: &str, user: User) -> Result<String> {
    let config = Kubeconfig {
        api_version: "v1",
        kind: "Config",
        clusters: vec![Named {
            name: CLUSTER_NAME.to_string(),
            value: ClusterEntry {
                cluster: Cluster {
                    server: server.to_string(),
                    ..cluster
                },
            },
        }],
        users: vec![Named {
            name: user_name.to_string(),
            value: UserEntry { user },
        }],
        contexts: vec![Named {
            name: CONTEXT_NAME.to_string(),
            value: ContextEntry {
                context: Context {
                    cluster: CLUSTER_NAME.to_string(),
                    user: user_name.to_string(),
                },
            },
        }],
        current_context: CONTEXT_NAME.to_string(),
    };
    Ok(serde_yaml::to_string(&config)?)
}

/// Kubeconfig referencing bundle files on the host
///
/// # Errors
///
/// Returns `PkiError::Kubeconfig` if serialization fails.
pub fn component_kubeconfig(user_name: &str, ca_path: &str, cert_path: &str, key_path: &str) -> Result<String> {
    document(
        LOCAL_API_SERVER,
        Cluster {
            server: String::new(),
            certificate_authority: Some(ca_path.to_string()),
            certificate_authority_data: None,
        },
        user_name,
        User {
            client_certificate: Some(cert_path.to_string()),
            client_key: Some(key_path.to_string()),
            client_certificate_data: None,
            client_key_data: None,
        },
    )
}

/// Self-contained admin kubeconfig with embedded credentials
///
/// # Errors
///
/// Returns `PkiError::Kubeconfig` if serialization fails.
pub fn admin_kubeconfig(server: &str, user_name: &str, ca_pem: &str, cert_pem: &str, key_pem: &str) -> Result<String> {
    document(
        server,
        Cluster {
            server: String::new(),
            certificate_authority: None,
            certificate_authority_data: Some(STANDARD.encode(ca_pem)),
        },
        user_name,
        User {
            client_certificate: None,
            client_key: None,
            client_certificate_data: Some(STANDARD.encode(cert_pem)),
            client_key_data: Some(STANDARD.encode(key_pem)),
        },
    )
}

/// `https://<address>:6443`
#[must_use]
pub fn api_server_url(address: &str) -> String {
    format!("https://{address}:6443")
}
