//! Bundle generation, reconciliation and rotation
//!
//! All three entry points share `build`: CAs and the service-account key are
//! carried over unless a CA rotation is requested, each expected leaf is
//! reused when it still verifies and its SANs cover the expected set, and
//! entries no longer expected (hosts that left) are dropped.

use crate::authority::{CertificateAuthority, PkiOptions, generate_key, load_key};
use crate::bundle::CertBundle;
use crate::error::Result;
use crate::generate::{KubeconfigKind, LeafPlan, expected_leaves};
use crate::kubeconfig::{LOCAL_API_SERVER, admin_kubeconfig, api_server_url, component_kubeconfig};
use crate::names::{
    self, CA_CERT_NAME, KUBE_ADMIN_CERT_NAME, REQUEST_HEADER_CA_CERT_NAME,
    SERVICE_ACCOUNT_TOKEN_KEY_NAME,
};
use crate::verify::{cert_sans, common_name, verify_signed_by};
use cluster_types::{CertificatePki, ClusterSpec, Role};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Outcome of a bundle computation
#[derive(Debug, Clone)]
pub struct BundleChange {
    /// The resulting bundle
    pub bundle: CertBundle,
    /// Entries created or re-signed in this computation
    pub regenerated: BTreeSet<String>,
    /// Entries dropped because nothing needs them any more
    pub removed: BTreeSet<String>,
    /// Whether a new CA was generated
    pub ca_rotated: bool,
}

impl BundleChange {
    /// Whether anything differs from the input bundle
    #[must_use]
    pub fn is_changed(&self) -> bool {
        !self.regenerated.is_empty() || !self.removed.is_empty()
    }
}

fn base_entry(name: &str) -> CertificatePki {
    CertificatePki {
        name: name.to_string(),
        path: names::cert_path(name),
        key_path: names::key_path(name),
        env_name: names::env_name(name),
        key_env_name: names::key_env_name(name),
        ..Default::default()
    }
}

fn ca_entry(ca: &CertificateAuthority) -> CertificatePki {
    CertificatePki {
        certificate_pem: ca.cert_pem().to_string(),
        key_pem: ca.key_pem().to_string(),
        common_name: ca.name().to_string(),
        ..base_entry(ca.name())
    }
}

fn admin_server(spec: &ClusterSpec) -> String {
    spec.hosts_with_role(Role::ControlPlane)
        .next()
        .map_or_else(|| LOCAL_API_SERVER.to_string(), |n| api_server_url(&n.address))
}

fn render_config(spec: &ClusterSpec, plan: &LeafPlan, entry: &mut CertificatePki, ca_pem: &str) -> Result<()> {
    match plan.kubeconfig {
        KubeconfigKind::None => {}
        KubeconfigKind::Component => {
            entry.config = component_kubeconfig(
                &plan.name,
                &names::cert_path(CA_CERT_NAME),
                &entry.path,
                &entry.key_path,
            )?;
            entry.config_path = names::config_path(&plan.name);
            entry.config_env_name = names::config_env_name(&plan.name);
        }
        KubeconfigKind::Admin => {
            entry.config = admin_kubeconfig(
                &admin_server(spec),
                KUBE_ADMIN_CERT_NAME,
                ca_pem,
                &entry.certificate_pem,
                &entry.key_pem,
            )?;
            entry.config_path = names::config_path(&plan.name);
            entry.config_env_name = names::config_env_name(&plan.name);
        }
    }
    Ok(())
}

/// Why an existing leaf cannot be reused, if it cannot
fn reuse_blocker(plan: &LeafPlan, existing: &CertificatePki, issuer_pem: &str) -> Option<String> {
    if existing.certificate_pem.is_empty() || existing.key_pem.is_empty() {
        return Some("missing certificate or key".to_string());
    }
    if let Err(e) = verify_signed_by(&plan.name, &existing.certificate_pem, issuer_pem) {
        return Some(e.to_string());
    }
    match common_name(&existing.certificate_pem) {
        Ok(cn) if cn == plan.profile.common_name => {}
        Ok(cn) => return Some(format!("common name {cn} differs")),
        Err(e) => return Some(e.to_string()),
    }
    let present = match cert_sans(&existing.certificate_pem) {
        Ok(s) => s,
        Err(e) => return Some(e.to_string()),
    };
    let missing: Vec<&String> = plan.profile.sans.iter().filter(|s| !present.contains(*s)).collect();
    if missing.is_empty() {
        None
    } else {
        Some(format!("missing SANs {missing:?}"))
    }
}

fn issue(
    plan: &LeafPlan,
    issuer: &CertificateAuthority,
    existing_key: Option<&str>,
    options: &PkiOptions,
) -> Result<CertificatePki> {
    let key = match existing_key.map(load_key) {
        Some(Ok(key)) => key,
        _ => generate_key(options.leaf_algorithm)?,
    };
    let certificate_pem = issuer.sign(&plan.name, &plan.profile, &key)?;
    Ok(CertificatePki {
        certificate_pem,
        key_pem: key.serialize_pem(),
        common_name: plan.profile.common_name.clone(),
        ou_name: plan.profile.organization.clone(),
        ..base_entry(&plan.name)
    })
}

fn carry_or_generate_ca(
    previous: &CertBundle,
    name: &str,
    common_name: &str,
    fresh: bool,
    options: &PkiOptions,
    regenerated: &mut BTreeSet<String>,
) -> Result<CertificateAuthority> {
    if !fresh {
        if let Ok(ca) = previous.authority(name) {
            return Ok(ca);
        }
    }
    info!("[certificates] Generating {} certificate authority", name);
    regenerated.insert(name.to_string());
    CertificateAuthority::generate(name, common_name, options.ca_algorithm)
}

fn build(
    spec: &ClusterSpec,
    previous: &CertBundle,
    options: &PkiOptions,
    rotate_ca: bool,
    force: &dyn Fn(&str) -> bool,
) -> Result<BundleChange> {
    let mut regenerated = BTreeSet::new();
    let mut bundle = CertBundle::default();

    let ca = carry_or_generate_ca(previous, CA_CERT_NAME, CA_CERT_NAME, rotate_ca, options, &mut regenerated)?;
    let request_header_ca = carry_or_generate_ca(
        previous,
        REQUEST_HEADER_CA_CERT_NAME,
        REQUEST_HEADER_CA_CERT_NAME,
        rotate_ca,
        options,
        &mut regenerated,
    )?;
    let ca_rotated = regenerated.contains(CA_CERT_NAME) && !previous.is_empty();
    bundle.insert(ca_entry(&ca));
    bundle.insert(ca_entry(&request_header_ca));

    // The service-account key is not signed by the CA and survives CA rotation
    match previous.get(SERVICE_ACCOUNT_TOKEN_KEY_NAME).filter(|e| !e.key_pem.is_empty()) {
        Some(entry) => bundle.insert(entry.clone()),
        None => {
            let key = generate_key(options.leaf_algorithm)?;
            regenerated.insert(SERVICE_ACCOUNT_TOKEN_KEY_NAME.to_string());
            bundle.insert(CertificatePki {
                key_pem: key.serialize_pem(),
                common_name: SERVICE_ACCOUNT_TOKEN_KEY_NAME.to_string(),
                ..base_entry(SERVICE_ACCOUNT_TOKEN_KEY_NAME)
            });
        }
    }

    for plan in expected_leaves(spec)? {
        let issuer = if names::issuer_of(&plan.name) == REQUEST_HEADER_CA_CERT_NAME {
            &request_header_ca
        } else {
            &ca
        };
        let existing = previous.get(&plan.name);
        let forced = rotate_ca || force(&plan.name);

        let mut entry = match existing {
            Some(current) if !forced => match reuse_blocker(&plan, current, issuer.cert_pem()) {
                None => current.clone(),
                Some(reason) => {
                    info!("[certificates] Regenerating {}: {}", plan.name, reason);
                    regenerated.insert(plan.name.clone());
                    issue(&plan, issuer, Some(&current.key_pem), options)?
                }
            },
            Some(_) => {
                info!("[certificates] Rotating {}", plan.name);
                regenerated.insert(plan.name.clone());
                issue(&plan, issuer, None, options)?
            }
            None => {
                debug!("[certificates] Generating {}", plan.name);
                regenerated.insert(plan.name.clone());
                issue(&plan, issuer, None, options)?
            }
        };
        render_config(spec, &plan, &mut entry, ca.cert_pem())?;
        if existing != Some(&entry) && !regenerated.contains(&plan.name) {
            // Kubeconfig re-rendered (admin endpoint moved)
            regenerated.insert(plan.name.clone());
        }
        bundle.insert(entry);
    }

    let removed: BTreeSet<String> = previous
        .names()
        .filter(|n| bundle.get(n).is_none())
        .map(ToString::to_string)
        .collect();
    for name in &removed {
        info!("[certificates] Removing certificate {} of a departed host", name);
        bundle.remove(name);
    }

    Ok(BundleChange {
        bundle,
        regenerated,
        removed,
        ca_rotated,
    })
}

/// Generate a complete bundle for a first install
///
/// # Errors
///
/// Returns a `PkiError` if any key or certificate cannot be generated.
pub fn generate(spec: &ClusterSpec, options: &PkiOptions) -> Result<CertBundle> {
    Ok(build(spec, &CertBundle::default(), options, false, &|_| false)?.bundle)
}

/// Bring `previous` in line with `spec`, reusing whatever still fits
///
/// # Errors
///
/// Returns a `PkiError` if a leaf has to be regenerated and signing fails.
pub fn reconcile(spec: &ClusterSpec, previous: &CertBundle, options: &PkiOptions) -> Result<BundleChange> {
    build(spec, previous, options, false, &|_| false)
}

/// Regenerate the leaves owned by `services` (all when empty) with fresh keys
///
/// With `rotate_ca` a new CA is generated and every leaf is re-issued.
///
/// # Errors
///
/// Returns `PkiError::Invalid` for unknown service names.
pub fn rotate(
    spec: &ClusterSpec,
    previous: &CertBundle,
    services: &[String],
    rotate_ca: bool,
    options: &PkiOptions,
) -> Result<BundleChange> {
    if let Some(unknown) = services.iter().find(|s| !names::ROTATABLE_SERVICES.contains(&s.as_str())) {
        return Err(crate::error::PkiError::Invalid(format!(
            "unknown service {unknown}, expected one of {}",
            names::ROTATABLE_SERVICES.join(", ")
        )));
    }
    let all_services = services.is_empty();
    build(spec, previous, options, rotate_ca, &|name: &str| {
        if all_services {
            !names::is_ca(name) && name != SERVICE_ACCOUNT_TOKEN_KEY_NAME
        } else {
            services.iter().any(|s| names::service_owns(s, name))
        }
    })
}
