//! Certificate inspection and signature checks

use crate::error::{PkiError, Result};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;

/// Decode a PEM block to DER
///
/// # Errors
///
/// Returns `PkiError::Parse` for malformed PEM.
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let block = ::pem::parse(pem_data.as_bytes()).map_err(|e| PkiError::Parse(format!("failed to parse PEM: {e}")))?;
    Ok(block.contents().to_vec())
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(|b| IpAddr::V4(Ipv4Addr::from(b))),
        16 => <[u8; 16]>::try_from(bytes).ok().map(|b| IpAddr::V6(Ipv6Addr::from(b))),
        _ => None,
    }
}

/// Subject alternative names of a certificate as strings
///
/// # Errors
///
/// Returns `PkiError::Parse` if the certificate cannot be decoded.
pub fn cert_sans(cert_pem: &str) -> Result<BTreeSet<String>> {
    let der = parse_pem(cert_pem)?;
    let (_, cert) =
        X509Certificate::from_der(&der).map_err(|e| PkiError::Parse(format!("failed to parse certificate: {e}")))?;
    let mut sans = BTreeSet::new();
    if let Ok(Some(ext)) = cert.subject_alternative_name() {
        for name in &ext.value.general_names {
            match name {
                GeneralName::DNSName(dns) => {
                    sans.insert((*dns).to_string());
                }
                GeneralName::IPAddress(bytes) => {
                    if let Some(ip) = ip_from_bytes(bytes) {
                        sans.insert(ip.to_string());
                    }
                }
                _ => {}
            }
        }
    }
    Ok(sans)
}

/// Subject common name of a certificate
///
/// # Errors
///
/// Returns `PkiError::Parse` if the certificate cannot be decoded.
pub fn common_name(cert_pem: &str) -> Result<String> {
    let der = parse_pem(cert_pem)?;
    let (_, cert) =
        X509Certificate::from_der(&der).map_err(|e| PkiError::Parse(format!("failed to parse certificate: {e}")))?;
    Ok(cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string())
}

/// Check that `cert_pem` is signed by `ca_pem` and is currently valid
///
/// # Errors
///
/// Returns `PkiError::Verify` naming the entry when the signature or
/// validity check fails.
pub fn verify_signed_by(name: &str, cert_pem: &str, ca_pem: &str) -> Result<()> {
    let failed = |reason: String| PkiError::Verify {
        name: name.to_string(),
        reason,
    };
    let ca_der = parse_pem(ca_pem)?;
    let (_, ca) = X509Certificate::from_der(&ca_der).map_err(|e| failed(format!("bad CA certificate: {e}")))?;
    let der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der).map_err(|e| failed(format!("bad certificate: {e}")))?;

    cert.verify_signature(Some(ca.public_key()))
        .map_err(|e| failed(format!("signature verification failed: {e}")))?;
    if !cert.validity().is_valid() {
        return Err(failed("certificate is expired or not yet valid".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{CertificateAuthority, KeyAlgorithm, LeafProfile, generate_key};

    #[test]
    fn test_leaf_from_other_ca_fails() {
        let ca = CertificateAuthority::generate("kube-ca", "kube-ca", KeyAlgorithm::EcdsaP256).unwrap();
        let other = CertificateAuthority::generate("other", "other", KeyAlgorithm::EcdsaP256).unwrap();
        let key = generate_key(KeyAlgorithm::EcdsaP256).unwrap();
        let profile = LeafProfile {
            common_name: "system:kube-proxy".to_string(),
            client: true,
            ..Default::default()
        };
        let pem = other.sign("kube-proxy", &profile, &key).unwrap();
        let err = verify_signed_by("kube-proxy", &pem, ca.cert_pem()).unwrap_err();
        assert!(matches!(err, PkiError::Verify { .. }));
    }

    #[test]
    fn test_sans_and_common_name_read_back() {
        let ca = CertificateAuthority::generate("kube-ca", "kube-ca", KeyAlgorithm::EcdsaP256).unwrap();
        let key = generate_key(KeyAlgorithm::EcdsaP256).unwrap();
        let profile = LeafProfile {
            common_name: "kube-etcd".to_string(),
            sans: vec!["10.0.0.1".to_string(), "localhost".to_string()],
            server: true,
            client: true,
            ..Default::default()
        };
        let pem = ca.sign("kube-etcd-10-0-0-1", &profile, &key).unwrap();
        let sans = cert_sans(&pem).unwrap();
        assert!(sans.contains("10.0.0.1"));
        assert!(sans.contains("localhost"));
        assert_eq!(common_name(&pem).unwrap(), "kube-etcd");
    }

    #[test]
    fn test_garbage_pem_is_a_parse_error() {
        assert!(matches!(parse_pem("not pem"), Err(PkiError::Parse(_))));
    }
}
