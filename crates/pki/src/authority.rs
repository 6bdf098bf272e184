//! Key generation and certificate signing
//!
//! A `CertificateAuthority` keeps its key as PEM and re-parses it on every
//! signature, since `rcgen::KeyPair` is not `Clone`.

use crate::error::{PkiError, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256, PKCS_RSA_SHA256, RsaKeySize, SanType,
    string::Ia5String,
};
use std::fmt;
use std::str::FromStr;

/// Validity of CA certificates
pub const CA_VALIDITY_YEARS: i64 = 10;
/// Validity of leaf certificates
pub const CERT_VALIDITY_YEARS: i64 = 10;

/// Private key algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyAlgorithm {
    /// RSA 2048-bit
    #[default]
    Rsa2048,
    /// RSA 4096-bit
    Rsa4096,
    /// ECDSA on P-256
    EcdsaP256,
}

impl FromStr for KeyAlgorithm {
    type Err = PkiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rsa2048" | "rsa-2048" => Ok(Self::Rsa2048),
            "rsa4096" | "rsa-4096" => Ok(Self::Rsa4096),
            "ecdsa-p256" | "ecdsap256" | "p256" => Ok(Self::EcdsaP256),
            other => Err(PkiError::Invalid(format!("unknown key algorithm {other}"))),
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rsa2048 => "rsa2048",
            Self::Rsa4096 => "rsa4096",
            Self::EcdsaP256 => "ecdsa-p256",
        })
    }
}

/// Key algorithms used for the CA and for leaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PkiOptions {
    /// CA key algorithm
    pub ca_algorithm: KeyAlgorithm,
    /// Leaf key algorithm
    pub leaf_algorithm: KeyAlgorithm,
}

impl Default for PkiOptions {
    fn default() -> Self {
        Self {
            ca_algorithm: KeyAlgorithm::Rsa4096,
            leaf_algorithm: KeyAlgorithm::Rsa2048,
        }
    }
}

/// Generate a fresh key pair
///
/// # Errors
///
/// Returns `PkiError::KeyGeneration` if the crypto backend fails.
pub fn generate_key(algorithm: KeyAlgorithm) -> Result<KeyPair> {
    let generated = match algorithm {
        KeyAlgorithm::Rsa2048 => KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_2048),
        KeyAlgorithm::Rsa4096 => KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_4096),
        KeyAlgorithm::EcdsaP256 => KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256),
    };
    generated.map_err(|e| PkiError::KeyGeneration(format!("{algorithm}: {e}")))
}

/// Parse a PEM private key
///
/// # Errors
///
/// Returns `PkiError::Parse` for malformed keys.
pub fn load_key(key_pem: &str) -> Result<KeyPair> {
    KeyPair::from_pem(key_pem).map_err(|e| PkiError::Parse(format!("failed to parse private key: {e}")))
}

fn compute_validity(years: i64) -> (time::OffsetDateTime, time::OffsetDateTime) {
    let now = time::OffsetDateTime::now_utc();
    (now, now + time::Duration::days(years * 365))
}

/// Convert SAN strings into rcgen SANs; IPs become IP SANs
///
/// # Errors
///
/// Returns `PkiError::Generation` for names that are not valid IA5 strings.
pub fn san_types(name: &str, sans: &[String]) -> Result<Vec<SanType>> {
    sans.iter()
        .map(|san| {
            if let Ok(ip) = san.parse::<std::net::IpAddr>() {
                Ok(SanType::IpAddress(ip))
            } else {
                Ia5String::try_from(san.clone())
                    .map(SanType::DnsName)
                    .map_err(|e| PkiError::Generation {
                        name: name.to_string(),
                        reason: format!("invalid DNS name '{san}': {e}"),
                    })
            }
        })
        .collect()
}

/// Subject and extensions of one leaf
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeafProfile {
    /// Subject common name
    pub common_name: String,
    /// Subject organization, may be empty
    pub organization: String,
    /// DNS names and IP addresses
    pub sans: Vec<String>,
    /// Usable as a TLS server certificate
    pub server: bool,
    /// Usable as a TLS client certificate
    pub client: bool,
}

/// A CA certificate and its key
#[derive(Clone)]
pub struct CertificateAuthority {
    name: String,
    cert_pem: String,
    key_pem: String,
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority").field("name", &self.name).finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Create a self-signed CA
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or self-signing fails.
    pub fn generate(name: &str, common_name: &str, algorithm: KeyAlgorithm) -> Result<Self> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key = generate_key(algorithm)?;
        let cert = params.self_signed(&key).map_err(|e| PkiError::Generation {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            name: name.to_string(),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    /// Load a CA from PEM
    ///
    /// # Errors
    ///
    /// Returns `PkiError::Parse` if either PEM is malformed.
    pub fn from_pem(name: &str, cert_pem: &str, key_pem: &str) -> Result<Self> {
        load_key(key_pem)?;
        crate::verify::parse_pem(cert_pem)?;
        Ok(Self {
            name: name.to_string(),
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
        })
    }

    /// Bundle entry name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// CA certificate
    #[must_use]
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// CA key
    #[must_use]
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Sign a leaf for `key` with the given profile, returning the certificate PEM
    ///
    /// # Errors
    ///
    /// Returns `PkiError::Generation` if the SANs are invalid or signing fails.
    pub fn sign(&self, name: &str, profile: &LeafProfile, key: &KeyPair) -> Result<String> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, profile.common_name.as_str());
        if !profile.organization.is_empty() {
            dn.push(DnType::OrganizationName, profile.organization.as_str());
        }
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        if profile.server {
            params.extended_key_usages.push(ExtendedKeyUsagePurpose::ServerAuth);
        }
        if profile.client {
            params.extended_key_usages.push(ExtendedKeyUsagePurpose::ClientAuth);
        }
        let (not_before, not_after) = compute_validity(CERT_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;
        params.subject_alt_names = san_types(name, &profile.sans)?;

        let ca_key = load_key(&self.key_pem)?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)
            .map_err(|e| PkiError::Parse(format!("failed to load issuer {}: {e}", self.name)))?;
        let cert = params.signed_by(key, &issuer).map_err(|e| PkiError::Generation {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(cert.pem())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_algorithm_parses_settings() {
        assert_eq!("rsa4096".parse::<KeyAlgorithm>().unwrap(), KeyAlgorithm::Rsa4096);
        assert_eq!("ECDSA-P256".parse::<KeyAlgorithm>().unwrap(), KeyAlgorithm::EcdsaP256);
        assert!("dsa".parse::<KeyAlgorithm>().is_err());
    }

    #[test]
    fn test_signed_leaf_verifies_against_ca() {
        let ca = CertificateAuthority::generate("kube-ca", "kube-ca", KeyAlgorithm::EcdsaP256).unwrap();
        let key = generate_key(KeyAlgorithm::EcdsaP256).unwrap();
        let profile = LeafProfile {
            common_name: "kube-apiserver".to_string(),
            sans: vec!["10.0.0.1".to_string(), "kubernetes".to_string()],
            server: true,
            client: true,
            ..Default::default()
        };
        let pem = ca.sign("kube-apiserver", &profile, &key).unwrap();
        crate::verify::verify_signed_by("kube-apiserver", &pem, ca.cert_pem()).unwrap();
    }

    #[test]
    fn test_invalid_dns_san_is_rejected() {
        let err = san_types("x", &["bad name ü".to_string()]).unwrap_err();
        assert!(matches!(err, PkiError::Generation { .. }));
    }
}
