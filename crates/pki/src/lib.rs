//! Cluster PKI
//!
//! Generates the certificate bundle a cluster needs from its cluster file,
//! keeps it in line with the file on later runs (reusing every leaf whose
//! SANs still cover the hosts), and rotates leaves or the CA on request.
//!
//! # Example
//!
//! ```no_run
//! use pki::{reconcile, CertBundle, PkiOptions};
//! use cluster_types::ClusterSpec;
//!
//! # fn example(spec: &ClusterSpec, stored: CertBundle) -> Result<(), pki::PkiError> {
//! let change = reconcile(spec, &stored, &PkiOptions::default())?;
//! for name in &change.regenerated {
//!     println!("re-issued {name}");
//! }
//! assert!(change.bundle.verify().is_empty());
//! # Ok(())
//! # }
//! ```

pub mod authority;
pub mod bundle;
pub mod error;
pub mod generate;
pub mod kubeconfig;
pub mod names;
pub mod reconcile;
pub mod verify;


pub use authority::{CertificateAuthority, KeyAlgorithm, PkiOptions};
pub use bundle::CertBundle;
pub use error::PkiError;
pub use reconcile::{BundleChange, generate, reconcile, rotate};
