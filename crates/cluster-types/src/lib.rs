//! Cluster Types
//!
//! The cluster file model (`ClusterSpec`), its defaults and validation, and
//! the persisted `ClusterState` written after each convergence.
//!
//! # Example
//!
//! ```no_run
//! use cluster_types::{defaults, validate, ClusterSpec};
//!
//! # fn example() -> Result<(), cluster_types::ConfigError> {
//! let mut spec = ClusterSpec::from_yaml(&std::fs::read_to_string("cluster.yml").unwrap_or_default())?;
//! defaults::apply(&mut spec);
//! validate(&spec)?;
//! # Ok(())
//! # }
//! ```

pub mod cloud;
pub mod cluster_spec;
pub mod defaults;
pub mod error;
pub mod network;
pub mod registry;
pub mod services;
pub mod state;
pub mod validation;

#[cfg(test)]
mod validation_test;

pub use cloud::*;
pub use cluster_spec::*;
pub use error::ConfigError;
pub use network::*;
pub use registry::*;
pub use services::*;
pub use state::*;
pub use validation::validate;
