//! Datastore Client
//!
//! Talks to the cluster's etcd ensemble: membership changes, key reads and
//! writes over gRPC, health probes over HTTPS, plus the quorum arithmetic and
//! snapshot bookkeeping the coordinator builds on.
//!
//! # Example
//!
//! ```no_run
//! use datastore_client::{EtcdClientFactory, EtcdConnector};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), datastore_client::DatastoreError> {
//! let factory = EtcdClientFactory::new(None, Duration::from_secs(5))?;
//! let etcd = factory.connect(&["https://10.0.0.1:2379".to_string()]).await?;
//! for member in etcd.member_list().await? {
//!     println!("{} {:?}", member.name, member.peer_urls);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
#[path = "trait.rs"]
pub mod datastore_trait;
pub mod ensemble;
pub mod error;
pub mod models;
pub mod snapshot;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::{EtcdClient, EtcdClientFactory, EtcdTls};
pub use datastore_trait::{EtcdClusterApi, EtcdConnector};
pub use ensemble::{EnsembleState, assess, quorum, removal_keeps_quorum};
pub use error::DatastoreError;
pub use models::*;
#[cfg(feature = "test-util")]
pub use mock::MockEtcd;
