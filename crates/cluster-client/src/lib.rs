//! Cluster API Client
//!
//! The Kubernetes access layer used by the cluster agent: resource discovery,
//! dynamic cluster-wide watches, lease compare-and-swap for leader election
//! and the RBAC writes issued by the reconciler.
//!
//! # Example
//!
//! ```no_run
//! use cluster_client::{ClusterClientTrait, KubeClusterClient};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = KubeClusterClient::try_default().await?;
//!
//! // Resource kinds of the core group
//! let kinds = client.discover_group("").await?;
//! let config_maps = kinds
//!     .iter()
//!     .find(|k| k.kind_key() == "ConfigMap")
//!     .ok_or("ConfigMap not served")?;
//!
//! // Stream events for it
//! let mut events = client.watch(config_maps);
//! while let Some(event) = events.next().await {
//!     println!("{:?}", event?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Error classification**: transient vs. permission vs. malformed vs. conflict
//! - **Lease CAS**: create/replace guarded by resourceVersion
//! - **test-util**: in-memory `MockClusterClient` and `MockLeaseBackend`

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod cluster_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::{FIELD_MANAGER, KubeClusterClient};
pub use cluster_trait::{ClusterClientTrait, LeaseClientTrait, WatchStream};
pub use error::ClusterError;
pub use models::*;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockClusterClient, MockLeaseBackend, MockWatchStep, WatchSender, WriteHook, dynamic_object};
