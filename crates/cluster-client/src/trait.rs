//! Cluster client traits for mocking
//!
//! These traits abstract the Kubernetes API so the agent's watcher, leader
//! elector and reconciler can be unit tested against in-memory fakes.
//! `KubeClusterClient` implements both; tests use `MockClusterClient` and
//! `MockLeaseBackend` from the `test-util` feature.

use crate::error::ClusterError;
use crate::models::{LeaseRecord, LeaseSpecRecord, ResourceKindDescriptor, WatchEvent};
use futures::stream::BoxStream;
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::core::DynamicObject;

/// Stream of events for one watched kind
pub type WatchStream = BoxStream<'static, Result<WatchEvent, ClusterError>>;

/// Trait for cluster API operations used by the agent
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ClusterClientTrait: Send + Sync {
    /// Names of every API group served, the core group (`""`) first
    async fn list_api_groups(&self) -> Result<Vec<String>, ClusterError>;

    /// Resource kinds of one API group at its preferred version
    async fn discover_group(&self, group: &str) -> Result<Vec<ResourceKindDescriptor>, ClusterError>;

    /// Open a cluster-wide list+watch for `kind`
    ///
    /// The stream starts with a full list (`Init` .. `InitDone`). It ends or
    /// yields an error when the connection breaks; callers reopen it.
    fn watch(&self, kind: &ResourceKindDescriptor) -> WatchStream;

    /// Fetch a single object, `Ok(None)` when it does not exist
    async fn get_object(
        &self,
        kind: &ResourceKindDescriptor,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, ClusterError>;

    /// List every object of `kind` across all namespaces
    async fn list_objects(&self, kind: &ResourceKindDescriptor) -> Result<Vec<DynamicObject>, ClusterError>;

    /// Create or update a RoleBinding (server-side apply)
    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<(), ClusterError>;

    /// Delete a RoleBinding; deleting a missing binding succeeds
    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// Delete a ClusterRoleBinding; deleting a missing binding succeeds
    async fn delete_cluster_role_binding(&self, name: &str) -> Result<(), ClusterError>;
}

/// Trait for the coordination lease used by leader election
///
/// Writes are compare-and-swap: `create_lease` fails with
/// [`ClusterError::Conflict`] if the lease already exists and
/// `replace_lease` fails with [`ClusterError::Conflict`] when the stored
/// resourceVersion no longer matches.
#[async_trait::async_trait]
pub trait LeaseClientTrait: Send + Sync {
    /// Read the lease, `Ok(None)` if it does not exist
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<LeaseRecord>, ClusterError>;

    /// Create the lease
    async fn create_lease(
        &self,
        namespace: &str,
        name: &str,
        spec: &LeaseSpecRecord,
    ) -> Result<LeaseRecord, ClusterError>;

    /// Replace the lease if it is still at `resource_version`
    async fn replace_lease(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        spec: &LeaseSpecRecord,
    ) -> Result<LeaseRecord, ClusterError>;
}
