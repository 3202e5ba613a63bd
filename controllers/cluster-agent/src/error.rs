//! Controller-specific error types.
//!
//! This module defines error types specific to the cluster agent that are not
//! covered by upstream library errors.

use cluster_client::ClusterError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the cluster agent.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes client construction error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Cluster API error
    #[error("Cluster API error: {0}")]
    Cluster(#[from] ClusterError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// API server unreachable during discovery
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// A watch for this kind already exists
    #[error("Resource {0} is already being watched")]
    AlreadyWatched(String),

    /// No watch exists for this kind
    #[error("Resource {0} is not being watched")]
    NotWatched(String),

    /// The service account may not list/watch this kind
    #[error("Watch permission denied for {kind}: {reason}")]
    WatchPermissionDenied {
        /// Kind key
        kind: String,
        /// Server message
        reason: String,
    },

    /// Resource watch failed
    #[error("Resource watch failed for {kind}: {reason}")]
    Watch {
        /// Kind key
        kind: String,
        /// Failure reason
        reason: String,
    },

    /// Object could not be decoded
    #[error("Malformed object: {0}")]
    MalformedObject(String),

    /// A single reconcile action failed
    #[error("Reconcile action failed for {target}: {reason}")]
    ReconcileActionFailed {
        /// kind/namespace/name of the entry
        target: String,
        /// Failure reason
        reason: String,
    },

    /// Config export I/O failure
    #[error("Export failed: {0}")]
    Export(#[from] std::io::Error),

    /// YAML encoding failure
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON encoding failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Metrics registry failure
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Status server could not bind or serve
    #[error("Status server error: {0}")]
    StatusServer(String),

    /// Operation interrupted by shutdown
    #[error("Shutting down")]
    Shutdown,
}
