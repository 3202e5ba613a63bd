//! Cluster API client errors
//!
//! Every failure coming back from the API server is folded into one of a
//! handful of categories so callers can decide between retrying, giving up
//! on a single kind, or skipping a single object.

use thiserror::Error;

/// Errors that can occur when talking to the cluster API
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Timeout, disconnect, stream end, 5xx, 410 Gone or throttling
    #[error("Transient API error: {0}")]
    Transient(String),

    /// 401/403 from the API server
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Object or resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency conflict (409 or resourceVersion mismatch)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Object could not be decoded or lacks required metadata
    #[error("Malformed object: {0}")]
    Malformed(String),

    /// Any other API error status
    #[error("Cluster API error ({code}): {message}")]
    Api {
        /// HTTP status code returned by the API server
        code: u16,
        /// Server-provided message
        message: String,
    },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClusterError {
    /// Map an HTTP status code returned by the API server to an error category
    #[must_use]
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            401 | 403 => Self::PermissionDenied(message),
            404 => Self::NotFound(message),
            409 => Self::Conflict(message),
            // 410: resourceVersion too old, a fresh list fixes it
            410 | 429 | 500..=599 => Self::Transient(message),
            _ => Self::Api { code, message },
        }
    }

    /// Whether retrying the same operation later may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether the service account lacks the rights for this operation
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }

    /// Whether this is an optimistic concurrency conflict
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Whether the target does not exist
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        let message = err.to_string();
        match &err {
            kube::Error::Api(status) => Self::from_status(status.code, message),
            kube::Error::SerdeError(_) => Self::Malformed(message),
            // Connection, TLS, timeout and body errors all heal on reconnect
            _ => Self::Transient(message),
        }
    }
}

impl From<kube_runtime::watcher::Error> for ClusterError {
    fn from(err: kube_runtime::watcher::Error) -> Self {
        use kube_runtime::watcher::Error as WatchError;

        let message = err.to_string();
        match err {
            WatchError::InitialListFailed(inner)
            | WatchError::WatchStartFailed(inner)
            | WatchError::WatchFailed(inner) => match Self::from(inner) {
                Self::Transient(_) => Self::Transient(message),
                Self::PermissionDenied(_) => Self::PermissionDenied(message),
                Self::Malformed(_) => Self::Malformed(message),
                other => other,
            },
            WatchError::WatchError(status) => Self::from_status(status.code, message),
            _ => Self::Transient(message),
        }
    }
}
