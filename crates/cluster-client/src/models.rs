//! Cluster API data models
//!
//! Types exchanged between the agent and the API access layer.

use chrono::{DateTime, Utc};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};

/// Event emitted by a dynamic watch stream
///
/// `Init` / `InitApply` / `InitDone` bracket a full (re)list; `Apply` and
/// `Delete` follow for individual changes afterwards.
pub type WatchEvent = kube_runtime::watcher::Event<DynamicObject>;

/// Verb required for a kind to be listable
pub const VERB_LIST: &str = "list";
/// Verb required for a kind to be watchable
pub const VERB_WATCH: &str = "watch";

/// A resource kind served by the API server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceKindDescriptor {
    /// API group (empty for the core group)
    pub group: String,
    /// API version within the group
    pub version: String,
    /// Kind name, e.g. `Deployment`
    pub kind: String,
    /// Plural resource name used in URLs, e.g. `deployments`
    pub plural: String,
    /// Whether objects of this kind live in namespaces
    pub namespaced: bool,
    /// Verbs the API server advertises for this resource
    #[serde(default)]
    pub verbs: Vec<String>,
}

impl ResourceKindDescriptor {
    /// Build a descriptor advertising list and watch
    #[must_use]
    pub fn new(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            namespaced,
            verbs: vec![VERB_LIST.to_string(), VERB_WATCH.to_string()],
        }
    }

    /// `group/version`, or just `version` for the core group
    #[must_use]
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Stable key identifying this kind across versions: `Kind` for the core
    /// group, `Kind.group` otherwise.
    #[must_use]
    pub fn kind_key(&self) -> String {
        kind_key(&self.group, &self.kind)
    }

    /// Whether the server supports both list and watch for this kind
    #[must_use]
    pub fn is_watchable(&self) -> bool {
        self.supports(VERB_LIST) && self.supports(VERB_WATCH)
    }

    /// Whether the server advertises `verb` for this kind
    #[must_use]
    pub fn supports(&self, verb: &str) -> bool {
        self.verbs.iter().any(|v| v == verb)
    }

    /// Convert to the `kube` dynamic resource description
    #[must_use]
    pub fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(&self.group, &self.version, &self.kind);
        ApiResource::from_gvk_with_plural(&gvk, &self.plural)
    }
}

/// Key for a kind in a given group (see [`ResourceKindDescriptor::kind_key`])
#[must_use]
pub fn kind_key(group: &str, kind: &str) -> String {
    if group.is_empty() {
        kind.to_string()
    } else {
        format!("{kind}.{group}")
    }
}

/// The coordination lease fields used for leader election
///
/// Field names and encoding match `coordination.k8s.io/v1` `LeaseSpec`, so a
/// record converts to and from the API object through JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseSpecRecord {
    /// Identity of the current holder, `None` when released
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_identity: Option<String>,
    /// Lease TTL in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_duration_seconds: Option<i32>,
    /// When the current holder acquired the lease
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_time: Option<DateTime<Utc>>,
    /// Last renewal by the current holder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renew_time: Option<DateTime<Utc>>,
    /// Number of holder changes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_transitions: Option<i32>,
}

impl LeaseSpecRecord {
    /// Instant after which the lease may be taken over, if it is held
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let renew = self.renew_time?;
        let duration = self.lease_duration_seconds?;
        Some(renew + chrono::Duration::seconds(i64::from(duration)))
    }

    /// Whether the lease has no live holder at `now`
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match (&self.holder_identity, self.expires_at()) {
            (None, _) => true,
            (Some(holder), _) if holder.is_empty() => true,
            (Some(_), Some(expiry)) => now > expiry,
            (Some(_), None) => true,
        }
    }
}

/// A lease as read from the server, with the version used for compare-and-swap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Lease spec fields
    pub spec: LeaseSpecRecord,
    /// `metadata.resourceVersion` at read time
    pub resource_version: String,
}

/// Namespaced reference to an object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Namespace, empty for cluster-scoped objects
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectRef {
    /// Create a reference
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Reference to the object described by `obj`, or `None` when it has no name
    #[must_use]
    pub fn from_object(obj: &DynamicObject) -> Option<Self> {
        let name = obj.metadata.name.clone()?;
        if name.is_empty() {
            return None;
        }
        Some(Self {
            namespace: obj.metadata.namespace.clone().unwrap_or_default(),
            name,
        })
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Convert a typed API object (or CRD) into a `DynamicObject`
pub fn to_dynamic_object<K: Serialize>(obj: &K) -> Result<DynamicObject, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(obj)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_key_and_api_version() {
        let pod = ResourceKindDescriptor::new("", "v1", "Pod", "pods", true);
        assert_eq!(pod.kind_key(), "Pod");
        assert_eq!(pod.api_version(), "v1");

        let deploy = ResourceKindDescriptor::new("apps", "v1", "Deployment", "deployments", true);
        assert_eq!(deploy.kind_key(), "Deployment.apps");
        assert_eq!(deploy.api_version(), "apps/v1");
        assert_eq!(deploy.api_resource().plural, "deployments");
    }

    #[test]
    fn test_watchable_requires_list_and_watch() {
        let mut kind = ResourceKindDescriptor::new("", "v1", "Binding", "bindings", true);
        assert!(kind.is_watchable());

        kind.verbs = vec!["create".to_string()];
        assert!(!kind.is_watchable());

        kind.verbs = vec!["list".to_string()];
        assert!(!kind.is_watchable());
    }

    #[test]
    fn test_lease_expiry() {
        let now = Utc::now();
        let lease = LeaseSpecRecord {
            holder_identity: Some("a".to_string()),
            lease_duration_seconds: Some(15),
            renew_time: Some(now),
            ..Default::default()
        };
        assert!(!lease.is_expired_at(now + chrono::Duration::seconds(10)));
        assert!(lease.is_expired_at(now + chrono::Duration::seconds(16)));

        let released = LeaseSpecRecord {
            holder_identity: None,
            ..lease
        };
        assert!(released.is_expired_at(now));
    }

    #[test]
    fn test_lease_spec_uses_api_field_names() {
        let record = LeaseSpecRecord {
            holder_identity: Some("agent-0".to_string()),
            lease_duration_seconds: Some(15),
            ..Default::default()
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["holderIdentity"], "agent-0");
        assert_eq!(value["leaseDurationSeconds"], 15);
        assert!(value.get("renewTime").is_none());
    }
}
