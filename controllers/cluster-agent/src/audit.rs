//! Bounded audit log of Pod events
//!
//! Keeps the most recent events per `namespace-controller` key, where the
//! controller name is the pod name without its generated suffixes. When a key
//! reaches capacity the oldest record is evicted. Events are deduplicated by
//! uid so redelivery after a resync does not create duplicates.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Event;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

/// One recorded event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// Event uid
    pub uid: String,
    /// Kind of the involved object
    pub involved_kind: String,
    /// Namespace of the involved object
    pub namespace: String,
    /// Name of the involved object
    pub name: String,
    /// Short machine-readable reason
    pub reason: String,
    /// Human-readable message
    pub message: String,
    /// `Normal` or `Warning`
    pub event_type: String,
    /// Occurrence count
    pub count: i32,
    /// When the agent recorded the event
    pub observed_at: DateTime<Utc>,
}

/// Per-controller bounded event history
#[derive(Debug)]
pub struct AuditLog {
    capacity: usize,
    ignored_namespaces: Vec<String>,
    entries: DashMap<String, Mutex<VecDeque<AuditRecord>>>,
}

/// Controller name for a pod: the pod name without its last two dash-separated
/// segments (`web-5d4f8b7c9-x2x7q` becomes `web`). Names with fewer segments
/// are returned unchanged.
#[must_use]
pub fn controller_name_for_pod(pod_name: &str) -> String {
    let parts: Vec<&str> = pod_name.split('-').collect();
    if parts.len() > 2 {
        parts[..parts.len() - 2].join("-")
    } else {
        pod_name.to_string()
    }
}

impl AuditLog {
    /// Create an audit log keeping at most `capacity` records per key
    #[must_use]
    pub fn new(capacity: usize, ignored_namespaces: Vec<String>) -> Self {
        Self {
            capacity: capacity.max(1),
            ignored_namespaces,
            entries: DashMap::new(),
        }
    }

    /// Record a Kubernetes event if it concerns a Pod outside the ignored
    /// namespaces. Returns whether the event was appended.
    pub fn record_event(&self, event: &Event) -> bool {
        let involved = &event.involved_object;
        if involved.kind.as_deref() != Some("Pod") {
            return false;
        }
        let namespace = involved.namespace.clone().unwrap_or_default();
        if self.ignored_namespaces.iter().any(|ns| *ns == namespace) {
            return false;
        }
        let Some(pod_name) = involved.name.clone() else {
            return false;
        };
        let Some(uid) = event.metadata.uid.clone() else {
            return false;
        };

        let key = format!("{namespace}-{}", controller_name_for_pod(&pod_name));
        let record = AuditRecord {
            uid,
            involved_kind: "Pod".to_string(),
            namespace,
            name: pod_name,
            reason: event.reason.clone().unwrap_or_default(),
            message: event.message.clone().unwrap_or_default(),
            event_type: event.type_.clone().unwrap_or_default(),
            count: event.count.unwrap_or(1),
            observed_at: Utc::now(),
        };
        self.push(&key, record)
    }

    /// Append a record under `key`, evicting the oldest when full.
    /// Records whose uid is already present are ignored.
    pub fn push(&self, key: &str, record: AuditRecord) -> bool {
        let entry = self.entries.entry(key.to_string()).or_default();
        let mut records = entry.value().lock();
        if records.iter().any(|r| r.uid == record.uid) {
            return false;
        }
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
        true
    }

    /// Records for `key`, oldest first
    #[must_use]
    pub fn records(&self, key: &str) -> Vec<AuditRecord> {
        self.entries
            .get(key)
            .map(|records| records.value().lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Records for a pod's controller
    #[must_use]
    pub fn records_for_controller(&self, namespace: &str, controller: &str) -> Vec<AuditRecord> {
        self.records(&format!("{namespace}-{controller}"))
    }

    /// All keys with at least one record
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ObjectReference;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod_event(uid: &str, namespace: &str, pod: &str, reason: &str) -> Event {
        Event {
            metadata: ObjectMeta {
                name: Some(format!("{pod}.{uid}")),
                namespace: Some(namespace.to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                kind: Some("Pod".to_string()),
                name: Some(pod.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            reason: Some(reason.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_controller_name_for_pod() {
        assert_eq!(controller_name_for_pod("web-5d4f8b7c9-x2x7q"), "web");
        assert_eq!(controller_name_for_pod("api-gateway-5d4f8b7c9-x2x7q"), "api-gateway");
        assert_eq!(controller_name_for_pod("standalone"), "standalone");
        assert_eq!(controller_name_for_pod("db-0"), "db-0");
    }

    #[test]
    fn test_fifo_eviction() {
        let log = AuditLog::new(3, vec![]);
        for i in 0..5 {
            assert!(log.record_event(&pod_event(&format!("uid-{i}"), "apps", "web-abc-123", &format!("r{i}"))));
        }

        let reasons: Vec<String> = log
            .records_for_controller("apps", "web")
            .into_iter()
            .map(|r| r.reason)
            .collect();
        assert_eq!(reasons, vec!["r2", "r3", "r4"]);
    }

    #[test]
    fn test_duplicate_uid_is_ignored() {
        let log = AuditLog::new(10, vec![]);
        assert!(log.record_event(&pod_event("uid-1", "apps", "web-abc-123", "Pulled")));
        assert!(!log.record_event(&pod_event("uid-1", "apps", "web-abc-123", "Pulled")));
        assert_eq!(log.records("apps-web").len(), 1);
    }

    #[test]
    fn test_ignored_namespaces_and_kinds() {
        let log = AuditLog::new(10, vec!["kube-system".to_string()]);
        assert!(!log.record_event(&pod_event("uid-1", "kube-system", "coredns-abc-123", "Started")));

        let mut node_event = pod_event("uid-2", "apps", "node-1", "NodeReady");
        node_event.involved_object.kind = Some("Node".to_string());
        assert!(!log.record_event(&node_event));

        assert!(log.keys().is_empty());
    }
}
