//! Pod to workload resolution.
//!
//! Follows the first owner reference of a Pod through the store
//! (Pod → ReplicaSet → Deployment, Pod → Job → CronJob, ...) until an
//! object without owners is reached. Results are memoized per Pod and
//! evicted when the Pod is deleted.

use crate::error::ControllerError;
use crate::handlers::KindHandler;
use crate::store::Store;
use cluster_client::{ObjectRef, ResourceKindDescriptor, kind_key};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Pod;
use kube::core::DynamicObject;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

const POD_KIND_KEY: &str = "Pod";

// Owner chains in practice are at most three deep (Pod, ReplicaSet, Deployment)
const MAX_OWNER_DEPTH: usize = 8;

/// The workload controlling a Pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl WorkloadRef {
    fn pod(namespace: &str, name: &str) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn kind_key(&self) -> String {
        // apiVersion is `group/version` or just `version` for the core group
        let group = self.api_version.rsplit_once('/').map_or("", |(group, _)| group);
        kind_key(group, &self.kind)
    }
}

/// Memoizing Pod → controlling workload resolver
#[derive(Debug)]
pub struct OwnerCache {
    store: Arc<Store>,
    resolved: DashMap<ObjectRef, WorkloadRef>,
}

impl OwnerCache {
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            resolved: DashMap::new(),
        }
    }

    /// Top-most controller of the Pod, or `None` when the Pod is not stored
    ///
    /// A Pod without owners resolves to itself. If an owner along the chain
    /// is not (yet) in the store, the walk stops at that owner and the result
    /// is not memoized.
    #[must_use]
    pub fn controller_for_pod(&self, namespace: &str, pod: &str) -> Option<WorkloadRef> {
        let key = ObjectRef::new(namespace, pod);
        if let Some(hit) = self.resolved.get(&key) {
            return Some(hit.clone());
        }

        let stored: Pod = match self.store.get_typed(POD_KIND_KEY, namespace, pod) {
            Ok(found) => found?,
            Err(e) => {
                debug!(namespace, pod, error = %e, "Stored Pod does not decode");
                return None;
            }
        };
        let mut current = WorkloadRef::pod(namespace, pod);
        let mut next = stored.metadata.owner_references.and_then(|owners| owners.into_iter().next());
        let mut complete = false;
        for _ in 0..MAX_OWNER_DEPTH {
            let Some(owner) = next.take() else {
                complete = true;
                break;
            };
            current = WorkloadRef {
                api_version: owner.api_version,
                kind: owner.kind,
                namespace: namespace.to_string(),
                name: owner.name,
            };
            let Some(obj) = self.store.get(&current.kind_key(), namespace, &current.name) else {
                debug!(namespace, pod, owner = %current.name, "Owner not in store, stopping walk");
                break;
            };
            next = first_owner(&obj).cloned();
        }

        if complete {
            self.resolved.insert(key, current.clone());
        }
        Some(current)
    }

    /// Number of memoized Pods
    #[must_use]
    pub fn resolved_count(&self) -> usize {
        self.resolved.len()
    }
}

fn first_owner(obj: &DynamicObject) -> Option<&k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference> {
    obj.metadata.owner_references.as_ref()?.first()
}

impl KindHandler for OwnerCache {
    fn name(&self) -> &'static str {
        "owner-cache"
    }

    fn on_apply(&self, _kind: &ResourceKindDescriptor, _obj: &DynamicObject) -> Result<(), ControllerError> {
        Ok(())
    }

    fn on_delete(&self, _kind: &ResourceKindDescriptor, obj: &DynamicObject) -> Result<(), ControllerError> {
        if let Some(key) = ObjectRef::from_object(obj) {
            self.resolved.remove(&key);
        }
        Ok(())
    }

    fn on_resync(&self, _kind: &ResourceKindDescriptor, live: &HashSet<ObjectRef>) -> Result<(), ControllerError> {
        self.resolved.retain(|key, _| live.contains(key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_client::dynamic_object;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use serde_json::json;

    fn pods() -> ResourceKindDescriptor {
        ResourceKindDescriptor::new("", "v1", "Pod", "pods", true)
    }

    fn replica_sets() -> ResourceKindDescriptor {
        ResourceKindDescriptor::new("apps", "v1", "ReplicaSet", "replicasets", true)
    }

    fn deployments() -> ResourceKindDescriptor {
        ResourceKindDescriptor::new("apps", "v1", "Deployment", "deployments", true)
    }

    fn owned(kind: &ResourceKindDescriptor, name: &str, owner: Option<(&str, &str, &str)>) -> DynamicObject {
        let mut obj = dynamic_object(kind, Some("shop"), name, "1", json!({}));
        obj.metadata.owner_references = owner.map(|(api_version, kind, name)| {
            vec![OwnerReference {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
                name: name.to_string(),
                uid: format!("{name}-uid"),
                controller: Some(true),
                ..Default::default()
            }]
        });
        obj
    }

    fn put(store: &Store, kind: &ResourceKindDescriptor, obj: DynamicObject) {
        let name = obj.metadata.name.clone().unwrap();
        store.set(&kind.kind_key(), "shop", &name, obj);
    }

    #[test]
    fn test_pod_resolves_to_deployment() {
        let store = Arc::new(Store::new());
        put(&store, &pods(), owned(&pods(), "web-5d4f-x2x7q", Some(("apps/v1", "ReplicaSet", "web-5d4f"))));
        put(&store, &replica_sets(), owned(&replica_sets(), "web-5d4f", Some(("apps/v1", "Deployment", "web"))));
        put(&store, &deployments(), owned(&deployments(), "web", None));

        let cache = OwnerCache::new(Arc::clone(&store));
        let workload = cache.controller_for_pod("shop", "web-5d4f-x2x7q").unwrap();
        assert_eq!(workload.kind, "Deployment");
        assert_eq!(workload.name, "web");
        assert_eq!(workload.api_version, "apps/v1");
        assert_eq!(cache.resolved_count(), 1);
    }

    #[test]
    fn test_unowned_pod_resolves_to_itself() {
        let store = Arc::new(Store::new());
        put(&store, &pods(), owned(&pods(), "debug", None));

        let cache = OwnerCache::new(store);
        let workload = cache.controller_for_pod("shop", "debug").unwrap();
        assert_eq!(workload.kind, "Pod");
        assert_eq!(workload.name, "debug");
        assert!(cache.controller_for_pod("shop", "missing").is_none());
    }

    #[test]
    fn test_missing_owner_is_not_memoized() {
        let store = Arc::new(Store::new());
        put(&store, &pods(), owned(&pods(), "web-5d4f-x2x7q", Some(("apps/v1", "ReplicaSet", "web-5d4f"))));

        let cache = OwnerCache::new(Arc::clone(&store));
        assert_eq!(cache.controller_for_pod("shop", "web-5d4f-x2x7q").unwrap().kind, "ReplicaSet");
        assert_eq!(cache.resolved_count(), 0);

        // The ReplicaSet shows up later
        put(&store, &replica_sets(), owned(&replica_sets(), "web-5d4f", Some(("apps/v1", "Deployment", "web"))));
        put(&store, &deployments(), owned(&deployments(), "web", None));
        assert_eq!(cache.controller_for_pod("shop", "web-5d4f-x2x7q").unwrap().kind, "Deployment");
    }

    #[test]
    fn test_pod_delete_evicts() {
        let store = Arc::new(Store::new());
        let pod = owned(&pods(), "debug", None);
        put(&store, &pods(), pod.clone());

        let cache = OwnerCache::new(store);
        cache.controller_for_pod("shop", "debug").unwrap();
        assert_eq!(cache.resolved_count(), 1);

        cache.on_delete(&pods(), &pod).unwrap();
        assert_eq!(cache.resolved_count(), 0);

        cache.controller_for_pod("shop", "debug").unwrap();
        cache.on_resync(&pods(), &HashSet::new()).unwrap();
        assert_eq!(cache.resolved_count(), 0);
    }
}
