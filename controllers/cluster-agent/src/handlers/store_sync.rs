//! Keeps the `Store` in step with watch events for the stored kinds.

use super::KindHandler;
use crate::error::ControllerError;
use crate::store::{SetOutcome, Store};
use cluster_client::{ObjectRef, ResourceKindDescriptor};
use kube::core::DynamicObject;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Writes applied objects into the store and removes deleted ones
#[derive(Debug)]
pub struct StoreSyncHandler {
    store: Arc<Store>,
    kinds: Vec<String>,
}

impl StoreSyncHandler {
    /// Handler storing the given kind keys (`*` stores everything)
    #[must_use]
    pub fn new(store: Arc<Store>, kinds: Vec<String>) -> Self {
        Self { store, kinds }
    }

    fn stores(&self, kind_key: &str) -> bool {
        self.kinds.iter().any(|k| k == "*" || k == kind_key)
    }
}

fn object_ref(obj: &DynamicObject) -> Result<ObjectRef, ControllerError> {
    ObjectRef::from_object(obj).ok_or_else(|| ControllerError::MalformedObject("object has no name".to_string()))
}

impl KindHandler for StoreSyncHandler {
    fn name(&self) -> &'static str {
        "store-sync"
    }

    fn on_apply(&self, kind: &ResourceKindDescriptor, obj: &DynamicObject) -> Result<(), ControllerError> {
        let kind_key = kind.kind_key();
        if !self.stores(&kind_key) {
            return Ok(());
        }
        let key = object_ref(obj)?;
        if self.store.set(&kind_key, &key.namespace, &key.name, obj.clone()) == SetOutcome::Stale {
            debug!("Skipped stale {} {}", kind_key, key);
        }
        Ok(())
    }

    fn on_delete(&self, kind: &ResourceKindDescriptor, obj: &DynamicObject) -> Result<(), ControllerError> {
        let kind_key = kind.kind_key();
        if !self.stores(&kind_key) {
            return Ok(());
        }
        let key = object_ref(obj)?;
        self.store.delete(&kind_key, &key.namespace, &key.name);
        Ok(())
    }

    fn on_resync(&self, kind: &ResourceKindDescriptor, live: &HashSet<ObjectRef>) -> Result<(), ControllerError> {
        let kind_key = kind.kind_key();
        if !self.stores(&kind_key) {
            return Ok(());
        }
        let mut pruned = 0;
        for key in self.store.keys(&kind_key) {
            if !live.contains(&key) {
                self.store.delete(&kind_key, &key.namespace, &key.name);
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!("Pruned {} {} objects missing after relist", pruned, kind_key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_client::dynamic_object;
    use serde_json::json;

    #[test]
    fn test_only_configured_kinds_are_stored() {
        let store = Arc::new(Store::new());
        let handler = StoreSyncHandler::new(Arc::clone(&store), vec!["Pod".to_string()]);
        let pods = ResourceKindDescriptor::new("", "v1", "Pod", "pods", true);
        let secrets = ResourceKindDescriptor::new("", "v1", "Secret", "secrets", true);

        handler
            .on_apply(&pods, &dynamic_object(&pods, Some("ns"), "p", "1", json!({})))
            .unwrap();
        handler
            .on_apply(&secrets, &dynamic_object(&secrets, Some("ns"), "s", "1", json!({})))
            .unwrap();

        assert!(store.get("Pod", "ns", "p").is_some());
        assert!(store.get("Secret", "ns", "s").is_none());
    }

    #[test]
    fn test_unnamed_object_is_malformed() {
        let store = Arc::new(Store::new());
        let handler = StoreSyncHandler::new(Arc::clone(&store), vec!["*".to_string()]);
        let pods = ResourceKindDescriptor::new("", "v1", "Pod", "pods", true);
        let mut pod = dynamic_object(&pods, Some("ns"), "p", "1", json!({}));
        pod.metadata.name = None;

        assert!(matches!(
            handler.on_apply(&pods, &pod),
            Err(ControllerError::MalformedObject(_))
        ));
        assert_eq!(store.len("Pod"), 0);
    }

    #[test]
    fn test_resync_prunes_objects_deleted_while_disconnected() {
        let store = Arc::new(Store::new());
        let handler = StoreSyncHandler::new(Arc::clone(&store), vec!["*".to_string()]);
        let cms = ResourceKindDescriptor::new("", "v1", "ConfigMap", "configmaps", true);
        for name in ["a", "b"] {
            handler
                .on_apply(&cms, &dynamic_object(&cms, Some("ns"), name, "1", json!({})))
                .unwrap();
        }

        let live: HashSet<ObjectRef> = [ObjectRef::new("ns", "a")].into_iter().collect();
        handler.on_resync(&cms, &live).unwrap();

        assert!(store.get("ConfigMap", "ns", "a").is_some());
        assert!(store.get("ConfigMap", "ns", "b").is_none());
    }
}
