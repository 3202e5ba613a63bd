//! In-memory object store
//!
//! Caches the last observed state of every stored kind, partitioned per kind:
//! a `DashMap` from kind key to a per-kind `RwLock<BTreeMap>`. Writers to one
//! kind never block readers of another, and readers of a kind always see a
//! consistent snapshot of that kind (no cross-kind consistency).
//!
//! Entries are only written by the owning kind's watch task (through
//! `StoreSyncHandler`); everything else reads.

use cluster_client::ObjectRef;
use dashmap::DashMap;
use kube::core::DynamicObject;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

type Partition = Arc<RwLock<BTreeMap<ObjectRef, StoreEntry>>>;

/// A cached object and the resourceVersion it was observed at
#[derive(Debug, Clone)]
pub struct StoreEntry {
    /// Last observed snapshot
    pub object: Arc<DynamicObject>,
    /// `metadata.resourceVersion` of the snapshot
    pub resource_version: Option<String>,
}

/// Result of a `set` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// No previous entry
    Inserted,
    /// Previous entry replaced
    Updated,
    /// Rejected: strictly older numeric resourceVersion than the cached entry
    Stale,
}

/// Concurrent per-kind object cache
#[derive(Debug, Default)]
pub struct Store {
    kinds: DashMap<String, Partition>,
}

impl Store {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(&self, kind: &str) -> Option<Partition> {
        self.kinds.get(kind).map(|p| Arc::clone(p.value()))
    }

    fn partition_or_create(&self, kind: &str) -> Partition {
        Arc::clone(self.kinds.entry(kind.to_string()).or_default().value())
    }

    /// Insert or replace the object at (kind, namespace, name)
    ///
    /// Numeric resourceVersions older than the cached one are ignored so a
    /// late replay cannot roll an entry back. Non-numeric versions are taken
    /// in arrival order.
    pub fn set(&self, kind: &str, namespace: &str, name: &str, object: DynamicObject) -> SetOutcome {
        let key = ObjectRef::new(namespace, name);
        let resource_version = object.metadata.resource_version.clone();
        let partition = self.partition_or_create(kind);
        let mut objects = partition.write();

        let current_version = objects.get(&key).and_then(|e| e.resource_version.clone());
        if is_older(resource_version.as_deref(), current_version.as_deref()) {
            debug!(
                kind = %kind,
                object = %key,
                "Ignoring stale update (resourceVersion {:?} < {:?})",
                resource_version,
                current_version
            );
            return SetOutcome::Stale;
        }

        let entry = StoreEntry {
            object: Arc::new(object),
            resource_version,
        };
        match objects.insert(key, entry) {
            Some(_) => SetOutcome::Updated,
            None => SetOutcome::Inserted,
        }
    }

    /// Object at (kind, namespace, name); namespace is empty for cluster-scoped kinds
    #[must_use]
    pub fn get(&self, kind: &str, namespace: &str, name: &str) -> Option<Arc<DynamicObject>> {
        let partition = self.partition(kind)?;
        let objects = partition.read();
        objects
            .get(&ObjectRef::new(namespace, name))
            .map(|entry| Arc::clone(&entry.object))
    }

    /// Remove the object at (kind, namespace, name), returning the removed entry
    pub fn delete(&self, kind: &str, namespace: &str, name: &str) -> Option<StoreEntry> {
        let partition = self.partition(kind)?;
        let mut objects = partition.write();
        objects.remove(&ObjectRef::new(namespace, name))
    }

    /// All objects of `kind`, restricted to `namespace` when given
    ///
    /// Results are a snapshot taken under one read lock and are ordered by
    /// (namespace, name).
    #[must_use]
    pub fn search_by_prefix(&self, kind: &str, namespace: Option<&str>) -> Vec<Arc<DynamicObject>> {
        let Some(partition) = self.partition(kind) else {
            return Vec::new();
        };
        let objects = partition.read();
        match namespace {
            None => objects.values().map(|e| Arc::clone(&e.object)).collect(),
            Some(ns) => {
                let start = ObjectRef::new(ns, "");
                objects
                    .range(start..)
                    .take_while(|(key, _)| key.namespace == ns)
                    .map(|(_, e)| Arc::clone(&e.object))
                    .collect()
            }
        }
    }

    /// Object at (kind, namespace, name) decoded into a typed resource
    pub fn get_typed<T: DeserializeOwned>(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<T>, serde_json::Error> {
        self.get(kind, namespace, name)
            .map(|obj| decode(&obj))
            .transpose()
    }

    /// All objects of `kind` decoded into a typed resource
    ///
    /// Objects that fail to decode are skipped and returned as the second
    /// element so callers can report them.
    #[must_use]
    pub fn search_typed<T: DeserializeOwned>(&self, kind: &str, namespace: Option<&str>) -> (Vec<T>, Vec<String>) {
        let mut decoded = Vec::new();
        let mut failed = Vec::new();
        for obj in self.search_by_prefix(kind, namespace) {
            match decode(&obj) {
                Ok(value) => decoded.push(value),
                Err(e) => failed.push(format!(
                    "{}: {e}",
                    ObjectRef::from_object(&obj).map_or_else(|| "<unnamed>".to_string(), |r| r.to_string())
                )),
            }
        }
        (decoded, failed)
    }

    /// Keys of every cached object of `kind`
    #[must_use]
    pub fn keys(&self, kind: &str) -> HashSet<ObjectRef> {
        self.partition(kind)
            .map(|p| p.read().keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Kind keys with a partition
    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.kinds.iter().map(|e| e.key().clone()).collect();
        kinds.sort();
        kinds
    }

    /// Number of cached objects of `kind`
    #[must_use]
    pub fn len(&self, kind: &str) -> usize {
        self.partition(kind).map_or(0, |p| p.read().len())
    }

    /// Drop every cached object
    pub fn clear(&self) {
        self.kinds.clear();
    }
}

pub(crate) fn decode<T: DeserializeOwned>(obj: &DynamicObject) -> Result<T, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(obj)?)
}

/// Whether `candidate` is strictly older than `current`, when both are numeric
fn is_older(candidate: Option<&str>, current: Option<&str>) -> bool {
    match (
        candidate.and_then(|v| v.parse::<u64>().ok()),
        current.and_then(|v| v.parse::<u64>().ok()),
    ) {
        (Some(candidate), Some(current)) => candidate < current,
        _ => false,
    }
}
