//! Mock cluster client for unit testing
//!
//! `MockClusterClient` serves scripted discovery results, scripted or
//! channel-driven watch sessions, and records every RBAC write. Discovery
//! can fail as a whole or per API group.
//! `MockLeaseBackend` is an in-memory lease with compare-and-swap semantics
//! shared by any number of electors.

use crate::cluster_trait::{ClusterClientTrait, LeaseClientTrait, WatchStream};
use crate::error::ClusterError;
use crate::models::{LeaseRecord, LeaseSpecRecord, ResourceKindDescriptor, WatchEvent};
use futures::channel::mpsc;
use futures::{StreamExt, stream};
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::core::DynamicObject;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Sender half of a channel-driven watch session
pub type WatchSender = mpsc::UnboundedSender<Result<WatchEvent, ClusterError>>;

/// One step of a scripted watch session
#[derive(Debug)]
pub enum MockWatchStep {
    /// Yield an event
    Event(WatchEvent),
    /// Yield an error
    Error(ClusterError),
    /// Never yield again (an idle but healthy connection)
    Hang,
}

enum MockWatchSession {
    Scripted(Vec<MockWatchStep>),
    Channel(mpsc::UnboundedReceiver<Result<WatchEvent, ClusterError>>),
}

/// Callback run after each recorded RBAC write
pub type WriteHook = Arc<dyn Fn() + Send + Sync>;

/// Mock ClusterClient for testing
#[derive(Clone, Default)]
pub struct MockClusterClient {
    pub(crate) resources: Arc<Mutex<Vec<ResourceKindDescriptor>>>,
    pub(crate) discovery_failures: Arc<Mutex<u32>>,
    pub(crate) failing_groups: Arc<Mutex<HashSet<String>>>,
    watch_sessions: Arc<Mutex<HashMap<String, VecDeque<MockWatchSession>>>>,
    pub(crate) watch_calls: Arc<Mutex<HashMap<String, usize>>>,
    pub(crate) objects: Arc<Mutex<HashMap<String, Vec<DynamicObject>>>>,
    pub(crate) applied: Arc<Mutex<Vec<RoleBinding>>>,
    pub(crate) deleted_role_bindings: Arc<Mutex<Vec<(String, String)>>>,
    pub(crate) deleted_cluster_role_bindings: Arc<Mutex<Vec<String>>>,
    pub(crate) failing_bindings: Arc<Mutex<HashSet<String>>>,
    write_hook: Arc<Mutex<Option<WriteHook>>>,
}

impl std::fmt::Debug for MockClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClusterClient").finish_non_exhaustive()
    }
}

impl MockClusterClient {
    /// Create a new mock client
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a kind to the discovery result
    pub fn add_resource(&self, kind: ResourceKindDescriptor) {
        self.resources.lock().unwrap().push(kind);
    }

    /// Remove every version of `kind_key` from the discovery result
    pub fn remove_resource(&self, kind_key: &str) {
        self.resources.lock().unwrap().retain(|k| k.kind_key() != kind_key);
    }

    /// Make the next `count` group listings fail with a transient error
    pub fn fail_discovery(&self, count: u32) {
        *self.discovery_failures.lock().unwrap() = count;
    }

    /// Make discovery of API group `group` fail until healed
    pub fn fail_group(&self, group: &str) {
        self.failing_groups.lock().unwrap().insert(group.to_string());
    }

    /// Let discovery of API group `group` succeed again
    pub fn heal_group(&self, group: &str) {
        self.failing_groups.lock().unwrap().remove(group);
    }

    /// Queue a scripted session for the next `watch` call on `kind_key`
    pub fn push_watch_session(&self, kind_key: &str, steps: Vec<MockWatchStep>) {
        self.watch_sessions
            .lock()
            .unwrap()
            .entry(kind_key.to_string())
            .or_default()
            .push_back(MockWatchSession::Scripted(steps));
    }

    /// Queue a channel-driven session for the next `watch` call on `kind_key`
    pub fn open_watch_channel(&self, kind_key: &str) -> WatchSender {
        let (tx, rx) = mpsc::unbounded();
        self.watch_sessions
            .lock()
            .unwrap()
            .entry(kind_key.to_string())
            .or_default()
            .push_back(MockWatchSession::Channel(rx));
        tx
    }

    /// Number of watch streams opened for `kind_key`
    #[must_use]
    pub fn watch_calls(&self, kind_key: &str) -> usize {
        self.watch_calls.lock().unwrap().get(kind_key).copied().unwrap_or(0)
    }

    /// Objects returned by `list_objects` / `get_object` for `kind_key`
    pub fn set_objects(&self, kind_key: &str, objects: Vec<DynamicObject>) {
        self.objects.lock().unwrap().insert(kind_key.to_string(), objects);
    }

    /// Make applies of the RoleBinding `name` fail
    pub fn fail_binding(&self, name: &str) {
        self.failing_bindings.lock().unwrap().insert(name.to_string());
    }

    /// Let applies of the RoleBinding `name` succeed again
    pub fn heal_binding(&self, name: &str) {
        self.failing_bindings.lock().unwrap().remove(name);
    }

    /// Run `hook` after every successful write
    pub fn on_write(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.write_hook.lock().unwrap() = Some(Arc::new(hook));
    }

    fn after_write(&self) {
        let hook = self.write_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// RoleBindings applied so far
    #[must_use]
    pub fn applied_role_bindings(&self) -> Vec<RoleBinding> {
        self.applied.lock().unwrap().clone()
    }

    /// (namespace, name) of RoleBindings deleted so far
    #[must_use]
    pub fn deleted_role_bindings(&self) -> Vec<(String, String)> {
        self.deleted_role_bindings.lock().unwrap().clone()
    }

    /// Names of ClusterRoleBindings deleted so far
    #[must_use]
    pub fn deleted_cluster_role_bindings(&self) -> Vec<String> {
        self.deleted_cluster_role_bindings.lock().unwrap().clone()
    }

    /// Total number of successful write calls
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.applied.lock().unwrap().len()
            + self.deleted_role_bindings.lock().unwrap().len()
            + self.deleted_cluster_role_bindings.lock().unwrap().len()
    }

    /// Forget recorded writes
    pub fn clear_writes(&self) {
        self.applied.lock().unwrap().clear();
        self.deleted_role_bindings.lock().unwrap().clear();
        self.deleted_cluster_role_bindings.lock().unwrap().clear();
    }
}

fn scripted_stream(steps: Vec<MockWatchStep>) -> WatchStream {
    stream::iter(steps)
        .flat_map(|step| match step {
            MockWatchStep::Event(event) => stream::once(async move { Ok(event) }).boxed(),
            MockWatchStep::Error(err) => stream::once(async move { Err(err) }).boxed(),
            MockWatchStep::Hang => stream::pending().boxed(),
        })
        .boxed()
}

#[async_trait::async_trait]
impl ClusterClientTrait for MockClusterClient {
    async fn list_api_groups(&self) -> Result<Vec<String>, ClusterError> {
        {
            let mut failures = self.discovery_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(ClusterError::Transient("connection refused".to_string()));
            }
        }
        let mut groups = vec![String::new()];
        for kind in self.resources.lock().unwrap().iter() {
            if !groups.contains(&kind.group) {
                groups.push(kind.group.clone());
            }
        }
        Ok(groups)
    }

    async fn discover_group(&self, group: &str) -> Result<Vec<ResourceKindDescriptor>, ClusterError> {
        if self.failing_groups.lock().unwrap().contains(group) {
            return Err(ClusterError::Transient(format!("503 from aggregated group {group}")));
        }
        Ok(self
            .resources
            .lock()
            .unwrap()
            .iter()
            .filter(|k| k.group == group)
            .cloned()
            .collect())
    }

    fn watch(&self, kind: &ResourceKindDescriptor) -> WatchStream {
        let key = kind.kind_key();
        *self.watch_calls.lock().unwrap().entry(key.clone()).or_insert(0) += 1;

        let session = self
            .watch_sessions
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front);
        match session {
            Some(MockWatchSession::Scripted(steps)) => scripted_stream(steps),
            Some(MockWatchSession::Channel(rx)) => rx.boxed(),
            None => stream::pending().boxed(),
        }
    }

    async fn get_object(
        &self,
        kind: &ResourceKindDescriptor,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, ClusterError> {
        let objects = self.objects.lock().unwrap();
        let found = objects.get(&kind.kind_key()).and_then(|items| {
            items
                .iter()
                .find(|o| {
                    o.metadata.name.as_deref() == Some(name)
                        && (namespace.is_none() || o.metadata.namespace.as_deref() == namespace)
                })
                .cloned()
        });
        Ok(found)
    }

    async fn list_objects(&self, kind: &ResourceKindDescriptor) -> Result<Vec<DynamicObject>, ClusterError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(&kind.kind_key())
            .cloned()
            .unwrap_or_default())
    }

    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<(), ClusterError> {
        let name = binding.metadata.name.clone().unwrap_or_default();
        if self.failing_bindings.lock().unwrap().contains(&name) {
            return Err(ClusterError::Transient(format!("apply of {name} failed")));
        }
        self.applied.lock().unwrap().push(binding.clone());
        self.after_write();
        Ok(())
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.deleted_role_bindings
            .lock()
            .unwrap()
            .push((namespace.to_string(), name.to_string()));
        self.after_write();
        Ok(())
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<(), ClusterError> {
        self.deleted_cluster_role_bindings
            .lock()
            .unwrap()
            .push(name.to_string());
        self.after_write();
        Ok(())
    }
}

/// In-memory coordination lease with compare-and-swap writes
///
/// Clones share the same lease, so several electors can contend on it.
#[derive(Clone, Default)]
pub struct MockLeaseBackend {
    lease: Arc<Mutex<Option<LeaseRecord>>>,
    next_version: Arc<Mutex<u64>>,
    unavailable: Arc<AtomicBool>,
}

impl std::fmt::Debug for MockLeaseBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLeaseBackend").finish_non_exhaustive()
    }
}

impl MockLeaseBackend {
    /// Create an empty backend (no lease object yet)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the API server being unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current lease contents
    #[must_use]
    pub fn current(&self) -> Option<LeaseRecord> {
        self.lease.lock().unwrap().clone()
    }

    /// Current holder identity
    #[must_use]
    pub fn holder(&self) -> Option<String> {
        self.current().and_then(|l| l.spec.holder_identity)
    }

    fn check_available(&self) -> Result<(), ClusterError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ClusterError::Transient("lease backend unavailable".to_string()));
        }
        Ok(())
    }

    fn bump_version(&self) -> String {
        let mut next = self.next_version.lock().unwrap();
        *next += 1;
        next.to_string()
    }
}

#[async_trait::async_trait]
impl LeaseClientTrait for MockLeaseBackend {
    async fn get_lease(&self, _namespace: &str, _name: &str) -> Result<Option<LeaseRecord>, ClusterError> {
        self.check_available()?;
        Ok(self.current())
    }

    async fn create_lease(
        &self,
        _namespace: &str,
        name: &str,
        spec: &LeaseSpecRecord,
    ) -> Result<LeaseRecord, ClusterError> {
        self.check_available()?;
        let mut lease = self.lease.lock().unwrap();
        if lease.is_some() {
            return Err(ClusterError::Conflict(format!("lease {name} already exists")));
        }
        let record = LeaseRecord {
            spec: spec.clone(),
            resource_version: self.bump_version(),
        };
        *lease = Some(record.clone());
        Ok(record)
    }

    async fn replace_lease(
        &self,
        _namespace: &str,
        name: &str,
        resource_version: &str,
        spec: &LeaseSpecRecord,
    ) -> Result<LeaseRecord, ClusterError> {
        self.check_available()?;
        let mut lease = self.lease.lock().unwrap();
        match lease.as_ref() {
            None => Err(ClusterError::NotFound(format!("lease {name}"))),
            Some(current) if current.resource_version != resource_version => Err(ClusterError::Conflict(
                format!("lease {name} modified (have {resource_version}, stored {})", current.resource_version),
            )),
            Some(_) => {
                let record = LeaseRecord {
                    spec: spec.clone(),
                    resource_version: self.bump_version(),
                };
                *lease = Some(record.clone());
                Ok(record)
            }
        }
    }
}

/// Build a dynamic object for tests
#[must_use]
pub fn dynamic_object(
    kind: &ResourceKindDescriptor,
    namespace: Option<&str>,
    name: &str,
    resource_version: &str,
    data: serde_json::Value,
) -> DynamicObject {
    let mut obj = DynamicObject::new(name, &kind.api_resource()).data(data);
    if let Some(ns) = namespace {
        obj = obj.within(ns);
    }
    obj.metadata.resource_version = Some(resource_version.to_string());
    obj.metadata.uid = Some(format!("{}-{}-{name}", kind.kind_key(), namespace.unwrap_or("")));
    obj
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(holder: &str) -> LeaseSpecRecord {
        LeaseSpecRecord {
            holder_identity: Some(holder.to_string()),
            lease_duration_seconds: Some(15),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_lease_create_conflicts_when_present() {
        let backend = MockLeaseBackend::new();
        backend.create_lease("ns", "lease", &spec("a")).await.unwrap();

        let err = backend.create_lease("ns", "lease", &spec("b")).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(backend.holder().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_lease_replace_is_compare_and_swap() {
        let backend = MockLeaseBackend::new();
        let created = backend.create_lease("ns", "lease", &spec("a")).await.unwrap();

        // Both contenders read the same version; only the first write wins
        backend
            .replace_lease("ns", "lease", &created.resource_version, &spec("b"))
            .await
            .unwrap();
        let err = backend
            .replace_lease("ns", "lease", &created.resource_version, &spec("c"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(backend.holder().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_group_discovery_fails_independently() {
        let client = MockClusterClient::new();
        client.add_resource(ResourceKindDescriptor::new("", "v1", "Pod", "pods", true));
        client.add_resource(ResourceKindDescriptor::new("metrics.k8s.io", "v1beta1", "PodMetrics", "pods", true));
        client.add_resource(ResourceKindDescriptor::new("apps", "v1", "Deployment", "deployments", true));
        client.fail_group("metrics.k8s.io");

        let groups = client.list_api_groups().await.unwrap();
        assert_eq!(groups, vec!["", "metrics.k8s.io", "apps"]);
        assert!(client.discover_group("metrics.k8s.io").await.is_err());
        assert_eq!(client.discover_group("apps").await.unwrap().len(), 1);

        client.heal_group("metrics.k8s.io");
        assert_eq!(client.discover_group("metrics.k8s.io").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_watch_session() {
        let client = MockClusterClient::new();
        let kind = ResourceKindDescriptor::new("", "v1", "ConfigMap", "configmaps", true);
        let cm = dynamic_object(&kind, Some("default"), "cm", "1", serde_json::json!({}));
        client.push_watch_session(
            "ConfigMap",
            vec![
                MockWatchStep::Event(WatchEvent::Init),
                MockWatchStep::Event(WatchEvent::InitApply(cm)),
                MockWatchStep::Event(WatchEvent::InitDone),
                MockWatchStep::Error(ClusterError::Transient("eof".to_string())),
            ],
        );

        let events: Vec<_> = client.watch(&kind).collect().await;
        assert_eq!(events.len(), 4);
        assert!(events[3].is_err());
        assert_eq!(client.watch_calls("ConfigMap"), 1);
    }
}
