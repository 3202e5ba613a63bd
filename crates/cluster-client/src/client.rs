//! Kubernetes-backed implementation of the cluster client traits

use crate::error::ClusterError;
use crate::models::{LeaseRecord, LeaseSpecRecord, ResourceKindDescriptor};
use crate::cluster_trait::{ClusterClientTrait, LeaseClientTrait, WatchStream};
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::DynamicObject;
use kube::discovery::{self, Scope};
use kube::{Api, Client};
use kube_runtime::watcher;
use serde_json::json;
use tracing::debug;

/// Field manager name used for server-side apply
pub const FIELD_MANAGER: &str = "cluster-agent";

/// Cluster client talking to a real API server through `kube`
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient").finish_non_exhaustive()
    }
}

impl KubeClusterClient {
    /// Wrap an existing `kube` client
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the in-cluster service account or local kubeconfig
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    fn dynamic_api(&self, kind: &ResourceKindDescriptor, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = kind.api_resource();
        match namespace {
            Some(ns) if kind.namespaced => Api::namespaced_with(self.client.clone(), ns, &resource),
            _ => Api::all_with(self.client.clone(), &resource),
        }
    }
}

/// Ignore 404 on delete so repeated deletes converge
fn ignore_not_found(result: Result<(), ClusterError>) -> Result<(), ClusterError> {
    match result {
        Err(ClusterError::NotFound(_)) => Ok(()),
        other => other,
    }
}

fn lease_to_record(lease: Lease) -> Result<LeaseRecord, ClusterError> {
    let resource_version = lease
        .metadata
        .resource_version
        .clone()
        .ok_or_else(|| ClusterError::Malformed("lease has no resourceVersion".to_string()))?;
    let spec = match lease.spec {
        Some(spec) => serde_json::from_value(serde_json::to_value(spec)?)?,
        None => LeaseSpecRecord::default(),
    };
    Ok(LeaseRecord { spec, resource_version })
}

fn build_lease(
    namespace: &str,
    name: &str,
    resource_version: Option<&str>,
    spec: &LeaseSpecRecord,
) -> Result<Lease, ClusterError> {
    let mut metadata = json!({ "name": name, "namespace": namespace });
    if let Some(rv) = resource_version {
        metadata["resourceVersion"] = json!(rv);
    }
    let lease = serde_json::from_value(json!({
        "apiVersion": "coordination.k8s.io/v1",
        "kind": "Lease",
        "metadata": metadata,
        "spec": spec,
    }))?;
    Ok(lease)
}

#[async_trait::async_trait]
impl ClusterClientTrait for KubeClusterClient {
    async fn list_api_groups(&self) -> Result<Vec<String>, ClusterError> {
        let served = self.client.list_api_groups().await?;
        let mut groups = vec![String::new()];
        groups.extend(served.groups.into_iter().map(|g| g.name));
        Ok(groups)
    }

    async fn discover_group(&self, group: &str) -> Result<Vec<ResourceKindDescriptor>, ClusterError> {
        let api_group = discovery::group(&self.client, group).await?;

        let kinds: Vec<_> = api_group
            .recommended_resources()
            .into_iter()
            .map(|(resource, caps)| ResourceKindDescriptor {
                group: resource.group,
                version: resource.version,
                kind: resource.kind,
                plural: resource.plural,
                namespaced: matches!(caps.scope, Scope::Namespaced),
                verbs: caps.operations,
            })
            .collect();
        debug!("Discovered {} resource kinds in group {:?}", kinds.len(), group);
        Ok(kinds)
    }

    fn watch(&self, kind: &ResourceKindDescriptor) -> WatchStream {
        let api = self.dynamic_api(kind, None);
        watcher::watcher(api, watcher::Config::default())
            .map_err(ClusterError::from)
            .boxed()
    }

    async fn get_object(
        &self,
        kind: &ResourceKindDescriptor,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, ClusterError> {
        let api = self.dynamic_api(kind, namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_objects(&self, kind: &ResourceKindDescriptor) -> Result<Vec<DynamicObject>, ClusterError> {
        let api = self.dynamic_api(kind, None);
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<(), ClusterError> {
        let namespace = binding
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| ClusterError::Malformed("RoleBinding has no namespace".to_string()))?;
        let name = binding
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ClusterError::Malformed("RoleBinding has no name".to_string()))?;

        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(name, &params, &Patch::Apply(binding)).await?;
        Ok(())
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        let result = api
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(ClusterError::from);
        ignore_not_found(result)
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<(), ClusterError> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        let result = api
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(ClusterError::from);
        ignore_not_found(result)
    }
}

#[async_trait::async_trait]
impl LeaseClientTrait for KubeClusterClient {
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<LeaseRecord>, ClusterError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await?.map(lease_to_record).transpose()
    }

    async fn create_lease(
        &self,
        namespace: &str,
        name: &str,
        spec: &LeaseSpecRecord,
    ) -> Result<LeaseRecord, ClusterError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        let lease = build_lease(namespace, name, None, spec)?;
        let created = api.create(&PostParams::default(), &lease).await?;
        lease_to_record(created)
    }

    async fn replace_lease(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        spec: &LeaseSpecRecord,
    ) -> Result<LeaseRecord, ClusterError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        let lease = build_lease(namespace, name, Some(resource_version), spec)?;
        let replaced = api.replace(name, &PostParams::default(), &lease).await?;
        lease_to_record(replaced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_lease_round_trips_through_api_type() {
        let renew = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let spec = LeaseSpecRecord {
            holder_identity: Some("agent-0".to_string()),
            lease_duration_seconds: Some(15),
            acquire_time: Some(renew),
            renew_time: Some(renew),
            lease_transitions: Some(2),
        };

        let mut lease = build_lease("kube-system", "cluster-agent", Some("42"), &spec).unwrap();
        assert_eq!(lease.metadata.name.as_deref(), Some("cluster-agent"));
        assert_eq!(lease.metadata.resource_version.as_deref(), Some("42"));

        lease.metadata.resource_version = Some("43".to_string());
        let record = lease_to_record(lease).unwrap();
        assert_eq!(record.resource_version, "43");
        assert_eq!(record.spec, spec);
    }

    #[test]
    fn test_ignore_not_found() {
        assert!(ignore_not_found(Err(ClusterError::NotFound("rb".to_string()))).is_ok());
        assert!(ignore_not_found(Err(ClusterError::Transient("eof".to_string()))).is_err());
    }
}
