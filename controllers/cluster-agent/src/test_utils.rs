//! Test utilities for unit testing the agent
//!
//! Builders for the typed input objects of the reconciler plus helpers for
//! seeding the store and faking leadership and watch sync.

#[cfg(test)]
use crate::leader::{LeaderRole, LeadershipState};
#[cfg(test)]
use crate::store::Store;
#[cfg(test)]
use crate::watcher::SyncStatus;
#[cfg(test)]
use crds::{Grant, GrantSpec, User, UserSpec, UserSubject, Workspace, WorkspaceResource, WorkspaceSpec};
#[cfg(test)]
use k8s_openapi::api::core::v1::Namespace;
#[cfg(test)]
use k8s_openapi::api::rbac::v1::ClusterRole;
#[cfg(test)]
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
#[cfg(test)]
use std::collections::{BTreeMap, HashSet};
#[cfg(test)]
use tokio::sync::watch;

/// Helper to create a test Namespace
#[cfg(test)]
pub fn create_test_namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Helper to create a test Workspace from `(id, type, namespace)` resources
#[cfg(test)]
pub fn create_test_workspace(name: &str, resources: &[(&str, &str, &str)]) -> Workspace {
    Workspace::new(
        name,
        WorkspaceSpec {
            name: name.to_string(),
            resources: resources
                .iter()
                .map(|(id, resource_type, namespace)| WorkspaceResource {
                    id: (*id).to_string(),
                    resource_type: (*resource_type).to_string(),
                    namespace: (*namespace).to_string(),
                })
                .collect(),
        },
    )
}

/// Helper to create a test User, optionally with a `User` subject
#[cfg(test)]
pub fn create_test_user(name: &str, subject: Option<&str>) -> User {
    User::new(
        name,
        UserSpec {
            email: format!("{name}@example.com"),
            subject: subject.map(|s| UserSubject {
                kind: "User".to_string(),
                name: s.to_string(),
                namespace: None,
                api_group: Some("rbac.authorization.k8s.io".to_string()),
            }),
        },
    )
}

/// Helper to create a test Grant on a workspace
#[cfg(test)]
pub fn create_test_grant(name: &str, grantee: &str, workspace: &str, role: &str) -> Grant {
    Grant::new(
        name,
        GrantSpec {
            grantee: grantee.to_string(),
            target_type: crds::TARGET_TYPE_WORKSPACE.to_string(),
            target_name: workspace.to_string(),
            role: role.to_string(),
        },
    )
}

/// Helper to create a test ClusterRole, optionally labelled with a role name
#[cfg(test)]
pub fn create_test_cluster_role(name: &str, role_name: Option<&str>) -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: role_name.map(|r| BTreeMap::from([("agent.microscaler.io/role-name".to_string(), r.to_string())])),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Store a typed object under `kind_key`
#[cfg(test)]
pub fn store_typed<K: serde::Serialize>(store: &Store, kind_key: &str, object: &K) {
    let obj = cluster_client::to_dynamic_object(object).unwrap();
    let namespace = obj.metadata.namespace.clone().unwrap_or_default();
    let name = obj.metadata.name.clone().unwrap();
    store.set(kind_key, &namespace, &name, obj);
}

/// Sync status reporting a fixed set of kinds as synced
#[cfg(test)]
#[derive(Debug, Default)]
pub struct StaticSync {
    synced: HashSet<String>,
    all: bool,
}

#[cfg(test)]
impl StaticSync {
    /// Every kind synced
    pub fn all() -> Self {
        Self {
            synced: HashSet::new(),
            all: true,
        }
    }

    /// No kind synced
    pub fn none() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl SyncStatus for StaticSync {
    fn is_synced(&self, kind_key: &str) -> bool {
        self.all || self.synced.contains(kind_key)
    }
}

/// Leadership channel starting in the given role
#[cfg(test)]
pub fn leadership_channel(leader: bool) -> (watch::Sender<LeadershipState>, watch::Receiver<LeadershipState>) {
    watch::channel(leadership_state(leader))
}

/// Leadership snapshot for a leader or follower; the lease is good for an hour
#[cfg(test)]
pub fn leadership_state(leader: bool) -> LeadershipState {
    LeadershipState {
        role: if leader { LeaderRole::Leader } else { LeaderRole::Follower },
        is_leader: leader,
        holder: Some(if leader { "me" } else { "other" }.to_string()),
        lease_expiry: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
    }
}
