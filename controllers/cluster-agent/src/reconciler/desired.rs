//! Desired RBAC state computed from Grants, Users and Workspaces.

use super::labels::{BindingOrigin, ManagedLabels};
use crds::{Grant, GrantSpec, TARGET_TYPE_WORKSPACE, User, UserSubject, Workspace, WorkspaceResource};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::HashSet;

/// API group of RBAC objects
pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Prefix of generated RoleBinding names
pub const ROLE_BINDING_NAME_PREFIX: &str = "agent-rb-";

/// Every input of one reconcile pass
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub namespaces: Vec<Namespace>,
    pub workspaces: Vec<Workspace>,
    pub users: Vec<User>,
    pub grants: Vec<Grant>,
    pub cluster_roles: Vec<ClusterRole>,
    pub role_bindings: Vec<RoleBinding>,
    pub cluster_role_bindings: Vec<ClusterRoleBinding>,
}

impl ClusterSnapshot {
    pub(crate) fn find_user(&self, name: &str) -> Option<&User> {
        self.users.iter().find(|u| u.metadata.name.as_deref() == Some(name))
    }

    pub(crate) fn find_workspace(&self, name: &str) -> Option<&Workspace> {
        self.workspaces.iter().find(|w| w.metadata.name.as_deref() == Some(name))
    }

    pub(crate) fn has_namespace(&self, name: &str) -> bool {
        self.namespaces.iter().any(|ns| ns.metadata.name.as_deref() == Some(name))
    }

    /// ClusterRole for a grant's role: a `role-name` label match wins over a name match
    pub(crate) fn find_cluster_role(&self, labels: &ManagedLabels, role: &str) -> Option<&ClusterRole> {
        let role_label = labels.role_name();
        self.cluster_roles
            .iter()
            .find(|cr| {
                cr.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(&role_label))
                    .is_some_and(|v| v == role)
            })
            .or_else(|| self.cluster_roles.iter().find(|cr| cr.metadata.name.as_deref() == Some(role)))
    }
}

/// 64-bit FNV-1a
fn fnv1a_64(parts: &[&str]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET_BASIS;
    for byte in parts.iter().flat_map(|p| p.bytes()) {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Stable RoleBinding name for one grant applied to one workspace resource
#[must_use]
pub fn binding_name(grant: &GrantSpec, resource: &WorkspaceResource) -> String {
    let hash = fnv1a_64(&[
        &grant.grantee,
        &grant.target_type,
        &grant.target_name,
        &grant.role,
        &resource.id,
        &resource.resource_type,
        &resource.namespace,
    ]);
    format!("{ROLE_BINDING_NAME_PREFIX}{hash:x}")
}

/// RBAC subject for a User
#[must_use]
pub fn to_subject(subject: &UserSubject) -> Subject {
    Subject {
        api_group: subject.api_group.clone(),
        kind: subject.kind.clone(),
        name: subject.name.clone(),
        namespace: subject.namespace.clone(),
    }
}

/// RoleBindings required by the snapshot
///
/// Grants whose user, subject, ClusterRole, workspace or namespace is missing
/// produce nothing; they show up in the status report instead.
#[must_use]
pub fn desired_role_bindings(snapshot: &ClusterSnapshot, labels: &ManagedLabels) -> Vec<RoleBinding> {
    let mut required = Vec::new();
    let mut names = HashSet::new();

    for grant in &snapshot.grants {
        let spec = &grant.spec;
        let Some(subject) = snapshot.find_user(&spec.grantee).and_then(|u| u.spec.subject.as_ref()) else {
            continue;
        };
        let Some(cluster_role_name) = snapshot
            .find_cluster_role(labels, &spec.role)
            .and_then(|cr| cr.metadata.name.clone())
        else {
            continue;
        };
        if spec.target_type != TARGET_TYPE_WORKSPACE {
            continue;
        }
        let Some(workspace) = snapshot.find_workspace(&spec.target_name) else {
            continue;
        };

        for resource in &workspace.spec.resources {
            let Some(namespace) = resource.target_namespace() else {
                continue;
            };
            if !snapshot.has_namespace(namespace) {
                continue;
            }

            let name = binding_name(spec, resource);
            if !names.insert((namespace.to_string(), name.clone())) {
                continue;
            }
            let origin = BindingOrigin {
                grantee: spec.grantee.clone(),
                target_type: spec.target_type.clone(),
                target_name: spec.target_name.clone(),
                role: spec.role.clone(),
                resource_id: resource.id.clone(),
                resource_type: resource.resource_type.clone(),
                resource_namespace: resource.namespace.clone(),
            };
            required.push(RoleBinding {
                metadata: ObjectMeta {
                    name: Some(name),
                    namespace: Some(namespace.to_string()),
                    labels: Some(labels.build(&origin)),
                    ..Default::default()
                },
                role_ref: RoleRef {
                    api_group: RBAC_API_GROUP.to_string(),
                    kind: "ClusterRole".to_string(),
                    name: cluster_role_name.clone(),
                },
                subjects: Some(vec![to_subject(subject)]),
            });
        }
    }
    required
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    fn labels() -> ManagedLabels {
        ManagedLabels::new("agent.microscaler.io")
    }

    #[test]
    fn test_fnv1a_reference_values() {
        assert_eq!(fnv1a_64(&[]), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64(&["a"]), 0xaf63_dc4c_8601_ec8c);
        // Concatenation, no separator
        assert_eq!(fnv1a_64(&["foo", "bar"]), fnv1a_64(&["foobar"]));
    }

    #[test]
    fn test_binding_per_workspace_resource() {
        let snapshot = ClusterSnapshot {
            namespaces: vec![create_test_namespace("shop-prod"), create_test_namespace("cache")],
            workspaces: vec![create_test_workspace(
                "shop",
                &[("shop-prod", "namespace", ""), ("redis", "helm", "cache"), ("x", "bucket", "")],
            )],
            users: vec![create_test_user("alice", Some("alice@example.com"))],
            grants: vec![create_test_grant("alice-shop", "alice", "shop", "editor")],
            cluster_roles: vec![create_test_cluster_role("agent-editor", Some("editor"))],
            ..Default::default()
        };

        let required = desired_role_bindings(&snapshot, &labels());
        let mut namespaces: Vec<&str> = required
            .iter()
            .filter_map(|rb| rb.metadata.namespace.as_deref())
            .collect();
        namespaces.sort_unstable();
        assert_eq!(namespaces, vec!["cache", "shop-prod"]);

        let rb = &required[0];
        assert!(rb.metadata.name.as_deref().unwrap().starts_with(ROLE_BINDING_NAME_PREFIX));
        assert_eq!(rb.role_ref.name, "agent-editor");
        assert_eq!(rb.subjects.as_ref().unwrap()[0].name, "alice@example.com");
        assert!(labels().is_managed(rb.metadata.labels.as_ref()));
    }

    #[test]
    fn test_missing_references_produce_nothing() {
        let base = ClusterSnapshot {
            namespaces: vec![create_test_namespace("shop-prod")],
            workspaces: vec![create_test_workspace("shop", &[("shop-prod", "namespace", "")])],
            users: vec![create_test_user("alice", Some("alice")), create_test_user("bob", None)],
            cluster_roles: vec![create_test_cluster_role("editor", None)],
            ..Default::default()
        };

        for grant in [
            create_test_grant("g", "nobody", "shop", "editor"),
            create_test_grant("g", "bob", "shop", "editor"),
            create_test_grant("g", "alice", "shop", "admin"),
            create_test_grant("g", "alice", "missing", "editor"),
        ] {
            let snapshot = ClusterSnapshot {
                grants: vec![grant],
                ..base.clone()
            };
            assert!(desired_role_bindings(&snapshot, &labels()).is_empty());
        }

        // Namespace not present
        let snapshot = ClusterSnapshot {
            namespaces: Vec::new(),
            grants: vec![create_test_grant("g", "alice", "shop", "editor")],
            ..base
        };
        assert!(desired_role_bindings(&snapshot, &labels()).is_empty());
    }

    #[test]
    fn test_role_label_takes_precedence_over_name() {
        let snapshot = ClusterSnapshot {
            cluster_roles: vec![
                create_test_cluster_role("viewer", None),
                create_test_cluster_role("agent-viewer", Some("viewer")),
            ],
            ..Default::default()
        };
        let found = snapshot.find_cluster_role(&labels(), "viewer").unwrap();
        assert_eq!(found.metadata.name.as_deref(), Some("agent-viewer"));
    }

    #[test]
    fn test_names_are_stable() {
        let grant = create_test_grant("g", "alice", "shop", "editor");
        let resource = WorkspaceResource {
            id: "shop-prod".to_string(),
            resource_type: "namespace".to_string(),
            namespace: String::new(),
        };
        assert_eq!(binding_name(&grant.spec, &resource), binding_name(&grant.spec, &resource));

        let other = create_test_grant("g", "alice", "shop", "viewer");
        assert_ne!(binding_name(&grant.spec, &resource), binding_name(&other.spec, &resource));
    }
}
