//! Diff between desired and observed managed bindings.
//!
//! Bindings are matched on their origin labels, subject, roleRef and
//! namespace rather than by name, so a binding whose ClusterRole changed is
//! replaced (delete, then apply) even though its name is unchanged.

use super::labels::{BindingOrigin, ManagedLabels};
use chrono::{DateTime, Utc};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::HashSet;

/// What a task does to its target
#[derive(Debug, Clone)]
pub enum ReconcileAction {
    /// Server-side apply of the desired RoleBinding
    Apply(Box<RoleBinding>),
    /// Delete a managed RoleBinding
    DeleteRoleBinding,
    /// Delete a managed ClusterRoleBinding
    DeleteClusterRoleBinding,
}

impl ReconcileAction {
    /// Short name used in logs and metrics
    #[must_use]
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Apply(_) => "apply",
            Self::DeleteRoleBinding | Self::DeleteClusterRoleBinding => "delete",
        }
    }
}

/// One write the reconciler intends to make
#[derive(Debug, Clone)]
pub struct ReconcileTask {
    pub kind: &'static str,
    pub namespace: Option<String>,
    pub name: String,
    pub action: ReconcileAction,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ReconcileTask {
    fn new(kind: &'static str, namespace: Option<String>, name: String, action: ReconcileAction) -> Self {
        Self {
            kind,
            namespace,
            name,
            action,
            last_attempt: None,
            last_error: None,
        }
    }

    /// `Kind/namespace/name`, or `Kind/name` for cluster-scoped targets
    #[must_use]
    pub fn target(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{ns}/{}", self.kind, self.name),
            None => format!("{}/{}", self.kind, self.name),
        }
    }
}

/// Writes needed to converge, deletes ordered before applies
#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    pub tasks: Vec<ReconcileTask>,
}

impl ReconcilePlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}

/// Identity used to match desired and observed bindings
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BindingIdentity {
    namespace: Option<String>,
    origin: BindingOrigin,
    subject: (Option<String>, String, String, Option<String>),
    role_ref: (String, String, String),
}

fn identity(
    labels: &ManagedLabels,
    metadata: &ObjectMeta,
    subjects: Option<&Vec<Subject>>,
    role_ref: &RoleRef,
) -> Option<BindingIdentity> {
    if !labels.is_managed(metadata.labels.as_ref()) {
        return None;
    }
    let origin = labels.parse(metadata.labels.as_ref()?).ok()?;
    // Managed bindings always carry exactly one subject
    let [subject] = subjects?.as_slice() else {
        return None;
    };
    Some(BindingIdentity {
        namespace: metadata.namespace.clone(),
        origin,
        subject: (
            subject.api_group.clone().filter(|g| !g.is_empty()),
            subject.kind.clone(),
            subject.name.clone(),
            subject.namespace.clone().filter(|ns| !ns.is_empty()),
        ),
        role_ref: (role_ref.api_group.clone(), role_ref.kind.clone(), role_ref.name.clone()),
    })
}

/// Whether a RoleBinding is owned by the agent and fully labelled
#[must_use]
pub fn is_managed_role_binding(labels: &ManagedLabels, rb: &RoleBinding) -> bool {
    identity(labels, &rb.metadata, rb.subjects.as_ref(), &rb.role_ref).is_some()
}

/// Whether a ClusterRoleBinding is owned by the agent and fully labelled
#[must_use]
pub fn is_managed_cluster_role_binding(labels: &ManagedLabels, crb: &ClusterRoleBinding) -> bool {
    identity(labels, &crb.metadata, crb.subjects.as_ref(), &crb.role_ref).is_some()
}

/// Plan the writes turning `existing` into `required`
///
/// Unmanaged bindings are never touched. The agent does not generate
/// ClusterRoleBindings, so every managed one is removed.
#[must_use]
pub fn plan(
    labels: &ManagedLabels,
    required: &[RoleBinding],
    existing: &[RoleBinding],
    existing_cluster: &[ClusterRoleBinding],
) -> ReconcilePlan {
    let required_ids: HashSet<BindingIdentity> = required
        .iter()
        .filter_map(|rb| identity(labels, &rb.metadata, rb.subjects.as_ref(), &rb.role_ref))
        .collect();

    let mut existing_ids = HashSet::new();
    let mut tasks = Vec::new();

    for rb in existing {
        let Some(id) = identity(labels, &rb.metadata, rb.subjects.as_ref(), &rb.role_ref) else {
            continue;
        };
        if required_ids.contains(&id) {
            existing_ids.insert(id);
        } else if let Some(name) = rb.metadata.name.clone() {
            tasks.push(ReconcileTask::new(
                "RoleBinding",
                rb.metadata.namespace.clone(),
                name,
                ReconcileAction::DeleteRoleBinding,
            ));
        }
    }

    for crb in existing_cluster {
        if !is_managed_cluster_role_binding(labels, crb) {
            continue;
        }
        if let Some(name) = crb.metadata.name.clone() {
            tasks.push(ReconcileTask::new(
                "ClusterRoleBinding",
                None,
                name,
                ReconcileAction::DeleteClusterRoleBinding,
            ));
        }
    }

    for rb in required {
        let Some(id) = identity(labels, &rb.metadata, rb.subjects.as_ref(), &rb.role_ref) else {
            continue;
        };
        if existing_ids.insert(id)
            && let Some(name) = rb.metadata.name.clone()
        {
            tasks.push(ReconcileTask::new(
                "RoleBinding",
                rb.metadata.namespace.clone(),
                name,
                ReconcileAction::Apply(Box::new(rb.clone())),
            ));
        }
    }

    ReconcilePlan { tasks }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::desired::{ClusterSnapshot, desired_role_bindings};
    use crate::test_utils::*;

    fn labels() -> ManagedLabels {
        ManagedLabels::new("agent.microscaler.io")
    }

    fn required() -> Vec<RoleBinding> {
        let snapshot = ClusterSnapshot {
            namespaces: vec![create_test_namespace("shop-prod")],
            workspaces: vec![create_test_workspace("shop", &[("shop-prod", "namespace", "")])],
            users: vec![create_test_user("alice", Some("alice"))],
            grants: vec![create_test_grant("g", "alice", "shop", "editor")],
            cluster_roles: vec![create_test_cluster_role("editor", None)],
            ..Default::default()
        };
        desired_role_bindings(&snapshot, &labels())
    }

    #[test]
    fn test_missing_binding_is_applied() {
        let plan = plan(&labels(), &required(), &[], &[]);
        assert_eq!(plan.len(), 1);
        assert!(matches!(plan.tasks[0].action, ReconcileAction::Apply(_)));
        assert!(plan.tasks[0].target().starts_with("RoleBinding/shop-prod/agent-rb-"));
    }

    #[test]
    fn test_matching_binding_needs_nothing() {
        let required = required();
        // Server adds metadata of its own
        let mut observed = required[0].clone();
        observed.metadata.resource_version = Some("42".to_string());
        observed.metadata.uid = Some("uid".to_string());

        assert!(plan(&labels(), &required, &[observed], &[]).is_empty());
    }

    #[test]
    fn test_changed_role_ref_is_replaced_delete_first() {
        let required = required();
        let mut observed = required[0].clone();
        observed.role_ref.name = "old-editor".to_string();

        let plan = plan(&labels(), &required, &[observed], &[]);
        let verbs: Vec<&str> = plan.tasks.iter().map(|t| t.action.verb()).collect();
        assert_eq!(verbs, vec!["delete", "apply"]);
        assert_eq!(plan.tasks[0].name, plan.tasks[1].name);
    }

    #[test]
    fn test_unmanaged_and_partially_labelled_bindings_are_ignored() {
        let mut unmanaged = required()[0].clone();
        unmanaged.metadata.labels = None;
        let mut broken = required()[0].clone();
        broken
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .remove("agent.microscaler.io/grant-role");

        assert!(plan(&labels(), &[], &[unmanaged, broken], &[]).is_empty());
    }

    #[test]
    fn test_superfluous_bindings_are_deleted() {
        let stale = required()[0].clone();
        let crb = ClusterRoleBinding {
            metadata: stale.metadata.clone(),
            role_ref: stale.role_ref.clone(),
            subjects: stale.subjects.clone(),
        };

        let plan = plan(&labels(), &[], &[stale], &[crb]);
        let kinds: Vec<&str> = plan.tasks.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec!["RoleBinding", "ClusterRoleBinding"]);
        assert!(plan.tasks.iter().all(|t| t.action.verb() == "delete"));
    }
}
