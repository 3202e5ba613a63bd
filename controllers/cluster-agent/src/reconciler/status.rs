//! Reconciler status report served on `/status`.

use super::desired::ClusterSnapshot;
use super::diff::{ReconcileTask, is_managed_cluster_role_binding, is_managed_role_binding};
use super::labels::ManagedLabels;
use chrono::{DateTime, Utc};
use crds::{TARGET_TYPE_WORKSPACE, WorkspaceResourceType};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;

const AGENT_GROUP: &str = "agent.microscaler.io";
const AGENT_VERSION: &str = "v1alpha1";
const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

/// A problem with one input object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIssue {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub error: String,
}

impl ResourceIssue {
    fn new(group: &str, version: &str, kind: &str, metadata: &ObjectMeta, error: String) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            name: metadata.name.clone().unwrap_or_default(),
            namespace: metadata.namespace.clone(),
            error,
        }
    }

    /// Issue for an object that could not be decoded
    #[must_use]
    pub fn undecodable(kind_key: &str, detail: String) -> Self {
        Self {
            group: String::new(),
            version: String::new(),
            kind: kind_key.to_string(),
            name: String::new(),
            namespace: None,
            error: format!("could not decode object: {detail}"),
        }
    }
}

/// A write that failed during a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    pub target: String,
    pub action: String,
    pub error: String,
    pub attempted_at: DateTime<Utc>,
}

impl TaskFailure {
    pub(crate) fn from_task(task: &ReconcileTask) -> Option<Self> {
        Some(Self {
            target: task.target(),
            action: task.action.verb().to_string(),
            error: task.last_error.clone()?,
            attempted_at: task.last_attempt?,
        })
    }
}

/// Outcome of one reconcile pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub applied: usize,
    pub deleted: usize,
    pub failed: usize,
    /// Writes not issued because leadership was lost mid-pass
    pub skipped_not_leader: usize,
    /// Whether every input came from synced watches
    pub from_store: bool,
    pub failures: Vec<TaskFailure>,
}

impl PassReport {
    pub(crate) fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: at,
            finished_at: at,
            applied: 0,
            deleted: 0,
            failed: 0,
            skipped_not_leader: 0,
            from_store: true,
            failures: Vec::new(),
        }
    }
}

/// Latest reconciler state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilerStatus {
    pub is_active: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub last_pass: Option<PassReport>,
    pub resource_warnings: Vec<ResourceIssue>,
    pub resource_errors: Vec<ResourceIssue>,
    pub managed_role_binding_count: usize,
    pub managed_cluster_role_binding_count: usize,
    pub users_count: usize,
    pub workspaces_count: usize,
    pub grants_count: usize,
}

/// Validation results and counts for a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotReview {
    pub warnings: Vec<ResourceIssue>,
    pub errors: Vec<ResourceIssue>,
    pub managed_role_bindings: usize,
    pub managed_cluster_role_bindings: usize,
}

/// Check every input object for references that cannot be satisfied
#[must_use]
pub fn review(snapshot: &ClusterSnapshot, labels: &ManagedLabels) -> SnapshotReview {
    let mut review = SnapshotReview::default();

    for user in &snapshot.users {
        let issue = |error: &str| ResourceIssue::new(AGENT_GROUP, AGENT_VERSION, "User", &user.metadata, error.to_string());
        if user.spec.email.is_empty() {
            review.errors.push(issue("User email is not set, the user has no identifier"));
        }
        if user.spec.subject.is_none() {
            review
                .warnings
                .push(issue("User subject is not set, no permissions in the cluster can be granted"));
        }
    }

    for workspace in &snapshot.workspaces {
        let issue =
            |error: String| ResourceIssue::new(AGENT_GROUP, AGENT_VERSION, "Workspace", &workspace.metadata, error);
        for resource in &workspace.spec.resources {
            let Some(kind) = resource.kind() else {
                review.errors.push(issue(format!(
                    "Workspace contains a resource with the invalid type {:?}",
                    resource.resource_type
                )));
                continue;
            };
            let (namespace, field) = match kind {
                WorkspaceResourceType::Namespace => (resource.id.as_str(), "id"),
                WorkspaceResourceType::Helm => (resource.namespace.as_str(), "namespace"),
            };
            if namespace.is_empty() {
                review.errors.push(issue(format!(
                    "Workspace contains a resource of type {:?} without a namespace in resource.{field}",
                    resource.resource_type
                )));
            } else if !snapshot.has_namespace(namespace) {
                review.errors.push(issue(format!(
                    "Workspace contains a resource of type {:?} pointing to a namespace which does not exist: {namespace:?}",
                    resource.resource_type
                )));
            }
        }
    }

    for grant in &snapshot.grants {
        let issue = |error: String| ResourceIssue::new(AGENT_GROUP, AGENT_VERSION, "Grant", &grant.metadata, error);
        let spec = &grant.spec;
        if snapshot.find_user(&spec.grantee).is_none() {
            review.errors.push(issue(format!(
                "Grant is pointing to a user which does not exist: {:?}",
                spec.grantee
            )));
        }
        if snapshot.find_cluster_role(labels, &spec.role).is_none() {
            review.errors.push(issue(format!(
                "Grant is pointing to a ClusterRole which does not exist: {:?}",
                spec.role
            )));
        }
        if spec.target_type == TARGET_TYPE_WORKSPACE {
            if snapshot.find_workspace(&spec.target_name).is_none() {
                review.errors.push(issue(format!(
                    "Grant is pointing to a Workspace which does not exist: {:?}",
                    spec.target_name
                )));
            }
        } else {
            review.errors.push(issue(format!(
                "Grant has the invalid target type {:?}",
                spec.target_type
            )));
        }
    }

    for rb in &snapshot.role_bindings {
        if !labels.is_managed(rb.metadata.labels.as_ref()) {
            continue;
        }
        review.managed_role_bindings += 1;
        if !is_managed_role_binding(labels, rb) {
            review.errors.push(ResourceIssue::new(
                RBAC_GROUP,
                "v1",
                "RoleBinding",
                &rb.metadata,
                "RoleBinding is marked as managed but lacks managed labels or has more than one subject".to_string(),
            ));
        }
    }

    for crb in &snapshot.cluster_role_bindings {
        if !labels.is_managed(crb.metadata.labels.as_ref()) {
            continue;
        }
        review.managed_cluster_role_bindings += 1;
        if !is_managed_cluster_role_binding(labels, crb) {
            review.errors.push(ResourceIssue::new(
                RBAC_GROUP,
                "v1",
                "ClusterRoleBinding",
                &crb.metadata,
                "ClusterRoleBinding is marked as managed but lacks managed labels or has more than one subject"
                    .to_string(),
            ));
        }
    }

    review
}
