//! Workspace CRD
//!
//! Groups cluster resources (namespaces, Helm releases) that share access
//! grants.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "agent.microscaler.io",
    version = "v1alpha1",
    kind = "Workspace",
    plural = "workspaces"
)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSpec {
    /// Display name
    #[serde(default)]
    pub name: String,

    /// Resources belonging to this workspace
    #[serde(default)]
    pub resources: Vec<WorkspaceResource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceResource {
    /// Resource identifier (the namespace name for `namespace` resources)
    #[serde(default)]
    pub id: String,

    /// Resource type: `namespace` or `helm`
    #[serde(default, rename = "type")]
    pub resource_type: String,

    /// Namespace the resource lives in (used by `helm` resources)
    #[serde(default)]
    pub namespace: String,
}

/// Known workspace resource types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceResourceType {
    /// A whole namespace, identified by `id`
    Namespace,
    /// A Helm release installed into `namespace`
    Helm,
}

impl WorkspaceResource {
    /// Parsed resource type, `None` for unknown types
    #[must_use]
    pub fn kind(&self) -> Option<WorkspaceResourceType> {
        match self.resource_type.as_str() {
            "namespace" => Some(WorkspaceResourceType::Namespace),
            "helm" => Some(WorkspaceResourceType::Helm),
            _ => None,
        }
    }

    /// Namespace an access grant on this resource applies to
    #[must_use]
    pub fn target_namespace(&self) -> Option<&str> {
        match self.kind()? {
            WorkspaceResourceType::Namespace => Some(self.id.as_str()),
            WorkspaceResourceType::Helm => Some(self.namespace.as_str()),
        }
        .filter(|ns| !ns.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_namespace_by_type() {
        let ns = WorkspaceResource {
            id: "team-a".to_string(),
            resource_type: "namespace".to_string(),
            namespace: String::new(),
        };
        assert_eq!(ns.target_namespace(), Some("team-a"));

        let helm = WorkspaceResource {
            id: "redis".to_string(),
            resource_type: "helm".to_string(),
            namespace: "cache".to_string(),
        };
        assert_eq!(helm.target_namespace(), Some("cache"));

        let other = WorkspaceResource {
            id: "x".to_string(),
            resource_type: "bucket".to_string(),
            namespace: "y".to_string(),
        };
        assert_eq!(other.kind(), None);
        assert_eq!(other.target_namespace(), None);
    }

    #[test]
    fn test_resource_type_field_name() {
        let parsed: WorkspaceResource =
            serde_json::from_value(serde_json::json!({"id": "a", "type": "namespace"})).unwrap();
        assert_eq!(parsed.kind(), Some(WorkspaceResourceType::Namespace));
    }
}
