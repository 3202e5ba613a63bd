//! User CRD
//!
//! A platform user and the RBAC subject their grants bind to.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "agent.microscaler.io",
    version = "v1alpha1",
    kind = "User",
    plural = "users"
)]
#[serde(rename_all = "camelCase")]
pub struct UserSpec {
    /// Contact email
    #[serde(default)]
    pub email: String,

    /// RBAC subject bindings are created for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<UserSubject>,
}

/// Mirror of `rbac.authorization.k8s.io/v1` `Subject`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserSubject {
    /// `User`, `Group` or `ServiceAccount`
    pub kind: String,

    /// Subject name
    pub name: String,

    /// Namespace (service accounts only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// API group of the subject kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
}
