//! Grant CRD
//!
//! Gives a user a role on a target (currently only workspaces).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The only target type grants are reconciled for
pub const TARGET_TYPE_WORKSPACE: &str = "workspace";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "agent.microscaler.io",
    version = "v1alpha1",
    kind = "Grant",
    plural = "grants"
)]
#[serde(rename_all = "camelCase")]
pub struct GrantSpec {
    /// Name of the User receiving access
    #[serde(default)]
    pub grantee: String,

    /// Target type (`workspace`)
    #[serde(default)]
    pub target_type: String,

    /// Name of the target object
    #[serde(default)]
    pub target_name: String,

    /// Role name, resolved to a ClusterRole
    #[serde(default)]
    pub role: String,
}
