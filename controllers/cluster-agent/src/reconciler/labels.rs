//! Labels carried by agent-managed RBAC bindings.
//!
//! Every managed binding records the grant and workspace resource it was
//! generated from, so observed bindings can be matched against the desired
//! set without relying on names.

use std::collections::BTreeMap;

/// Label key builder for a configurable prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedLabels {
    prefix: String,
}

/// Grant and resource identity recorded on a managed binding
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingOrigin {
    pub grantee: String,
    pub target_type: String,
    pub target_name: String,
    pub role: String,
    pub resource_id: String,
    pub resource_type: String,
    pub resource_namespace: String,
}

impl ManagedLabels {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    fn key(&self, name: &str) -> String {
        format!("{}/{name}", self.prefix)
    }

    /// Marker present on every binding the agent owns
    #[must_use]
    pub fn managed_by(&self) -> String {
        self.key("managed-by-agent")
    }

    /// ClusterRole label matched against `Grant.spec.role`
    #[must_use]
    pub fn role_name(&self) -> String {
        self.key("role-name")
    }

    /// Full label set for a binding generated from `origin`
    #[must_use]
    pub fn build(&self, origin: &BindingOrigin) -> BTreeMap<String, String> {
        BTreeMap::from([
            (self.managed_by(), String::new()),
            (self.key("grant-grantee"), origin.grantee.clone()),
            (self.key("grant-target-type"), origin.target_type.clone()),
            (self.key("grant-target-name"), origin.target_name.clone()),
            (self.key("grant-role"), origin.role.clone()),
            (self.key("resource-id"), origin.resource_id.clone()),
            (self.key("resource-type"), origin.resource_type.clone()),
            (self.key("resource-namespace"), origin.resource_namespace.clone()),
        ])
    }

    /// Whether the managed-by marker is present
    #[must_use]
    pub fn is_managed(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        labels.is_some_and(|l| l.contains_key(&self.managed_by()))
    }

    /// Recover the origin from a label set
    ///
    /// Fails with the name of the first missing label.
    pub fn parse(&self, labels: &BTreeMap<String, String>) -> Result<BindingOrigin, String> {
        let get = |name: &str| {
            labels
                .get(&self.key(name))
                .cloned()
                .ok_or_else(|| format!("missing label: {name}"))
        };
        Ok(BindingOrigin {
            grantee: get("grant-grantee")?,
            target_type: get("grant-target-type")?,
            target_name: get("grant-target-name")?,
            role: get("grant-role")?,
            resource_id: get("resource-id")?,
            resource_type: get("resource-type")?,
            resource_namespace: get("resource-namespace")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> BindingOrigin {
        BindingOrigin {
            grantee: "alice".to_string(),
            target_type: "workspace".to_string(),
            target_name: "shop".to_string(),
            role: "editor".to_string(),
            resource_id: "shop-prod".to_string(),
            resource_type: "namespace".to_string(),
            resource_namespace: String::new(),
        }
    }

    #[test]
    fn test_build_then_parse() {
        let labels = ManagedLabels::new("agent.microscaler.io");
        let built = labels.build(&origin());

        assert!(labels.is_managed(Some(&built)));
        assert_eq!(built.get("agent.microscaler.io/grant-role").map(String::as_str), Some("editor"));
        assert_eq!(labels.parse(&built).unwrap(), origin());
    }

    #[test]
    fn test_missing_label_is_reported() {
        let labels = ManagedLabels::new("agent.microscaler.io");
        let mut built = labels.build(&origin());
        built.remove("agent.microscaler.io/resource-type");

        assert_eq!(labels.parse(&built), Err("missing label: resource-type".to_string()));
        // Still carries the marker
        assert!(labels.is_managed(Some(&built)));
        assert!(!labels.is_managed(None));
    }
}
