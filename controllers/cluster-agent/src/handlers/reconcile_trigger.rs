//! Requests a reconcile pass when an RBAC input changes.

use super::KindHandler;
use crate::error::ControllerError;
use cluster_client::ResourceKindDescriptor;
use kube::core::DynamicObject;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::trace;

/// Wakes the reconciler on changes to the kinds it is registered for
///
/// Notifications coalesce: any number of changes before the reconciler wakes
/// up result in a single pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileTrigger {
    notify: Arc<Notify>,
}

impl ReconcileTrigger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a pass as soon as possible
    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    /// Resolves once a pass was requested
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl KindHandler for ReconcileTrigger {
    fn name(&self) -> &'static str {
        "reconcile-trigger"
    }

    fn on_apply(&self, kind: &ResourceKindDescriptor, obj: &DynamicObject) -> Result<(), ControllerError> {
        trace!(kind = %kind.kind_key(), name = ?obj.metadata.name, "Input changed");
        self.trigger();
        Ok(())
    }

    fn on_delete(&self, kind: &ResourceKindDescriptor, obj: &DynamicObject) -> Result<(), ControllerError> {
        trace!(kind = %kind.kind_key(), name = ?obj.metadata.name, "Input deleted");
        self.trigger();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_client::dynamic_object;
    use serde_json::json;
    use std::time::Duration;

    fn grants() -> ResourceKindDescriptor {
        ResourceKindDescriptor::new("agent.microscaler.io", "v1alpha1", "Grant", "grants", false)
    }

    #[tokio::test]
    async fn test_changes_coalesce_into_one_wakeup() {
        let trigger = ReconcileTrigger::new();
        let grant = dynamic_object(&grants(), None, "alice-admin", "1", json!({ "spec": {} }));

        trigger.on_apply(&grants(), &grant).unwrap();
        trigger.on_delete(&grants(), &grant).unwrap();

        tokio::time::timeout(Duration::from_secs(1), trigger.notified())
            .await
            .unwrap();
        // Both changes were consumed by the single wakeup above
        assert!(
            tokio::time::timeout(Duration::from_millis(50), trigger.notified())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_clones_share_the_wakeup() {
        let trigger = ReconcileTrigger::new();
        let handler = trigger.clone();
        let grant = dynamic_object(&grants(), None, "alice-admin", "1", json!({ "spec": {} }));

        handler.on_apply(&grants(), &grant).unwrap();
        tokio::time::timeout(Duration::from_secs(1), trigger.notified())
            .await
            .unwrap();
    }
}
