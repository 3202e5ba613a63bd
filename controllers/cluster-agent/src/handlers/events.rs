//! Feeds core `Event` objects into the audit log.

use super::KindHandler;
use crate::audit::AuditLog;
use crate::error::ControllerError;
use cluster_client::ResourceKindDescriptor;
use k8s_openapi::api::core::v1::Event;
use kube::core::DynamicObject;
use std::sync::Arc;

/// Appends Pod events to the audit log; deletes are ignored so history survives
/// event expiry.
#[derive(Debug)]
pub struct AuditEventHandler {
    audit: Arc<AuditLog>,
}

impl AuditEventHandler {
    /// Create a handler writing to `audit`
    #[must_use]
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self { audit }
    }
}

impl KindHandler for AuditEventHandler {
    fn name(&self) -> &'static str {
        "audit-events"
    }

    fn on_apply(&self, _kind: &ResourceKindDescriptor, obj: &DynamicObject) -> Result<(), ControllerError> {
        let value = serde_json::to_value(obj)?;
        let event: Event =
            serde_json::from_value(value).map_err(|e| ControllerError::MalformedObject(format!("Event: {e}")))?;
        self.audit.record_event(&event);
        Ok(())
    }

    fn on_delete(&self, _kind: &ResourceKindDescriptor, _obj: &DynamicObject) -> Result<(), ControllerError> {
        Ok(())
    }
}
