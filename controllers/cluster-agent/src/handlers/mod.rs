//! Per-kind watch event handlers
//!
//! Every watch task dispatches its events through a `HandlerRegistry`: a map
//! from kind key to the handlers interested in that kind, plus catch-all
//! handlers that see every kind. The registry is populated once at startup.
//!
//! - `store_sync`: keeps the in-memory `Store` in step with the cluster
//! - `events`: appends Pod events to the audit log
//! - `reconcile_trigger`: wakes the reconciler when one of its inputs changes
//! - `yaml_export`: mirrors selected kinds to YAML files on disk

pub mod events;
pub mod reconcile_trigger;
pub mod store_sync;
pub mod yaml_export;

pub use events::AuditEventHandler;
pub use reconcile_trigger::ReconcileTrigger;
pub use store_sync::StoreSyncHandler;
pub use yaml_export::YamlExporter;

use crate::error::ControllerError;
use cluster_client::{ObjectRef, ResourceKindDescriptor};
use kube::core::DynamicObject;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// Reacts to watch events for one or more kinds
///
/// Handlers run inline on the kind's watch task and must tolerate
/// at-least-once delivery: the same object may be applied repeatedly, and a
/// resync replays every live object.
pub trait KindHandler: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Object added or modified (also called for every object of a relist)
    fn on_apply(&self, kind: &ResourceKindDescriptor, obj: &DynamicObject) -> Result<(), ControllerError>;

    /// Object deleted
    fn on_delete(&self, kind: &ResourceKindDescriptor, obj: &DynamicObject) -> Result<(), ControllerError>;

    /// A full relist finished; `live` holds every object it returned
    fn on_resync(&self, _kind: &ResourceKindDescriptor, _live: &HashSet<ObjectRef>) -> Result<(), ControllerError> {
        Ok(())
    }
}

/// Kind key to handler dispatch table
#[derive(Default)]
pub struct HandlerRegistry {
    by_kind: HashMap<String, Vec<Arc<dyn KindHandler>>>,
    catch_all: Vec<Arc<dyn KindHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<&String> = self.by_kind.keys().collect();
        f.debug_struct("HandlerRegistry")
            .field("kinds", &kinds)
            .field("catch_all", &self.catch_all.len())
            .finish()
    }
}

impl HandlerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for a single kind key
    pub fn register(&mut self, kind_key: &str, handler: Arc<dyn KindHandler>) {
        self.by_kind.entry(kind_key.to_string()).or_default().push(handler);
    }

    /// Register `handler` for every kind
    pub fn register_all(&mut self, handler: Arc<dyn KindHandler>) {
        self.catch_all.push(handler);
    }

    /// Handlers for `kind_key`: catch-all handlers first, then kind-specific ones
    #[must_use]
    pub fn handlers_for(&self, kind_key: &str) -> Vec<Arc<dyn KindHandler>> {
        let mut handlers: Vec<Arc<dyn KindHandler>> = self.catch_all.iter().map(Arc::clone).collect();
        if let Some(specific) = self.by_kind.get(kind_key) {
            handlers.extend(specific.iter().map(Arc::clone));
        }
        handlers
    }

    /// Run every handler's `on_apply`; a failing handler does not stop the others.
    /// Returns the number of handler failures.
    pub fn dispatch_apply(&self, kind: &ResourceKindDescriptor, obj: &DynamicObject) -> usize {
        self.dispatch(kind, obj, "apply", |h| h.on_apply(kind, obj))
    }

    /// Run every handler's `on_delete`; returns the number of handler failures
    pub fn dispatch_delete(&self, kind: &ResourceKindDescriptor, obj: &DynamicObject) -> usize {
        self.dispatch(kind, obj, "delete", |h| h.on_delete(kind, obj))
    }

    /// Run every handler's `on_resync`; returns the number of handler failures
    pub fn dispatch_resync(&self, kind: &ResourceKindDescriptor, live: &HashSet<ObjectRef>) -> usize {
        let kind_key = kind.kind_key();
        let mut failures = 0;
        for handler in self.handlers_for(&kind_key) {
            if let Err(e) = handler.on_resync(kind, live) {
                failures += 1;
                warn!(kind = %kind_key, handler = handler.name(), error = %e, "Resync handler failed");
            }
        }
        failures
    }

    fn dispatch<F>(&self, kind: &ResourceKindDescriptor, obj: &DynamicObject, action: &str, call: F) -> usize
    where
        F: Fn(&dyn KindHandler) -> Result<(), ControllerError>,
    {
        let kind_key = kind.kind_key();
        let mut failures = 0;
        for handler in self.handlers_for(&kind_key) {
            if let Err(e) = call(handler.as_ref()) {
                failures += 1;
                warn!(
                    kind = %kind_key,
                    namespace = obj.metadata.namespace.as_deref().unwrap_or(""),
                    name = obj.metadata.name.as_deref().unwrap_or(""),
                    handler = handler.name(),
                    action,
                    error = %e,
                    "Watch event handler failed"
                );
            }
        }
        failures
    }
}
