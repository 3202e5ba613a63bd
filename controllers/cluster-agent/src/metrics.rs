//! Prometheus metrics exposed on `/metrics`.

use crate::error::ControllerError;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Agent metrics, registered in a private registry
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    watch_events: IntCounterVec,
    watch_restarts: IntCounterVec,
    malformed_objects: IntCounterVec,
    is_leader: IntGauge,
    leadership_transitions: IntCounter,
    reconcile_passes: IntCounterVec,
    reconcile_actions: IntCounterVec,
}

impl Metrics {
    /// Create and register every metric
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new();

        let watch_events = IntCounterVec::new(
            Opts::new("cluster_agent_watch_events_total", "Watch events dispatched to handlers"),
            &["kind", "event"],
        )?;
        let watch_restarts = IntCounterVec::new(
            Opts::new("cluster_agent_watch_restarts_total", "Watch re-lists after a disconnect"),
            &["kind"],
        )?;
        let malformed_objects = IntCounterVec::new(
            Opts::new("cluster_agent_malformed_objects_total", "Watch events skipped as malformed"),
            &["kind"],
        )?;
        let is_leader = IntGauge::new("cluster_agent_is_leader", "1 while this replica holds the lease")?;
        let leadership_transitions = IntCounter::new(
            "cluster_agent_leadership_transitions_total",
            "Times this replica gained or lost leadership",
        )?;
        let reconcile_passes = IntCounterVec::new(
            Opts::new("cluster_agent_reconcile_passes_total", "Reconcile passes by outcome"),
            &["outcome"],
        )?;
        let reconcile_actions = IntCounterVec::new(
            Opts::new("cluster_agent_reconcile_actions_total", "RBAC writes issued by the reconciler"),
            &["action", "result"],
        )?;

        registry.register(Box::new(watch_events.clone()))?;
        registry.register(Box::new(watch_restarts.clone()))?;
        registry.register(Box::new(malformed_objects.clone()))?;
        registry.register(Box::new(is_leader.clone()))?;
        registry.register(Box::new(leadership_transitions.clone()))?;
        registry.register(Box::new(reconcile_passes.clone()))?;
        registry.register(Box::new(reconcile_actions.clone()))?;

        Ok(Self {
            registry,
            watch_events,
            watch_restarts,
            malformed_objects,
            is_leader,
            leadership_transitions,
            reconcile_passes,
            reconcile_actions,
        })
    }

    pub fn record_watch_event(&self, kind: &str, event: &str) {
        self.watch_events.with_label_values(&[kind, event]).inc();
    }

    pub fn record_watch_restart(&self, kind: &str) {
        self.watch_restarts.with_label_values(&[kind]).inc();
    }

    pub fn record_malformed(&self, kind: &str) {
        self.malformed_objects.with_label_values(&[kind]).inc();
    }

    pub fn set_leader(&self, leader: bool) {
        self.is_leader.set(i64::from(leader));
    }

    pub fn record_leadership_transition(&self) {
        self.leadership_transitions.inc();
    }

    /// `outcome` is one of `converged`, `partial` or `skipped`
    pub fn record_reconcile_pass(&self, outcome: &str) {
        self.reconcile_passes.with_label_values(&[outcome]).inc();
    }

    pub fn record_reconcile_action(&self, action: &str, result: &str) {
        self.reconcile_actions.with_label_values(&[action, result]).inc();
    }

    /// Render every metric in the Prometheus text format
    pub fn encode(&self) -> Result<String, ControllerError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ControllerError::InvalidConfig(format!("metrics encoding: {e}")))
    }
}
