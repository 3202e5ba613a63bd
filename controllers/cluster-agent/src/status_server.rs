//! Probe, status and metrics endpoints.
//!
//! - `GET /healthz`: process is up
//! - `GET /readyz`: 200 once every watch started at boot has synced
//! - `GET /status`: identity, leadership, reconciler status and watch states
//! - `GET /metrics`: Prometheus text format

use crate::audit::{AuditLog, AuditRecord};
use crate::error::ControllerError;
use crate::leader::LeadershipState;
use crate::metrics::Metrics;
use crate::owner_cache::OwnerCache;
use crate::reconciler::{Reconciler, ReconcilerStatus};
use crate::store::Store;
use crate::watcher::{SyncStatus, WatchState, Watcher};
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Kinds whose initial sync gates readiness
#[derive(Debug, Default)]
pub struct Readiness {
    boot_kinds: RwLock<Option<Vec<String>>>,
}

impl Readiness {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the kinds started at boot; readiness is reported from now on
    pub fn mark_started(&self, kind_keys: Vec<String>) {
        *self.boot_kinds.write() = Some(kind_keys);
    }

    /// Drop a kind that is no longer watched from the boot set
    pub fn forget(&self, kind_key: &str) {
        if let Some(kinds) = self.boot_kinds.write().as_mut() {
            kinds.retain(|k| k != kind_key);
        }
    }

    /// Whether boot finished and every boot kind is synced
    #[must_use]
    pub fn is_ready(&self, sync: &dyn SyncStatus) -> bool {
        self.boot_kinds
            .read()
            .as_ref()
            .is_some_and(|kinds| kinds.iter().all(|k| sync.is_synced(k)))
    }
}

/// Shared state of the status endpoints
#[derive(Clone)]
pub struct StatusState {
    pub identity: String,
    pub watcher: Arc<Watcher>,
    pub leadership: watch::Receiver<LeadershipState>,
    pub reconciler: Arc<Reconciler>,
    pub metrics: Arc<Metrics>,
    pub readiness: Arc<Readiness>,
    pub store: Arc<Store>,
    pub owners: Arc<OwnerCache>,
    pub audit: Arc<AuditLog>,
}

impl std::fmt::Debug for StatusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusState")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WatchStatus {
    kind_key: String,
    api_version: String,
    state: WatchState,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentStatus {
    identity: String,
    leadership: LeadershipState,
    reconciler: ReconcilerStatus,
    watches: Vec<WatchStatus>,
    stored_objects: BTreeMap<String, usize>,
    resolved_owners: usize,
}

/// Build the status router
pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/owners/{namespace}/{pod}", get(owner))
        .route("/audit", get(audit_keys))
        .route("/audit/{namespace}/{controller}", get(audit_records))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the status router on `addr` until `shutdown` fires
pub async fn serve(addr: SocketAddr, state: StatusState, shutdown: CancellationToken) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::StatusServer(format!("bind {addr}: {e}")))?;
    info!("Status server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| ControllerError::StatusServer(e.to_string()))
}

async fn readyz(State(state): State<StatusState>) -> Response {
    if state.readiness.is_ready(state.watcher.as_ref()) {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "watches not synced").into_response()
    }
}

async fn status(State(state): State<StatusState>) -> Json<AgentStatus> {
    let watches = state
        .watcher
        .list_watched()
        .into_iter()
        .map(|(kind, state)| WatchStatus {
            kind_key: kind.kind_key(),
            api_version: kind.api_version(),
            state,
        })
        .collect();

    Json(AgentStatus {
        identity: state.identity.clone(),
        leadership: state.leadership.borrow().clone(),
        reconciler: state.reconciler.status(),
        watches,
        stored_objects: state
            .store
            .kinds()
            .into_iter()
            .map(|kind| {
                let count = state.store.len(&kind);
                (kind, count)
            })
            .collect(),
        resolved_owners: state.owners.resolved_count(),
    })
}

async fn owner(State(state): State<StatusState>, Path((namespace, pod)): Path<(String, String)>) -> Response {
    match state.owners.controller_for_pod(&namespace, &pod) {
        Some(workload) => Json(workload).into_response(),
        None => (StatusCode::NOT_FOUND, format!("pod {namespace}/{pod} not found")).into_response(),
    }
}

async fn audit_keys(State(state): State<StatusState>) -> Json<Vec<String>> {
    Json(state.audit.keys())
}

async fn audit_records(
    State(state): State<StatusState>,
    Path((namespace, controller)): Path<(String, String)>,
) -> Json<Vec<AuditRecord>> {
    Json(state.audit.records_for_controller(&namespace, &controller))
}

async fn metrics(State(state): State<StatusState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
