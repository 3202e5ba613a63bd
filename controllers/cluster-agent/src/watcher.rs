//! Dynamic multi-resource watcher.
//!
//! One long-lived task per watched kind opens a cluster-wide list+watch and
//! dispatches every event to the kind's handlers. Transient failures re-open
//! the watch (which re-lists) with exponential backoff; permission errors stop
//! that kind only. Each subscription publishes its state on a `watch` channel
//! so callers can wait for the initial list to complete.

use crate::backoff::ExponentialBackoff;
use crate::config::WatchRetryPolicy;
use crate::error::ControllerError;
use crate::handlers::HandlerRegistry;
use crate::metrics::Metrics;
use cluster_client::{ClusterClientTrait, ClusterError, ObjectRef, ResourceKindDescriptor, WatchEvent};
use futures::StreamExt;
use kube::core::DynamicObject;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of one kind's subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum WatchState {
    /// Initial list in progress
    Initializing,
    /// Initial list complete, streaming changes
    Synced,
    /// Disconnected, waiting before re-listing
    Retrying {
        /// Consecutive failed attempts
        attempt: u32,
    },
    /// Given up on this kind
    Failed {
        /// Last error
        reason: String,
        /// Whether the API server refused access
        permission_denied: bool,
    },
    /// Stopped on request
    Stopped,
}

impl WatchState {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Stopped)
    }
}

/// Read access to per-kind sync status
pub trait SyncStatus: Send + Sync {
    /// Whether the watch for `kind_key` has completed its latest list
    fn is_synced(&self, kind_key: &str) -> bool;
}

struct WatchSubscription {
    kind: ResourceKindDescriptor,
    stop: CancellationToken,
    state: watch::Receiver<WatchState>,
    task: JoinHandle<()>,
}

/// Owns every watch subscription
pub struct Watcher {
    client: Arc<dyn ClusterClientTrait>,
    registry: Arc<HandlerRegistry>,
    policy: WatchRetryPolicy,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
    subscriptions: Mutex<HashMap<String, WatchSubscription>>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("watched", &self.subscriptions.lock().len())
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Create a watcher; every subscription stops when `shutdown` is cancelled
    pub fn new(
        client: Arc<dyn ClusterClientTrait>,
        registry: Arc<HandlerRegistry>,
        policy: WatchRetryPolicy,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            registry,
            policy,
            metrics,
            shutdown,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Start watching `kind` and wait until its initial list has completed
    ///
    /// Fails with `AlreadyWatched` if a live subscription exists, with
    /// `WatchPermissionDenied` if the API server refuses access, and with
    /// `Watch` when retries are exhausted before the first sync.
    pub async fn start_watch(&self, kind: ResourceKindDescriptor) -> Result<(), ControllerError> {
        let kind_key = kind.kind_key();
        self.spawn_watch(kind)?;
        self.wait_for_sync(&kind_key).await
    }

    /// Register a subscription for `kind` without waiting for its initial list
    pub fn spawn_watch(&self, kind: ResourceKindDescriptor) -> Result<watch::Receiver<WatchState>, ControllerError> {
        let kind_key = kind.kind_key();
        let mut subscriptions = self.subscriptions.lock();
        if let Some(existing) = subscriptions.get(&kind_key)
            && !existing.state.borrow().is_terminal()
        {
            return Err(ControllerError::AlreadyWatched(kind_key));
        }

        let stop = self.shutdown.child_token();
        let (state_tx, state_rx) = watch::channel(WatchState::Initializing);
        let task = WatchTask {
            kind: kind.clone(),
            kind_key: kind_key.clone(),
            client: Arc::clone(&self.client),
            registry: Arc::clone(&self.registry),
            policy: self.policy.clone(),
            metrics: Arc::clone(&self.metrics),
            stop: stop.clone(),
            state: state_tx,
        };
        let handle = tokio::spawn(task.run());

        debug!("Registered watch for {}", kind_key);
        subscriptions.insert(
            kind_key,
            WatchSubscription {
                kind,
                stop,
                state: state_rx.clone(),
                task: handle,
            },
        );
        Ok(state_rx)
    }

    /// Wait until the subscription for `kind_key` has completed a list
    pub async fn wait_for_sync(&self, kind_key: &str) -> Result<(), ControllerError> {
        let state = self
            .subscriptions
            .lock()
            .get(kind_key)
            .map(|s| s.state.clone())
            .ok_or_else(|| ControllerError::NotWatched(kind_key.to_string()))?;
        wait_until_synced(kind_key, state).await
    }

    /// Stop watching `kind_key`
    ///
    /// Returns once the task has exited; no handler runs for this kind afterwards.
    pub async fn stop_watch(&self, kind_key: &str) -> Result<(), ControllerError> {
        let subscription = self
            .subscriptions
            .lock()
            .remove(kind_key)
            .ok_or_else(|| ControllerError::NotWatched(kind_key.to_string()))?;
        subscription.stop.cancel();
        if let Err(e) = subscription.task.await {
            warn!(kind = %kind_key, error = %e, "Watch task ended abnormally");
        }
        info!("Stopped watching {}", kind_key);
        Ok(())
    }

    /// Stop every subscription
    pub async fn stop_all(&self) {
        let drained: Vec<(String, WatchSubscription)> = self.subscriptions.lock().drain().collect();
        for (_, subscription) in &drained {
            subscription.stop.cancel();
        }
        for (kind_key, subscription) in drained {
            if let Err(e) = subscription.task.await {
                warn!(kind = %kind_key, error = %e, "Watch task ended abnormally");
            }
        }
    }

    /// Current state of the subscription for `kind_key`
    #[must_use]
    pub fn state(&self, kind_key: &str) -> Option<WatchState> {
        self.subscriptions
            .lock()
            .get(kind_key)
            .map(|s| s.state.borrow().clone())
    }

    /// Every subscription and its state, ordered by kind key
    #[must_use]
    pub fn list_watched(&self) -> Vec<(ResourceKindDescriptor, WatchState)> {
        let subscriptions = self.subscriptions.lock();
        let mut watched: Vec<(ResourceKindDescriptor, WatchState)> = subscriptions
            .values()
            .map(|s| (s.kind.clone(), s.state.borrow().clone()))
            .collect();
        watched.sort_by_key(|(kind, _)| kind.kind_key());
        watched
    }
}

impl SyncStatus for Watcher {
    fn is_synced(&self, kind_key: &str) -> bool {
        matches!(self.state(kind_key), Some(WatchState::Synced))
    }
}

async fn wait_until_synced(kind_key: &str, mut state: watch::Receiver<WatchState>) -> Result<(), ControllerError> {
    loop {
        let current = state.borrow_and_update().clone();
        match current {
            WatchState::Synced => return Ok(()),
            WatchState::Failed {
                reason,
                permission_denied: true,
            } => {
                return Err(ControllerError::WatchPermissionDenied {
                    kind: kind_key.to_string(),
                    reason,
                });
            }
            WatchState::Failed { reason, .. } => {
                return Err(ControllerError::Watch {
                    kind: kind_key.to_string(),
                    reason,
                });
            }
            WatchState::Stopped => {
                return Err(ControllerError::Watch {
                    kind: kind_key.to_string(),
                    reason: "stopped before initial sync".to_string(),
                });
            }
            WatchState::Initializing | WatchState::Retrying { .. } => {}
        }
        if state.changed().await.is_err() {
            return Err(ControllerError::Watch {
                kind: kind_key.to_string(),
                reason: "watch task exited".to_string(),
            });
        }
    }
}

/// How one watch session ended
enum SessionEnd {
    Stopped,
    PermissionDenied(String),
    Disconnected { reason: String, synced: bool },
}

struct WatchTask {
    kind: ResourceKindDescriptor,
    kind_key: String,
    client: Arc<dyn ClusterClientTrait>,
    registry: Arc<HandlerRegistry>,
    policy: WatchRetryPolicy,
    metrics: Arc<Metrics>,
    stop: CancellationToken,
    state: watch::Sender<WatchState>,
}

impl WatchTask {
    async fn run(self) {
        let mut backoff = ExponentialBackoff::new(
            self.policy.initial_backoff,
            self.policy.factor,
            self.policy.steps,
            self.policy.jitter,
        );
        let mut failures: u32 = 0;

        loop {
            match self.run_session().await {
                SessionEnd::Stopped => break,
                SessionEnd::PermissionDenied(reason) => {
                    error!(kind = %self.kind_key, error = %reason, "Watch permission denied, giving up on this kind");
                    self.state.send_replace(WatchState::Failed {
                        reason,
                        permission_denied: true,
                    });
                    return;
                }
                SessionEnd::Disconnected { reason, synced } => {
                    if synced {
                        failures = 0;
                        backoff.reset();
                    }
                    failures += 1;
                    if failures > self.policy.max_retries {
                        error!(
                            kind = %self.kind_key,
                            attempts = failures,
                            error = %reason,
                            "Watch retries exhausted, giving up on this kind"
                        );
                        self.state.send_replace(WatchState::Failed {
                            reason,
                            permission_denied: false,
                        });
                        return;
                    }

                    let delay = backoff.next_backoff();
                    warn!(
                        kind = %self.kind_key,
                        attempt = failures,
                        error = %reason,
                        "Watch disconnected, re-listing in {:?}",
                        delay
                    );
                    self.metrics.record_watch_restart(&self.kind_key);
                    self.state.send_replace(WatchState::Retrying { attempt: failures });

                    tokio::select! {
                        () = self.stop.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.state.send_replace(WatchState::Stopped);
        debug!("Watch task for {} exited", self.kind_key);
    }

    async fn run_session(&self) -> SessionEnd {
        let mut stream = self.client.watch(&self.kind);
        let mut relist: Option<HashSet<ObjectRef>> = None;
        let mut synced = false;

        loop {
            let next = tokio::select! {
                biased;
                () = self.stop.cancelled() => return SessionEnd::Stopped,
                next = stream.next() => next,
            };

            let event = match next {
                None => {
                    return SessionEnd::Disconnected {
                        reason: "watch stream ended".to_string(),
                        synced,
                    };
                }
                Some(Err(e)) if e.is_permission_denied() => return SessionEnd::PermissionDenied(e.to_string()),
                Some(Err(ClusterError::Malformed(reason))) => {
                    warn!(kind = %self.kind_key, error = %reason, "Skipping malformed watch event");
                    self.metrics.record_malformed(&self.kind_key);
                    continue;
                }
                Some(Err(e)) => {
                    return SessionEnd::Disconnected {
                        reason: e.to_string(),
                        synced,
                    };
                }
                Some(Ok(event)) => event,
            };

            match event {
                WatchEvent::Init => {
                    debug!("Listing {}", self.kind_key);
                    relist = Some(HashSet::new());
                }
                WatchEvent::InitApply(obj) => {
                    if let Some(key) = self.validate(&obj) {
                        relist.get_or_insert_with(HashSet::new).insert(key);
                        self.metrics.record_watch_event(&self.kind_key, "apply");
                        self.registry.dispatch_apply(&self.kind, &obj);
                    }
                }
                WatchEvent::InitDone => {
                    let live = relist.take().unwrap_or_default();
                    self.registry.dispatch_resync(&self.kind, &live);
                    synced = true;
                    info!("{} synced ({} objects)", self.kind_key, live.len());
                    self.state.send_replace(WatchState::Synced);
                }
                WatchEvent::Apply(obj) => {
                    if self.validate(&obj).is_some() {
                        self.metrics.record_watch_event(&self.kind_key, "apply");
                        self.registry.dispatch_apply(&self.kind, &obj);
                    }
                }
                WatchEvent::Delete(obj) => {
                    if self.validate(&obj).is_some() {
                        self.metrics.record_watch_event(&self.kind_key, "delete");
                        self.registry.dispatch_delete(&self.kind, &obj);
                    }
                }
            }
        }
    }

    fn validate(&self, obj: &DynamicObject) -> Option<ObjectRef> {
        let key = ObjectRef::from_object(obj);
        if key.is_none() {
            warn!(kind = %self.kind_key, "Skipping malformed object without a name");
            self.metrics.record_malformed(&self.kind_key);
        }
        key
    }
}
