//! Agent orchestration.
//!
//! Builds every component from the configuration, runs discovery and the
//! boot watches, then keeps leader election, the reconciler, periodic
//! rediscovery and the status server running until SIGINT/SIGTERM. Shutdown
//! cancels a shared token, waits a bounded grace period for the tasks,
//! releases leadership, stops every watch and clears the store.

use crate::audit::AuditLog;
use crate::config::AgentConfig;
use crate::discovery::ResourceDiscovery;
use crate::error::ControllerError;
use crate::handlers::{AuditEventHandler, HandlerRegistry, ReconcileTrigger, StoreSyncHandler, YamlExporter};
use crate::leader::LeaderElector;
use crate::metrics::Metrics;
use crate::owner_cache::OwnerCache;
use crate::reconciler::{self, Reconciler};
use crate::status_server::{self, Readiness, StatusState};
use crate::store::Store;
use crate::watcher::{SyncStatus, Watcher};
use cluster_client::{ClusterClientTrait, KubeClusterClient, LeaseClientTrait, ResourceKindDescriptor};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The running agent and its shared components
pub struct Controller {
    config: AgentConfig,
    store: Arc<Store>,
    owners: Arc<OwnerCache>,
    audit: Arc<AuditLog>,
    metrics: Arc<Metrics>,
    watcher: Arc<Watcher>,
    discovery: Arc<ResourceDiscovery>,
    elector: Arc<LeaderElector>,
    reconciler: Arc<Reconciler>,
    readiness: Arc<Readiness>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("identity", &self.config.leader.identity())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Connect to the cluster (in-cluster service account or kubeconfig) and
    /// build the agent
    pub async fn new(config: AgentConfig) -> Result<Self, ControllerError> {
        info!("Initializing cluster agent");
        let client = Arc::new(KubeClusterClient::try_default().await?);
        let cluster: Arc<dyn ClusterClientTrait> = client.clone();
        let leases: Arc<dyn LeaseClientTrait> = client;
        Self::with_clients(config, cluster, leases)
    }

    /// Build the agent on top of the given API clients
    pub fn with_clients(
        config: AgentConfig,
        cluster: Arc<dyn ClusterClientTrait>,
        leases: Arc<dyn LeaseClientTrait>,
    ) -> Result<Self, ControllerError> {
        let shutdown = CancellationToken::new();
        let metrics = Arc::new(Metrics::new()?);
        let store = Arc::new(Store::new());
        let audit = Arc::new(AuditLog::new(
            config.audit_capacity,
            config.audit_ignored_namespaces.clone(),
        ));
        let owners = Arc::new(OwnerCache::new(Arc::clone(&store)));

        // The reconciler reads its inputs from the store
        let mut stored_kinds = config.store_kinds.clone();
        for kind in reconciler::input_kinds() {
            let key = kind.kind_key();
            if !config.stores_kind(&key) {
                stored_kinds.push(key);
            }
        }

        let mut registry = HandlerRegistry::new();
        registry.register_all(Arc::new(StoreSyncHandler::new(Arc::clone(&store), stored_kinds)));
        registry.register("Event", Arc::new(AuditEventHandler::new(Arc::clone(&audit))));
        registry.register("Pod", owners.clone());

        // Bindings are the reconciler's own output; drift there waits for the periodic pass
        let trigger = ReconcileTrigger::new();
        let trigger_handler = Arc::new(trigger.clone());
        for kind in reconciler::input_kinds() {
            if !kind.kind.ends_with("Binding") {
                registry.register(&kind.kind_key(), trigger_handler.clone());
            }
        }
        if let Some(dir) = &config.export_dir {
            let exporter = Arc::new(YamlExporter::new(dir.clone()));
            for kind_key in &config.export_kinds {
                registry.register(kind_key, exporter.clone());
            }
            info!("Exporting {:?} to {}", config.export_kinds, dir.display());
        }

        let watcher = Arc::new(Watcher::new(
            Arc::clone(&cluster),
            Arc::new(registry),
            config.watch_retry.clone(),
            Arc::clone(&metrics),
            shutdown.clone(),
        ));
        let discovery = Arc::new(ResourceDiscovery::new(
            Arc::clone(&cluster),
            config.watch_denylist.clone(),
        ));
        let elector = Arc::new(LeaderElector::new(leases, config.leader.clone()).with_metrics(Arc::clone(&metrics)));
        let sync: Arc<dyn SyncStatus> = watcher.clone();
        let reconciler = Arc::new(Reconciler::new(
            cluster,
            Arc::clone(&store),
            sync,
            elector.subscribe(),
            &config.label_prefix,
            config.reconcile_interval,
            Arc::clone(&metrics),
        )
        .with_trigger(trigger));

        Ok(Self {
            config,
            store,
            owners,
            audit,
            metrics,
            watcher,
            discovery,
            elector,
            reconciler,
            readiness: Arc::new(Readiness::new()),
            shutdown,
        })
    }

    /// Run until SIGINT or SIGTERM
    pub async fn run(self) -> Result<(), ControllerError> {
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| ControllerError::InvalidConfig(format!("failed to install SIGTERM handler: {e}")))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| ControllerError::InvalidConfig(format!("failed to install SIGINT handler: {e}")))?;

        let token = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
                _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
                () = token.cancelled() => {}
            }
            token.cancel();
        });

        self.run_until_cancelled().await
    }

    /// Run until the shutdown token is cancelled, then tear down
    pub async fn run_until_cancelled(&self) -> Result<(), ControllerError> {
        info!(identity = %self.config.leader.identity(), "Cluster agent running");
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let status = StatusState {
            identity: self.config.leader.identity().to_string(),
            watcher: Arc::clone(&self.watcher),
            leadership: self.elector.subscribe(),
            reconciler: Arc::clone(&self.reconciler),
            metrics: Arc::clone(&self.metrics),
            readiness: Arc::clone(&self.readiness),
            store: Arc::clone(&self.store),
            owners: Arc::clone(&self.owners),
            audit: Arc::clone(&self.audit),
        };
        let (addr, token) = (self.config.status_addr, self.shutdown.clone());
        tasks.push((
            "status-server",
            tokio::spawn(async move {
                if let Err(e) = status_server::serve(addr, status, token).await {
                    error!(error = %e, "Status server stopped");
                }
            }),
        ));

        let (elector, token) = (Arc::clone(&self.elector), self.shutdown.clone());
        tasks.push(("leader-election", tokio::spawn(async move { elector.run(token).await })));

        match self.boot().await {
            Ok(()) => {
                let (reconciler, token) = (Arc::clone(&self.reconciler), self.shutdown.clone());
                tasks.push(("reconciler", tokio::spawn(async move { reconciler.run(token).await })));

                let discovery = Arc::clone(&self.discovery);
                let watcher = Arc::clone(&self.watcher);
                let readiness = Arc::clone(&self.readiness);
                let (interval, token) = (self.config.rediscovery_interval, self.shutdown.clone());
                tasks.push((
                    "rediscovery",
                    tokio::spawn(async move { rediscover(&discovery, &watcher, &readiness, interval, token).await }),
                ));

                self.shutdown.cancelled().await;
            }
            Err(ControllerError::Shutdown) => {}
            Err(e) => {
                error!(error = %e, "Boot failed");
                self.shutdown.cancel();
                self.teardown(tasks).await;
                return Err(e);
            }
        }

        self.teardown(tasks).await;
        Ok(())
    }

    /// Discover kinds and start one watch per kind concurrently
    async fn boot(&self) -> Result<(), ControllerError> {
        let kinds = self
            .discovery
            .discover_with_retry(&self.config.watch_retry, &self.shutdown)
            .await?
            .kinds;

        info!("Starting {} watches", kinds.len());
        let starts = kinds.into_iter().map(|kind| {
            let watcher = Arc::clone(&self.watcher);
            async move {
                let kind_key = kind.kind_key();
                (kind_key, watcher.start_watch(kind).await)
            }
        });

        let results = tokio::select! {
            () = self.shutdown.cancelled() => return Err(ControllerError::Shutdown),
            results = join_all(starts) => results,
        };

        let mut started = Vec::new();
        for (kind_key, result) in results {
            match result {
                Ok(()) => started.push(kind_key),
                Err(ControllerError::WatchPermissionDenied { reason, .. }) => {
                    warn!(kind = %kind_key, error = %reason, "Not permitted to watch, skipping");
                }
                Err(e) => warn!(kind = %kind_key, error = %e, "Watch failed to start"),
            }
        }
        info!("{} watches synced", started.len());
        self.readiness.mark_started(started);
        Ok(())
    }

    async fn teardown(&self, tasks: Vec<(&'static str, JoinHandle<()>)>) {
        let grace = self.config.shutdown_grace;
        info!(grace_seconds = grace.as_secs(), "Starting graceful shutdown");

        let mut pending = Vec::new();
        for (name, mut task) in tasks {
            match tokio::time::timeout(grace, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = name, error = %e, "Task ended abnormally"),
                Err(_) => {
                    warn!(task = name, "Task did not stop within the grace period, aborting");
                    task.abort();
                    pending.push(name);
                }
            }
        }

        // No-op when the election task already released the lease
        self.elector.release().await;
        if tokio::time::timeout(grace, self.watcher.stop_all()).await.is_err() {
            warn!("Watches did not stop within the grace period");
        }
        self.store.clear();
        if pending.is_empty() {
            info!("Shutdown complete");
        } else {
            warn!(aborted = ?pending, "Shutdown complete with aborted tasks");
        }
    }
}

/// Start watches for newly served kinds and stop those no longer served
///
/// Kinds of an API group whose discovery failed keep their watches. Stopped
/// kinds no longer count towards readiness. Returns the number of watches
/// started and stopped.
pub async fn sync_watched_kinds(
    discovery: &ResourceDiscovery,
    watcher: &Watcher,
    readiness: &Readiness,
) -> Result<(usize, usize), ControllerError> {
    let discovered = discovery.discover().await?;
    let watched: Vec<ResourceKindDescriptor> = watcher.list_watched().into_iter().map(|(kind, _)| kind).collect();
    let watched_keys: HashSet<String> = watched.iter().map(ResourceKindDescriptor::kind_key).collect();
    let served: HashSet<String> = discovered.kinds.iter().map(ResourceKindDescriptor::kind_key).collect();

    let mut started = 0;
    for kind in discovered.kinds {
        let kind_key = kind.kind_key();
        if watched_keys.contains(&kind_key) {
            continue;
        }
        match watcher.spawn_watch(kind) {
            Ok(_) => {
                info!(kind = %kind_key, "Watching newly served kind");
                started += 1;
            }
            Err(e) => warn!(kind = %kind_key, error = %e, "Failed to watch newly served kind"),
        }
    }

    let mut stopped = 0;
    for kind in watched {
        let kind_key = kind.kind_key();
        if served.contains(&kind_key) {
            continue;
        }
        if discovered.failed_groups.contains(&kind.group) {
            debug!(kind = %kind_key, group = %kind.group, "Group discovery failed, keeping watch");
            continue;
        }
        match watcher.stop_watch(&kind_key).await {
            Ok(()) => {
                info!(kind = %kind_key, "Kind no longer served, stopped watching");
                readiness.forget(&kind_key);
                stopped += 1;
            }
            Err(e) => warn!(kind = %kind_key, error = %e, "Failed to stop watch"),
        }
    }
    Ok((started, stopped))
}

async fn rediscover(
    discovery: &ResourceDiscovery,
    watcher: &Watcher,
    readiness: &Readiness,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Boot already ran the first discovery
    ticker.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = sync_watched_kinds(discovery, watcher, readiness).await {
            warn!(error = %e, "Rediscovery failed, keeping current watches");
        }
    }
}
