//! Cluster Agent
//!
//! Runs on every replica of the agent deployment:
//! - Discovers every resource kind supporting list+watch and keeps one watch per kind
//! - Caches selected kinds in an in-memory store and records Pod events
//! - Elects a single leader through a coordination Lease
//! - On the leader, reconciles RoleBindings from Grant, User and Workspace objects
//!
//! Probes, status and metrics are served over HTTP (see `status_server`).

mod audit;
mod backoff;
mod config;
mod controller;
mod discovery;
mod error;
mod handlers;
mod leader;
mod metrics;
mod owner_cache;
mod reconciler;
mod status_server;
mod store;
mod test_utils;
mod watcher;

use crate::config::AgentConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube's rustls backend needs a process-wide crypto provider
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting Cluster Agent");

    let config = AgentConfig::from_env()?;

    info!("Configuration:");
    info!("  Identity: {}", config.leader.identity());
    info!(
        "  Lease: {}/{} (ttl {:?}, renew {:?})",
        config.leader.namespace(),
        config.leader.lease_name(),
        config.leader.lease_duration(),
        config.leader.renew_interval()
    );
    info!("  Reconcile interval: {:?}", config.reconcile_interval);
    info!("  Rediscovery interval: {:?}", config.rediscovery_interval);
    info!("  Stored kinds: {:?}", config.store_kinds);
    info!("  Watch denylist: {:?}", config.watch_denylist);
    info!(
        "  YAML export: {}",
        config
            .export_dir
            .as_ref()
            .map_or_else(|| "disabled".to_string(), |dir| dir.display().to_string())
    );
    info!("  Status address: {}", config.status_addr);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
