//! Resource discovery.
//!
//! Asks the API server for every served kind and keeps the ones the agent can
//! list and watch, minus a configurable denylist. Each API group is queried
//! separately so one broken aggregated API does not hide the rest.

use crate::backoff::ExponentialBackoff;
use crate::config::WatchRetryPolicy;
use crate::error::ControllerError;
use cluster_client::{ClusterClientTrait, ResourceKindDescriptor};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one discovery pass
#[derive(Debug, Clone, Default)]
pub struct DiscoveredKinds {
    /// Watchable kinds, preferred version first
    pub kinds: Vec<ResourceKindDescriptor>,
    /// API groups whose discovery failed this pass
    pub failed_groups: HashSet<String>,
}

/// Discovers watchable resource kinds
pub struct ResourceDiscovery {
    client: Arc<dyn ClusterClientTrait>,
    denylist: HashSet<String>,
}

impl std::fmt::Debug for ResourceDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceDiscovery")
            .field("denylist", &self.denylist)
            .finish_non_exhaustive()
    }
}

impl ResourceDiscovery {
    /// Create a discovery helper excluding the given kind keys
    pub fn new(client: Arc<dyn ClusterClientTrait>, denylist: impl IntoIterator<Item = String>) -> Self {
        Self {
            client,
            denylist: denylist.into_iter().collect(),
        }
    }

    /// All kinds supporting list and watch, excluding denied kinds
    ///
    /// When a kind is served in several groups, each group's entry is kept;
    /// within a kind key the first (preferred) version wins. Groups that fail
    /// are skipped and reported in `failed_groups`; the pass fails only when
    /// the group list itself or every group is unavailable.
    pub async fn discover(&self) -> Result<DiscoveredKinds, ControllerError> {
        let groups = self
            .client
            .list_api_groups()
            .await
            .map_err(|e| ControllerError::Discovery(e.to_string()))?;

        let mut discovered = DiscoveredKinds::default();
        let mut seen = HashSet::new();
        let mut last_error = None;
        for group in &groups {
            let served = match self.client.discover_group(group).await {
                Ok(served) => served,
                Err(e) => {
                    warn!(group = %group, error = %e, "Discovery of API group failed, skipping");
                    discovered.failed_groups.insert(group.clone());
                    last_error = Some(e);
                    continue;
                }
            };
            for kind in served {
                let key = kind.kind_key();
                if !kind.is_watchable() {
                    debug!("Skipping {} (verbs: {:?})", key, kind.verbs);
                    continue;
                }
                if self.denylist.contains(&key) {
                    debug!("Skipping denied kind {}", key);
                    continue;
                }
                if seen.insert(key) {
                    discovered.kinds.push(kind);
                }
            }
        }

        if discovered.failed_groups.len() == groups.len()
            && let Some(e) = last_error
        {
            return Err(ControllerError::Discovery(e.to_string()));
        }
        Ok(discovered)
    }

    /// Retry `discover` with backoff until it succeeds or `shutdown` fires
    pub async fn discover_with_retry(
        &self,
        policy: &WatchRetryPolicy,
        shutdown: &CancellationToken,
    ) -> Result<DiscoveredKinds, ControllerError> {
        let mut backoff = ExponentialBackoff::new(policy.initial_backoff, policy.factor, policy.steps, policy.jitter);
        loop {
            match self.discover().await {
                Ok(discovered) => {
                    info!(
                        failed_groups = discovered.failed_groups.len(),
                        "Discovered {} watchable resource kinds",
                        discovered.kinds.len()
                    );
                    return Ok(discovered);
                }
                Err(e) => {
                    let delay = backoff.next_backoff();
                    warn!(error = %e, attempt = backoff.attempts(), "Discovery failed, retrying in {:?}", delay);
                    tokio::select! {
                        () = shutdown.cancelled() => return Err(ControllerError::Shutdown),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
