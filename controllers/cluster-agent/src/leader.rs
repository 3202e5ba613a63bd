//! Lease-based leader election.
//!
//! Every replica runs a `LeaderElector` against the same coordination Lease.
//! Acquisition, renewal and takeover are compare-and-swap writes on the
//! lease's resourceVersion, so at most one replica holds it at a time.
//! Leadership is published on a `watch` channel; readers never block.
//!
//! ```text
//!  Candidate ──acquire──► Leader ──renew failures / lost CAS──► Follower
//!      │    ▲                                                    │
//!      │    └──────────────lease expired or released─────────────┘
//!      └──held by other──► Follower
//! ```
//!
//! Every lease call is bounded by the renew deadline, and a leader whose
//! last successful renewal is older than the TTL no longer reports itself
//! as leader, even while a renewal is still in flight.

use crate::error::ControllerError;
use crate::metrics::Metrics;
use chrono::{DateTime, Utc};
use cluster_client::{ClusterError, LeaseClientTrait, LeaseRecord, LeaseSpecRecord};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consecutive renewal failures after which a leader steps down
const MAX_RENEWAL_FAILURES: u32 = 2;

/// Leader election settings
///
/// Fields are private so the renew/TTL relationship always holds; build one
/// with [`LeaderElectionConfig::new`].
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
}

impl LeaderElectionConfig {
    /// Validated configuration
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if a name is empty, the lease duration is under one
    /// second or not a whole number of seconds (the Lease stores seconds),
    /// the retry interval is zero, or `2 * renew_interval >= lease_duration`
    /// (a single missed renewal must not lose the lease).
    pub fn new(
        lease_name: String,
        namespace: String,
        identity: String,
        lease_duration: Duration,
        renew_interval: Duration,
        retry_interval: Duration,
    ) -> Result<Self, ControllerError> {
        if lease_name.is_empty() || namespace.is_empty() || identity.is_empty() {
            return Err(ControllerError::InvalidConfig(
                "lease name, namespace and identity must not be empty".to_string(),
            ));
        }
        if lease_duration < Duration::from_secs(1) {
            return Err(ControllerError::InvalidConfig(format!(
                "lease duration ({lease_duration:?}) must be at least one second"
            )));
        }
        if lease_duration.subsec_nanos() != 0 || i32::try_from(lease_duration.as_secs()).is_err() {
            return Err(ControllerError::InvalidConfig(format!(
                "lease duration ({lease_duration:?}) must be a whole number of seconds that fits the Lease"
            )));
        }
        if renew_interval.is_zero() || retry_interval.is_zero() {
            return Err(ControllerError::InvalidConfig(
                "renew and retry intervals must be greater than zero".to_string(),
            ));
        }
        if renew_interval * 2 >= lease_duration {
            return Err(ControllerError::InvalidConfig(format!(
                "renew interval ({renew_interval:?}) must be less than half the lease duration ({lease_duration:?})"
            )));
        }
        Ok(Self {
            lease_name,
            namespace,
            identity,
            lease_duration,
            renew_interval,
            retry_interval,
        })
    }

    /// Name of the Lease object
    #[must_use]
    pub fn lease_name(&self) -> &str {
        &self.lease_name
    }

    /// Namespace of the Lease object
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// This replica's holder identity
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Lease TTL
    #[must_use]
    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// Interval between renewals while leader
    #[must_use]
    pub fn renew_interval(&self) -> Duration {
        self.renew_interval
    }

    /// Interval between acquisition attempts while not leader
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Upper bound on a single lease API call
    ///
    /// Half the TTL: longer than the renew interval, and short enough that a
    /// stalled call is abandoned before the lease lapses.
    #[must_use]
    pub fn renew_deadline(&self) -> Duration {
        self.lease_duration / 2
    }

    // Whole seconds by construction
    fn lease_duration_seconds(&self) -> i32 {
        i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }
}

/// Election role of this replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LeaderRole {
    /// Not yet attempted, or contending for a free lease
    Candidate,
    /// Holds the lease
    Leader,
    /// Another replica holds the lease, or ours could not be renewed
    Follower,
}

/// Snapshot published on every role or holder change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadershipState {
    /// Current role
    pub role: LeaderRole,
    /// Shorthand for `role == Leader`
    pub is_leader: bool,
    /// Last observed holder
    pub holder: Option<String>,
    /// Last observed expiry of the lease
    pub lease_expiry: Option<DateTime<Utc>>,
}

impl LeadershipState {
    /// Whether this snapshot grants leadership at `now`
    ///
    /// A leader whose lease expiry has passed does not hold the lease, no
    /// matter what the role says.
    #[must_use]
    pub fn holds_lease_at(&self, now: DateTime<Utc>) -> bool {
        self.is_leader && self.lease_expiry.is_some_and(|expiry| now < expiry)
    }

    /// [`holds_lease_at`](Self::holds_lease_at) for the current time
    #[must_use]
    pub fn holds_lease(&self) -> bool {
        self.holds_lease_at(Utc::now())
    }
}

impl Default for LeadershipState {
    fn default() -> Self {
        Self {
            role: LeaderRole::Candidate,
            is_leader: false,
            holder: None,
            lease_expiry: None,
        }
    }
}

/// Runs the election loop for one replica
pub struct LeaderElector {
    client: Arc<dyn LeaseClientTrait>,
    config: LeaderElectionConfig,
    state: watch::Sender<LeadershipState>,
    metrics: Option<Arc<Metrics>>,
    failures: Mutex<u32>,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("config", &self.config)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl LeaderElector {
    /// Create an elector; nothing happens until [`run`](Self::run)
    pub fn new(client: Arc<dyn LeaseClientTrait>, config: LeaderElectionConfig) -> Self {
        let (state, _) = watch::channel(LeadershipState::default());
        Self {
            client,
            config,
            state,
            metrics: None,
            failures: Mutex::new(0),
        }
    }

    /// Report leadership on the given metrics
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Whether this replica currently holds an unexpired lease
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.state.borrow().holds_lease()
    }

    fn role(&self) -> LeaderRole {
        self.state.borrow().role
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, ClusterError>
    where
        F: std::future::Future<Output = Result<T, ClusterError>>,
    {
        let deadline = self.config.renew_deadline();
        tokio::time::timeout(deadline, call)
            .await
            .map_err(|_| ClusterError::Transient(format!("lease call exceeded renew deadline of {deadline:?}")))?
    }

    /// Receiver notified on every leadership change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.state.subscribe()
    }

    /// Acquire and renew until `shutdown`, then release the lease
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            identity = %self.config.identity,
            lease = %self.config.lease_name,
            namespace = %self.config.namespace,
            "Starting leader election"
        );

        loop {
            let delay = self.tick().await;
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.release().await;
    }

    /// One election attempt; returns the delay before the next
    async fn tick(&self) -> Duration {
        match self.try_acquire_or_renew().await {
            Ok(true) => {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    info!(previous_failures = *failures, "Lease renewed after transient failures");
                }
                *failures = 0;
                self.config.renew_interval
            }
            Ok(false) => {
                *self.failures.lock() = 0;
                self.config.retry_interval
            }
            Err(e) => {
                let failures = {
                    let mut failures = self.failures.lock();
                    *failures += 1;
                    *failures
                };
                if self.role() == LeaderRole::Leader {
                    let next_attempt = Utc::now()
                        + chrono::Duration::from_std(self.config.retry_interval).unwrap_or(chrono::Duration::zero());
                    let expires_first = self.state.borrow().lease_expiry.is_none_or(|expiry| next_attempt >= expiry);
                    if failures >= MAX_RENEWAL_FAILURES || expires_first {
                        error!(
                            error = %e,
                            consecutive_failures = failures,
                            "Failed to renew lease, stepping down"
                        );
                        self.publish(LeaderRole::Follower, None, None);
                    } else {
                        warn!(error = %e, attempt = failures, "Transient lease renewal failure, will retry");
                    }
                } else {
                    warn!(error = %e, attempt = failures, "Failed to check leadership, retrying");
                }
                self.config.retry_interval
            }
        }
    }

    /// Try to acquire the lease, renew it if held, or take it over if expired
    ///
    /// Returns whether this replica holds the lease afterwards. Losing a
    /// compare-and-swap race is not an error.
    pub async fn try_acquire_or_renew(&self) -> Result<bool, ClusterError> {
        let cfg = &self.config;
        let now = Utc::now();

        let Some(current) = self.bounded(self.client.get_lease(&cfg.namespace, &cfg.lease_name)).await? else {
            let spec = LeaseSpecRecord {
                holder_identity: Some(cfg.identity.clone()),
                lease_duration_seconds: Some(cfg.lease_duration_seconds()),
                acquire_time: Some(now),
                renew_time: Some(now),
                lease_transitions: Some(0),
            };
            return match self
                .bounded(self.client.create_lease(&cfg.namespace, &cfg.lease_name, &spec))
                .await
            {
                Ok(record) => Ok(self.observe_own(&record)),
                Err(ClusterError::Conflict(reason)) => {
                    debug!(reason = %reason, "Lost lease creation race");
                    self.publish(LeaderRole::Follower, None, None);
                    Ok(false)
                }
                Err(e) => Err(e),
            };
        };

        let held_by_me = current.spec.holder_identity.as_deref() == Some(cfg.identity.as_str());
        if !held_by_me && !current.spec.is_expired_at(now) {
            self.publish(
                LeaderRole::Follower,
                current.spec.holder_identity.clone(),
                current.spec.expires_at(),
            );
            return Ok(false);
        }

        let mut spec = current.spec.clone();
        spec.holder_identity = Some(cfg.identity.clone());
        spec.lease_duration_seconds = Some(cfg.lease_duration_seconds());
        spec.renew_time = Some(now);
        if !held_by_me {
            self.publish(LeaderRole::Candidate, None, None);
            spec.acquire_time = Some(now);
            spec.lease_transitions = Some(current.spec.lease_transitions.unwrap_or(0) + 1);
            debug!(
                previous_holder = ?current.spec.holder_identity,
                "Lease expired or released, attempting takeover"
            );
        }

        match self
            .bounded(
                self.client
                    .replace_lease(&cfg.namespace, &cfg.lease_name, &current.resource_version, &spec),
            )
            .await
        {
            Ok(record) => Ok(self.observe_own(&record)),
            Err(ClusterError::Conflict(reason)) => {
                debug!(reason = %reason, "Lease changed concurrently");
                self.publish(LeaderRole::Follower, None, None);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn observe_own(&self, record: &LeaseRecord) -> bool {
        self.publish(
            LeaderRole::Leader,
            record.spec.holder_identity.clone(),
            record.spec.expires_at(),
        );
        true
    }

    fn publish(&self, role: LeaderRole, holder: Option<String>, lease_expiry: Option<DateTime<Utc>>) {
        let previous = self.state.borrow().role;
        self.state.send_if_modified(|state| {
            let next = LeadershipState {
                role,
                is_leader: role == LeaderRole::Leader,
                holder,
                lease_expiry,
            };
            if *state == next {
                return false;
            }
            *state = next;
            true
        });

        if previous != role {
            match role {
                LeaderRole::Leader => info!(identity = %self.config.identity, "Acquired leadership"),
                LeaderRole::Follower | LeaderRole::Candidate if previous == LeaderRole::Leader => {
                    warn!(identity = %self.config.identity, "Lost leadership");
                }
                LeaderRole::Candidate => debug!("Lease is free, contending"),
                LeaderRole::Follower => info!(holder = ?self.state.borrow().holder, "Following current leader"),
            }
            if let Some(metrics) = &self.metrics {
                metrics.set_leader(role == LeaderRole::Leader);
                if previous == LeaderRole::Leader || role == LeaderRole::Leader {
                    metrics.record_leadership_transition();
                }
            }
        }
    }

    /// Give up the lease so a standby can take over without waiting for expiry
    ///
    /// The local flag flips before the write, so no leader-only work starts
    /// after this is called.
    pub async fn release(&self) {
        if self.role() != LeaderRole::Leader {
            return;
        }
        self.publish(LeaderRole::Follower, None, None);

        let cfg = &self.config;
        let current = match self.bounded(self.client.get_lease(&cfg.namespace, &cfg.lease_name)).await {
            Ok(Some(current)) => current,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Failed to read lease for release");
                return;
            }
        };
        if current.spec.holder_identity.as_deref() != Some(cfg.identity.as_str()) {
            return;
        }

        let mut spec = current.spec.clone();
        spec.holder_identity = None;
        spec.renew_time = Some(Utc::now() - chrono::Duration::seconds(i64::from(cfg.lease_duration_seconds()) + 1));

        match self
            .bounded(
                self.client
                    .replace_lease(&cfg.namespace, &cfg.lease_name, &current.resource_version, &spec),
            )
            .await
        {
            Ok(_) => info!(identity = %cfg.identity, "Released leadership"),
            Err(e) => warn!(error = %e, "Failed to release lease"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_client::MockLeaseBackend;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    fn config(identity: &str, ttl: Duration, renew: Duration, retry: Duration) -> LeaderElectionConfig {
        LeaderElectionConfig::new(
            "agent-leader".to_string(),
            "default".to_string(),
            identity.to_string(),
            ttl,
            renew,
            retry,
        )
        .unwrap()
    }

    fn fast_config(identity: &str) -> LeaderElectionConfig {
        config(
            identity,
            Duration::from_secs(2),
            Duration::from_millis(500),
            Duration::from_millis(100),
        )
    }

    async fn wait_for<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }

    #[test]
    fn test_config_rejects_renew_close_to_ttl() {
        let result = LeaderElectionConfig::new(
            "l".to_string(),
            "ns".to_string(),
            "me".to_string(),
            Duration::from_secs(10),
            Duration::from_secs(5),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));
    }

    #[test]
    fn test_config_rejects_empty_identity() {
        let result = LeaderElectionConfig::new(
            "l".to_string(),
            "ns".to_string(),
            String::new(),
            Duration::from_secs(15),
            Duration::from_secs(5),
            Duration::from_secs(2),
        );
        assert!(result.is_err());
    }

    /// Lease client whose reads and/or writes can be made to hang forever
    struct StallingLease {
        inner: MockLeaseBackend,
        stall_reads: AtomicBool,
        stall_writes: AtomicBool,
    }

    impl StallingLease {
        fn new(inner: MockLeaseBackend) -> Self {
            Self {
                inner,
                stall_reads: AtomicBool::new(false),
                stall_writes: AtomicBool::new(false),
            }
        }

        fn stall(&self, reads: bool, writes: bool) {
            self.stall_reads.store(reads, Ordering::SeqCst);
            self.stall_writes.store(writes, Ordering::SeqCst);
        }

        async fn maybe_hang(flag: &AtomicBool) {
            if flag.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
        }
    }

    #[async_trait::async_trait]
    impl LeaseClientTrait for StallingLease {
        async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<LeaseRecord>, ClusterError> {
            Self::maybe_hang(&self.stall_reads).await;
            self.inner.get_lease(namespace, name).await
        }

        async fn create_lease(
            &self,
            namespace: &str,
            name: &str,
            spec: &LeaseSpecRecord,
        ) -> Result<LeaseRecord, ClusterError> {
            Self::maybe_hang(&self.stall_writes).await;
            self.inner.create_lease(namespace, name, spec).await
        }

        async fn replace_lease(
            &self,
            namespace: &str,
            name: &str,
            resource_version: &str,
            spec: &LeaseSpecRecord,
        ) -> Result<LeaseRecord, ClusterError> {
            Self::maybe_hang(&self.stall_writes).await;
            self.inner.replace_lease(namespace, name, resource_version, spec).await
        }
    }

    #[test]
    fn test_config_rejects_fractional_ttl() {
        let result = LeaderElectionConfig::new(
            "l".to_string(),
            "ns".to_string(),
            "me".to_string(),
            Duration::from_millis(2500),
            Duration::from_millis(500),
            Duration::from_millis(100),
        );
        assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));

        let cfg = fast_config("a");
        assert_eq!(cfg.renew_deadline(), Duration::from_secs(1));
        assert!(cfg.renew_deadline() > cfg.renew_interval());
        assert!(cfg.renew_deadline() < cfg.lease_duration());
    }

    #[test]
    fn test_expired_snapshot_does_not_grant_leadership() {
        let now = Utc::now();
        let state = LeadershipState {
            role: LeaderRole::Leader,
            is_leader: true,
            holder: Some("a".to_string()),
            lease_expiry: Some(now + chrono::Duration::seconds(2)),
        };
        assert!(state.holds_lease_at(now));
        assert!(!state.holds_lease_at(now + chrono::Duration::seconds(3)));

        let unknown_expiry = LeadershipState {
            lease_expiry: None,
            ..state
        };
        assert!(!unknown_expiry.holds_lease_at(now));
    }

    #[tokio::test]
    async fn test_stalled_renewal_never_yields_two_leaders() {
        let backend = MockLeaseBackend::new();
        let stalling = Arc::new(StallingLease::new(backend.clone()));
        let first = Arc::new(LeaderElector::new(stalling.clone(), fast_config("a")));
        let shutdown = CancellationToken::new();
        {
            let elector = Arc::clone(&first);
            let token = shutdown.clone();
            tokio::spawn(async move { elector.run(token).await });
        }
        assert!(wait_for(Duration::from_secs(1), || first.is_leader()).await);

        // Renewals now hang without ever returning an error
        stalling.stall(true, true);
        let second = Arc::new(LeaderElector::new(Arc::new(backend.clone()), fast_config("b")));
        {
            let elector = Arc::clone(&second);
            let token = shutdown.clone();
            tokio::spawn(async move { elector.run(token).await });
        }

        let deadline = Instant::now() + Duration::from_secs(4);
        while Instant::now() < deadline {
            assert!(
                !(first.is_leader() && second.is_leader()),
                "both replicas report leadership"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!first.is_leader());
        assert!(second.is_leader());
        assert_eq!(backend.holder().as_deref(), Some("b"));
        // The stalled calls were abandoned and the role followed
        assert_ne!(first.role(), LeaderRole::Leader);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_follower_becomes_candidate_for_expired_lease() {
        let backend = MockLeaseBackend::new();
        let live = LeaseSpecRecord {
            holder_identity: Some("other".to_string()),
            lease_duration_seconds: Some(30),
            acquire_time: Some(Utc::now()),
            renew_time: Some(Utc::now()),
            lease_transitions: Some(0),
        };
        backend.create_lease("default", "agent-leader", &live).await.unwrap();

        let stalling = Arc::new(StallingLease::new(backend.clone()));
        let elector = LeaderElector::new(stalling.clone(), fast_config("a"));
        assert!(!elector.try_acquire_or_renew().await.unwrap());
        assert_eq!(elector.role(), LeaderRole::Follower);

        // Holder vanished: the lease expired long ago
        let mut lapsed = backend.current().unwrap();
        lapsed.spec.renew_time = Some(Utc::now() - chrono::Duration::seconds(120));
        backend
            .replace_lease("default", "agent-leader", &lapsed.resource_version, &lapsed.spec)
            .await
            .unwrap();

        // The takeover write hangs until the renew deadline abandons it
        stalling.stall(false, true);
        let result = elector.try_acquire_or_renew().await;
        assert!(matches!(result, Err(ClusterError::Transient(_))));
        let state = elector.state.borrow().clone();
        assert_eq!(state.role, LeaderRole::Candidate);
        assert!(state.holder.is_none());
        assert!(!elector.is_leader());

        stalling.stall(false, false);
        assert!(elector.try_acquire_or_renew().await.unwrap());
        assert_eq!(elector.role(), LeaderRole::Leader);
    }

    #[tokio::test]
    async fn test_single_replica_acquires() {
        let backend = MockLeaseBackend::new();
        let elector = LeaderElector::new(Arc::new(backend.clone()), fast_config("a"));
        assert_eq!(elector.role(), LeaderRole::Candidate);

        assert!(elector.try_acquire_or_renew().await.unwrap());
        assert!(elector.is_leader());
        assert_eq!(backend.holder().as_deref(), Some("a"));

        // Renewal keeps the same holder and transition count
        assert!(elector.try_acquire_or_renew().await.unwrap());
        let lease = backend.current().unwrap();
        assert_eq!(lease.spec.lease_transitions, Some(0));
        assert_eq!(lease.spec.lease_duration_seconds, Some(2));
    }

    #[tokio::test]
    async fn test_live_lease_is_not_taken_over() {
        let backend = MockLeaseBackend::new();
        let other = LeaseSpecRecord {
            holder_identity: Some("other".to_string()),
            lease_duration_seconds: Some(30),
            acquire_time: Some(Utc::now()),
            renew_time: Some(Utc::now()),
            lease_transitions: Some(3),
        };
        backend.create_lease("default", "agent-leader", &other).await.unwrap();

        let elector = LeaderElector::new(Arc::new(backend.clone()), fast_config("a"));
        assert!(!elector.try_acquire_or_renew().await.unwrap());

        let state = elector.state.borrow().clone();
        assert_eq!(state.role, LeaderRole::Follower);
        assert_eq!(state.holder.as_deref(), Some("other"));
        assert_eq!(backend.holder().as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let backend = MockLeaseBackend::new();
        let stale = LeaseSpecRecord {
            holder_identity: Some("gone".to_string()),
            lease_duration_seconds: Some(1),
            acquire_time: Some(Utc::now() - chrono::Duration::seconds(60)),
            renew_time: Some(Utc::now() - chrono::Duration::seconds(60)),
            lease_transitions: Some(1),
        };
        backend.create_lease("default", "agent-leader", &stale).await.unwrap();

        let elector = LeaderElector::new(Arc::new(backend.clone()), fast_config("a"));
        assert!(elector.try_acquire_or_renew().await.unwrap());
        assert_eq!(backend.current().unwrap().spec.lease_transitions, Some(2));
    }

    #[tokio::test]
    async fn test_exactly_one_leader_among_three() {
        let backend = MockLeaseBackend::new();
        let shutdown = CancellationToken::new();
        let electors: Vec<Arc<LeaderElector>> = ["a", "b", "c"]
            .into_iter()
            .map(|id| Arc::new(LeaderElector::new(Arc::new(backend.clone()), fast_config(id))))
            .collect();
        for elector in &electors {
            let elector = Arc::clone(elector);
            let token = shutdown.clone();
            tokio::spawn(async move { elector.run(token).await });
        }

        assert!(wait_for(Duration::from_secs(2), || electors.iter().any(|e| e.is_leader())).await);

        // Sample across several renewal periods
        let deadline = Instant::now() + Duration::from_millis(1500);
        while Instant::now() < deadline {
            let leaders = electors.iter().filter(|e| e.is_leader()).count();
            assert_eq!(leaders, 1, "expected exactly one leader");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_failover_after_leader_dies() {
        let backend = MockLeaseBackend::new();
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();
        let electors: Vec<Arc<LeaderElector>> = ["a", "b", "c"]
            .into_iter()
            .map(|id| Arc::new(LeaderElector::new(Arc::new(backend.clone()), fast_config(id))))
            .collect();
        for elector in &electors {
            let elector = Arc::clone(elector);
            let token = shutdown.clone();
            tasks.push(tokio::spawn(async move { elector.run(token).await }));
        }
        assert!(wait_for(Duration::from_secs(2), || electors.iter().any(|e| e.is_leader())).await);
        let leader = electors.iter().position(|e| e.is_leader()).unwrap();

        // Crash without releasing
        tasks[leader].abort();
        let started = Instant::now();
        let others: Vec<&Arc<LeaderElector>> = electors
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != leader)
            .map(|(_, e)| e)
            .collect();

        // TTL + renew interval + one retry of slack
        assert!(wait_for(Duration::from_secs(4), || others.iter().any(|e| e.is_leader())).await);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(others.iter().filter(|e| e.is_leader()).count(), 1);
        assert_eq!(backend.current().unwrap().spec.lease_transitions, Some(1));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_release_allows_takeover_before_expiry() {
        let backend = MockLeaseBackend::new();
        let slow_ttl = |id: &str| {
            config(
                id,
                Duration::from_secs(10),
                Duration::from_secs(1),
                Duration::from_millis(50),
            )
        };
        let first = Arc::new(LeaderElector::new(Arc::new(backend.clone()), slow_ttl("a")));
        let second = Arc::new(LeaderElector::new(Arc::new(backend.clone()), slow_ttl("b")));

        let first_stop = CancellationToken::new();
        let first_task = {
            let elector = Arc::clone(&first);
            let token = first_stop.clone();
            tokio::spawn(async move { elector.run(token).await })
        };
        assert!(wait_for(Duration::from_secs(1), || first.is_leader()).await);

        let second_stop = CancellationToken::new();
        {
            let elector = Arc::clone(&second);
            let token = second_stop.clone();
            tokio::spawn(async move { elector.run(token).await });
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!second.is_leader());

        first_stop.cancel();
        first_task.await.unwrap();
        assert!(!first.is_leader());

        // Far sooner than the 10s TTL
        assert!(wait_for(Duration::from_secs(1), || second.is_leader()).await);
        assert_eq!(backend.holder().as_deref(), Some("b"));
        second_stop.cancel();
    }

    #[tokio::test]
    async fn test_unreachable_backend_demotes_leader() {
        let backend = MockLeaseBackend::new();
        let elector = Arc::new(LeaderElector::new(Arc::new(backend.clone()), fast_config("a")));
        let shutdown = CancellationToken::new();
        {
            let elector = Arc::clone(&elector);
            let token = shutdown.clone();
            tokio::spawn(async move { elector.run(token).await });
        }
        assert!(wait_for(Duration::from_secs(1), || elector.is_leader()).await);
        let mut changes = elector.subscribe();

        backend.set_unavailable(true);
        // Steps down before the 2s lease could expire
        assert!(wait_for(Duration::from_millis(1500), || !elector.is_leader()).await);
        assert_eq!(elector.role(), LeaderRole::Follower);
        assert!(changes.has_changed().unwrap());

        backend.set_unavailable(false);
        assert!(wait_for(Duration::from_secs(3), || elector.is_leader()).await);
        shutdown.cancel();
    }
}
