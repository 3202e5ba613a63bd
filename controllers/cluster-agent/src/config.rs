//! Agent configuration loaded from environment variables.
//!
//! All settings have defaults suitable for an in-cluster deployment; only
//! malformed values are rejected.

use crate::error::ControllerError;
use crate::leader::LeaderElectionConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Kinds kept in the in-memory store unless `STORE_KINDS` overrides them
pub const DEFAULT_STORE_KINDS: &[&str] = &[
    "Namespace",
    "Pod",
    "Event",
    "Deployment.apps",
    "ReplicaSet.apps",
    "StatefulSet.apps",
    "DaemonSet.apps",
    "Job.batch",
    "CronJob.batch",
    "NetworkPolicy.networking.k8s.io",
    "ClusterRole.rbac.authorization.k8s.io",
    "RoleBinding.rbac.authorization.k8s.io",
    "ClusterRoleBinding.rbac.authorization.k8s.io",
    "Workspace.agent.microscaler.io",
    "User.agent.microscaler.io",
    "Grant.agent.microscaler.io",
];

/// Kinds never watched unless `WATCH_DENYLIST` overrides them
pub const DEFAULT_WATCH_DENYLIST: &[&str] = &["Event.events.k8s.io", "Lease.coordination.k8s.io"];

/// Namespaces whose events are not recorded in the audit log
pub const DEFAULT_AUDIT_IGNORED_NAMESPACES: &[&str] = &["kube-system", "kube-public", "default"];

/// Retry policy for watch subscriptions and discovery
#[derive(Debug, Clone)]
pub struct WatchRetryPolicy {
    /// First retry delay
    pub initial_backoff: Duration,
    /// Growth factor per retry
    pub factor: u32,
    /// Number of growth steps before the delay is capped
    pub steps: u32,
    /// Random extra delay fraction
    pub jitter: f64,
    /// Consecutive failed attempts before a watch is marked failed
    pub max_retries: u32,
}

impl Default for WatchRetryPolicy {
    fn default() -> Self {
        // 1s doubling up to ~2 minutes
        Self {
            initial_backoff: Duration::from_secs(1),
            factor: 2,
            steps: 8,
            jitter: 0.1,
            max_retries: 20,
        }
    }
}

/// Complete agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Leader election settings (includes this replica's identity)
    pub leader: LeaderElectionConfig,
    /// Reconciler pass interval
    pub reconcile_interval: Duration,
    /// Interval between discovery passes after startup
    pub rediscovery_interval: Duration,
    /// Watch and discovery retry policy
    pub watch_retry: WatchRetryPolicy,
    /// Kind keys excluded from watching
    pub watch_denylist: Vec<String>,
    /// Kind keys cached in the store (`*` for all)
    pub store_kinds: Vec<String>,
    /// Entries kept per audit log key
    pub audit_capacity: usize,
    /// Namespaces excluded from the audit log
    pub audit_ignored_namespaces: Vec<String>,
    /// Root directory for YAML export, disabled when unset
    pub export_dir: Option<PathBuf>,
    /// Kind keys exported as YAML
    pub export_kinds: Vec<String>,
    /// Prefix for labels on managed RBAC objects
    pub label_prefix: String,
    /// Listen address for probes, status and metrics
    pub status_addr: SocketAddr,
    /// Bound on how long shutdown waits for tasks
    pub shutdown_grace: Duration,
}

impl AgentConfig {
    /// Load configuration from the process environment
    ///
    /// Environment variables:
    /// - `POD_NAME` / `POD_NAMESPACE`: identity and lease namespace
    /// - `LEADER_ELECTION_LEASE_NAME`, `LEADER_ELECTION_LEASE_DURATION`,
    ///   `LEADER_ELECTION_RENEW_INTERVAL`, `LEADER_ELECTION_RETRY_INTERVAL` (seconds)
    /// - `RECONCILE_INTERVAL`, `REDISCOVERY_INTERVAL`, `SHUTDOWN_GRACE_PERIOD` (seconds)
    /// - `WATCH_MAX_RETRIES`, `WATCH_DENYLIST`, `STORE_KINDS` (comma separated)
    /// - `AUDIT_LOG_CAPACITY`, `AUDIT_IGNORED_NAMESPACES`
    /// - `EXPORT_DIR`, `EXPORT_KINDS`
    /// - `RBAC_LABEL_PREFIX`, `STATUS_ADDR`
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let namespace = lookup("POD_NAMESPACE").unwrap_or_else(|| "default".to_string());
        let identity = lookup("POD_NAME")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let leader = LeaderElectionConfig::new(
            lookup("LEADER_ELECTION_LEASE_NAME").unwrap_or_else(|| "cluster-agent-leader".to_string()),
            namespace,
            identity,
            parse_secs(&lookup, "LEADER_ELECTION_LEASE_DURATION", 15)?,
            parse_secs(&lookup, "LEADER_ELECTION_RENEW_INTERVAL", 5)?,
            parse_secs(&lookup, "LEADER_ELECTION_RETRY_INTERVAL", 2)?,
        )?;

        let watch_retry = WatchRetryPolicy {
            max_retries: parse_number(&lookup, "WATCH_MAX_RETRIES", 20)?,
            ..WatchRetryPolicy::default()
        };

        let status_addr = lookup("STATUS_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("STATUS_ADDR: {e}")))?;

        let audit_capacity: usize = parse_number(&lookup, "AUDIT_LOG_CAPACITY", 150)?;
        if audit_capacity == 0 {
            return Err(ControllerError::InvalidConfig(
                "AUDIT_LOG_CAPACITY must be greater than zero".to_string(),
            ));
        }

        let reconcile_interval = parse_nonzero_secs(&lookup, "RECONCILE_INTERVAL", 30)?;
        let rediscovery_interval = parse_nonzero_secs(&lookup, "REDISCOVERY_INTERVAL", 300)?;

        Ok(Self {
            leader,
            reconcile_interval,
            rediscovery_interval,
            watch_retry,
            watch_denylist: parse_list(&lookup, "WATCH_DENYLIST", DEFAULT_WATCH_DENYLIST),
            store_kinds: parse_list(&lookup, "STORE_KINDS", DEFAULT_STORE_KINDS),
            audit_capacity,
            audit_ignored_namespaces: parse_list(
                &lookup,
                "AUDIT_IGNORED_NAMESPACES",
                DEFAULT_AUDIT_IGNORED_NAMESPACES,
            ),
            export_dir: lookup("EXPORT_DIR").filter(|s| !s.is_empty()).map(PathBuf::from),
            export_kinds: parse_list(&lookup, "EXPORT_KINDS", &[]),
            label_prefix: lookup("RBAC_LABEL_PREFIX").unwrap_or_else(|| "agent.microscaler.io".to_string()),
            status_addr,
            shutdown_grace: parse_secs(&lookup, "SHUTDOWN_GRACE_PERIOD", 10)?,
        })
    }

    /// Whether objects of `kind_key` are cached in the store
    #[must_use]
    pub fn stores_kind(&self, kind_key: &str) -> bool {
        self.store_kinds.iter().any(|k| k == "*" || k == kind_key)
    }
}

fn parse_number<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ControllerError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("{key}={raw}: {e}"))),
    }
}

fn parse_secs<F>(lookup: &F, key: &str, default: u64) -> Result<Duration, ControllerError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_number(lookup, key, default).map(Duration::from_secs)
}

// Intervals that drive a `tokio::time::interval` must not be zero
fn parse_nonzero_secs<F>(lookup: &F, key: &str, default: u64) -> Result<Duration, ControllerError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse_secs(lookup, key, default)?;
    if value.is_zero() {
        return Err(ControllerError::InvalidConfig(format!("{key} must be greater than zero")));
    }
    Ok(value)
}

fn parse_list<F>(lookup: &F, key: &str, default: &[&str]) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        None => default.iter().map(|s| (*s).to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::from_lookup(lookup_from(&[("POD_NAME", "agent-0")])).unwrap();

        assert_eq!(config.leader.identity(), "agent-0");
        assert_eq!(config.leader.namespace(), "default");
        assert_eq!(config.reconcile_interval, Duration::from_secs(30));
        assert_eq!(config.audit_capacity, 150);
        assert_eq!(config.watch_retry.max_retries, 20);
        assert!(config.export_dir.is_none());
        assert!(config.stores_kind("Pod"));
        assert!(!config.stores_kind("ConfigMap"));
        assert!(config.watch_denylist.contains(&"Event.events.k8s.io".to_string()));
    }

    #[test]
    fn test_identity_falls_back_to_uuid() {
        let config = AgentConfig::from_lookup(lookup_from(&[])).unwrap();
        assert!(uuid::Uuid::parse_str(config.leader.identity()).is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = AgentConfig::from_lookup(lookup_from(&[
            ("POD_NAME", "agent-1"),
            ("STORE_KINDS", "*"),
            ("WATCH_DENYLIST", "Pod, Secret"),
            ("EXPORT_DIR", "/var/lib/agent"),
            ("EXPORT_KINDS", "ConfigMap"),
            ("STATUS_ADDR", "127.0.0.1:9000"),
        ]))
        .unwrap();

        assert!(config.stores_kind("ConfigMap"));
        assert_eq!(config.watch_denylist, vec!["Pod".to_string(), "Secret".to_string()]);
        assert_eq!(config.export_dir, Some(PathBuf::from("/var/lib/agent")));
        assert_eq!(config.status_addr.port(), 9000);
    }

    #[test]
    fn test_rejects_renew_interval_too_close_to_ttl() {
        let result = AgentConfig::from_lookup(lookup_from(&[
            ("LEADER_ELECTION_LEASE_DURATION", "10"),
            ("LEADER_ELECTION_RENEW_INTERVAL", "6"),
        ]));
        assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_garbage_numbers() {
        let result = AgentConfig::from_lookup(lookup_from(&[("AUDIT_LOG_CAPACITY", "lots")]));
        assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));

        let result = AgentConfig::from_lookup(lookup_from(&[("AUDIT_LOG_CAPACITY", "0")]));
        assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_intervals() {
        for key in ["RECONCILE_INTERVAL", "REDISCOVERY_INTERVAL"] {
            let result = AgentConfig::from_lookup(lookup_from(&[(key, "0")]));
            assert!(
                matches!(&result, Err(ControllerError::InvalidConfig(msg)) if msg.contains(key)),
                "{key}=0 should be rejected"
            );
        }

        let config = AgentConfig::from_lookup(lookup_from(&[("REDISCOVERY_INTERVAL", "60")])).unwrap();
        assert_eq!(config.rediscovery_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_rejects_lease_duration_beyond_lease_field() {
        let result = AgentConfig::from_lookup(lookup_from(&[("LEADER_ELECTION_LEASE_DURATION", "99999999999")]));
        assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));
    }
}
