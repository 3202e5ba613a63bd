//! RBAC reconciliation.
//!
//! While this replica is leader, the reconciler periodically turns Grants,
//! Users and Workspaces into the RoleBindings they imply and converges the
//! cluster towards that set:
//! - `desired`: required bindings from the input objects
//! - `diff`: writes needed to get from the observed to the desired set
//! - `labels`: label schema identifying managed bindings
//! - `status`: validation report published on `/status`
//!
//! Inputs come from the store once their watches have synced and from a
//! direct list otherwise.

pub mod desired;
pub mod diff;
pub mod labels;
pub mod status;


pub use status::ReconcilerStatus;

use crate::error::ControllerError;
use crate::handlers::ReconcileTrigger;
use crate::leader::LeadershipState;
use crate::metrics::Metrics;
use crate::store::{Store, decode};
use crate::watcher::SyncStatus;
use chrono::Utc;
use cluster_client::{ClusterClientTrait, ResourceKindDescriptor};
use desired::{ClusterSnapshot, desired_role_bindings};
use diff::{ReconcileAction, ReconcileTask, plan};
use labels::ManagedLabels;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use status::{PassReport, ResourceIssue, TaskFailure};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Kinds the reconciler reads; they must be kept in the store
#[must_use]
pub fn input_kinds() -> [ResourceKindDescriptor; 7] {
    [
        ResourceKindDescriptor::new("", "v1", "Namespace", "namespaces", false),
        ResourceKindDescriptor::new("agent.microscaler.io", "v1alpha1", "Workspace", "workspaces", false),
        ResourceKindDescriptor::new("agent.microscaler.io", "v1alpha1", "User", "users", false),
        ResourceKindDescriptor::new("agent.microscaler.io", "v1alpha1", "Grant", "grants", false),
        ResourceKindDescriptor::new("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles", false),
        ResourceKindDescriptor::new("rbac.authorization.k8s.io", "v1", "RoleBinding", "rolebindings", true),
        ResourceKindDescriptor::new(
            "rbac.authorization.k8s.io",
            "v1",
            "ClusterRoleBinding",
            "clusterrolebindings",
            false,
        ),
    ]
}

/// Converges managed RoleBindings towards the grants
pub struct Reconciler {
    client: Arc<dyn ClusterClientTrait>,
    store: Arc<Store>,
    sync: Arc<dyn SyncStatus>,
    leadership: watch::Receiver<LeadershipState>,
    labels: ManagedLabels,
    interval: Duration,
    trigger: ReconcileTrigger,
    status: RwLock<ReconcilerStatus>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("labels", &self.labels)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Create a reconciler; nothing happens until [`run`](Self::run)
    pub fn new(
        client: Arc<dyn ClusterClientTrait>,
        store: Arc<Store>,
        sync: Arc<dyn SyncStatus>,
        leadership: watch::Receiver<LeadershipState>,
        label_prefix: &str,
        interval: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            client,
            store,
            sync,
            leadership,
            labels: ManagedLabels::new(label_prefix),
            interval,
            trigger: ReconcileTrigger::new(),
            status: RwLock::new(ReconcilerStatus::default()),
            metrics,
        }
    }

    /// Wake up on `trigger` in addition to the interval
    #[must_use]
    pub fn with_trigger(mut self, trigger: ReconcileTrigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// Latest status report
    #[must_use]
    pub fn status(&self) -> ReconcilerStatus {
        self.status.read().clone()
    }

    // Also false once the last renewed lease has lapsed
    fn is_leader(&self) -> bool {
        self.leadership.borrow().holds_lease()
    }

    /// Reconcile on every tick, input change and leadership gain until `shutdown`
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut leadership = self.leadership.clone();
        let mut was_leader = leadership.borrow_and_update().is_leader;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Starting reconciler (interval {:?})", self.interval);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                () = self.trigger.notified() => debug!("Reconcile triggered"),
                changed = leadership.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let leader = leadership.borrow_and_update().is_leader;
                    self.status.write().is_active = leader;
                    let gained = leader && !was_leader;
                    was_leader = leader;
                    if !gained {
                        continue;
                    }
                    info!("Became leader, reconciling");
                }
            }

            if !self.is_leader() {
                continue;
            }
            match self.reconcile_once().await {
                Ok(report) if report.failed > 0 => warn!(
                    applied = report.applied,
                    deleted = report.deleted,
                    failed = report.failed,
                    "Reconcile pass finished with failures"
                ),
                Ok(report) => debug!(applied = report.applied, deleted = report.deleted, "Reconcile pass finished"),
                Err(e) => {
                    self.metrics.record_reconcile_pass("failed");
                    error!(error = %e, "Reconcile pass failed");
                }
            }
        }
        info!("Reconciler stopped");
    }

    /// Run one pass: read inputs, plan, write, refresh status
    ///
    /// Every write re-checks leadership just before it is issued; writes are
    /// skipped once this replica is no longer leader.
    pub async fn reconcile_once(&self) -> Result<PassReport, ControllerError> {
        let mut report = PassReport::started(Utc::now());
        let mut decode_issues = Vec::new();
        let snapshot = self.snapshot(&mut report, &mut decode_issues).await?;

        let required = desired_role_bindings(&snapshot, &self.labels);
        let plan = plan(&self.labels, &required, &snapshot.role_bindings, &snapshot.cluster_role_bindings);
        if !plan.is_empty() {
            info!("Reconciling {} RBAC changes", plan.len());
        }

        for mut task in plan.tasks {
            if !self.is_leader() {
                report.skipped_not_leader += 1;
                self.metrics.record_reconcile_action(task.action.verb(), "skipped");
                continue;
            }
            task.last_attempt = Some(Utc::now());
            match self.execute(&task).await {
                Ok(()) => {
                    match task.action {
                        ReconcileAction::Apply(_) => report.applied += 1,
                        ReconcileAction::DeleteRoleBinding | ReconcileAction::DeleteClusterRoleBinding => {
                            report.deleted += 1;
                        }
                    }
                    self.metrics.record_reconcile_action(task.action.verb(), "ok");
                    debug!("{} {}", task.action.verb(), task.target());
                }
                Err(e) => {
                    let failure = ControllerError::ReconcileActionFailed {
                        target: task.target(),
                        reason: e.to_string(),
                    };
                    warn!(action = task.action.verb(), error = %failure, "Reconcile action failed");
                    task.last_error = Some(e.to_string());
                    report.failed += 1;
                    report.failures.extend(TaskFailure::from_task(&task));
                    self.metrics.record_reconcile_action(task.action.verb(), "error");
                }
            }
        }

        report.finished_at = Utc::now();
        let outcome = if report.skipped_not_leader > 0 {
            "skipped"
        } else if report.failed > 0 {
            "partial"
        } else {
            "converged"
        };
        self.metrics.record_reconcile_pass(outcome);

        let review = status::review(&snapshot, &self.labels);
        let mut status = self.status.write();
        status.is_active = self.is_leader();
        status.last_update = Some(report.finished_at);
        status.resource_warnings = review.warnings;
        status.resource_errors = review.errors;
        status.resource_errors.extend(decode_issues);
        status.managed_role_binding_count = review.managed_role_bindings;
        status.managed_cluster_role_binding_count = review.managed_cluster_role_bindings;
        status.users_count = snapshot.users.len();
        status.workspaces_count = snapshot.workspaces.len();
        status.grants_count = snapshot.grants.len();
        status.last_pass = Some(report.clone());

        Ok(report)
    }

    async fn execute(&self, task: &ReconcileTask) -> Result<(), ControllerError> {
        match &task.action {
            ReconcileAction::Apply(binding) => self.client.apply_role_binding(binding).await?,
            ReconcileAction::DeleteRoleBinding => {
                let namespace = task.namespace.as_deref().unwrap_or_default();
                self.client.delete_role_binding(namespace, &task.name).await?;
            }
            ReconcileAction::DeleteClusterRoleBinding => {
                self.client.delete_cluster_role_binding(&task.name).await?;
            }
        }
        Ok(())
    }

    async fn snapshot(
        &self,
        report: &mut PassReport,
        issues: &mut Vec<ResourceIssue>,
    ) -> Result<ClusterSnapshot, ControllerError> {
        let [namespaces, workspaces, users, grants, cluster_roles, role_bindings, cluster_role_bindings] = input_kinds();

        Ok(ClusterSnapshot {
            namespaces: self.load(&namespaces, report, issues).await?,
            workspaces: self.load(&workspaces, report, issues).await?,
            users: self.load(&users, report, issues).await?,
            grants: self.load(&grants, report, issues).await?,
            cluster_roles: self.load(&cluster_roles, report, issues).await?,
            role_bindings: self.load(&role_bindings, report, issues).await?,
            cluster_role_bindings: self.load(&cluster_role_bindings, report, issues).await?,
        })
    }

    /// Typed objects of `kind`, from the store when synced, else listed directly
    async fn load<T: DeserializeOwned>(
        &self,
        kind: &ResourceKindDescriptor,
        report: &mut PassReport,
        issues: &mut Vec<ResourceIssue>,
    ) -> Result<Vec<T>, ControllerError> {
        let kind_key = kind.kind_key();
        if self.sync.is_synced(&kind_key) {
            let (items, failures) = self.store.search_typed::<T>(&kind_key, None);
            issues.extend(failures.into_iter().map(|f| ResourceIssue::undecodable(&kind_key, f)));
            return Ok(items);
        }

        debug!("{} not synced, listing directly", kind_key);
        report.from_store = false;
        let mut items = Vec::new();
        for obj in self.client.list_objects(kind).await? {
            match decode::<T>(&obj) {
                Ok(item) => items.push(item),
                Err(e) => issues.push(ResourceIssue::undecodable(
                    &kind_key,
                    format!("{}: {e}", obj.metadata.name.as_deref().unwrap_or("<unnamed>")),
                )),
            }
        }
        Ok(items)
    }
}
