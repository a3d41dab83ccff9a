use crate::metrics::{Phase, SyncMetrics};
use futures::{future, Future};
use rbac_sync_controller_core::{
    DirectoryClient, MembershipResolver, ResolveError, SyncTarget,
};
use rbac_sync_controller_directory as directory;
use rbac_sync_controller_k8s::{Applied, ApplyError, BindingReconciler, ClusterClient};
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{error, info, info_span, Instrument};

/// Periodically reconciles every configured target.
///
/// Passes run one at a time. Ticks that fall due while a pass is still running
/// are skipped rather than queued, so the interval is measured start to start
/// and a slow pass delays the next one instead of overlapping it.
pub struct ReconciliationLoop<D, C> {
    targets: Vec<SyncTarget>,
    interval: Duration,
    resolver: MembershipResolver<D>,
    reconciler: BindingReconciler<C>,
    metrics: SyncMetrics,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Apply(#[from] ApplyError),
}

// === impl ReconciliationLoop ===

impl<D, C> ReconciliationLoop<D, C>
where
    D: DirectoryClient,
    C: ClusterClient,
{
    pub fn new(
        targets: Vec<SyncTarget>,
        interval: Duration,
        resolver: MembershipResolver<D>,
        reconciler: BindingReconciler<C>,
        metrics: SyncMetrics,
    ) -> Self {
        Self {
            targets,
            interval,
            resolver,
            reconciler,
            metrics,
        }
    }

    /// Runs passes until shutdown is signaled. A pass that is in flight when
    /// the signal arrives is allowed to finish.
    pub async fn run(self, shutdown: kubert::shutdown::Watch) {
        self.run_until(shutdown.signaled()).await
    }

    async fn run_until<S: Future>(self, signal: S) {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tokio::pin!(signal);
        let mut pass = 0u64;
        loop {
            // The signal is only observed between passes.
            tokio::select! {
                biased;
                _release = &mut signal => {
                    info!("Reconciliation stopped");
                    return;
                }
                _ = interval.tick() => {}
            }

            pass += 1;
            let PassSummary { succeeded, failed } =
                self.sync_all().instrument(info_span!("pass", pass)).await;
            info!(pass, succeeded, failed, "Reconciliation pass complete");
        }
    }

    /// Reconciles every target once.
    ///
    /// Targets run concurrently and independently: a failure is logged and
    /// counted against its own target and never stops the others.
    pub async fn sync_all(&self) -> PassSummary {
        let results = future::join_all(self.targets.iter().map(|target| {
            self.sync(target).instrument(info_span!(
                "target",
                namespace = %target.namespace,
                group = %target.group,
            ))
        }))
        .await;

        results
            .into_iter()
            .fold(PassSummary::default(), |mut summary, result| {
                match result {
                    Ok(_) => summary.succeeded += 1,
                    Err(_) => summary.failed += 1,
                }
                summary
            })
    }

    async fn sync(&self, target: &SyncTarget) -> Result<Applied, SyncError> {
        let result = self.resolve_and_apply(target).await;
        match &result {
            Ok(_) => self.metrics.updated(),
            Err(error) => {
                let phase = error.phase();
                self.metrics.failed(phase);
                error!(
                    namespace = %target.namespace,
                    group = %target.group,
                    %phase,
                    auth = error.is_auth(),
                    error = error as &(dyn std::error::Error + 'static),
                    "Failed to reconcile target",
                );
            }
        }
        result
    }

    async fn resolve_and_apply(&self, target: &SyncTarget) -> Result<Applied, SyncError> {
        let members = self.resolver.resolve(&target.group).await?;
        Ok(self.reconciler.reconcile(target, &members).await?)
    }
}

// === impl SyncError ===

impl SyncError {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Resolve(_) => Phase::Resolve,
            Self::Apply(_) => Phase::Update,
        }
    }

    /// Indicates a credential or permission failure against either API.
    pub fn is_auth(&self) -> bool {
        match self {
            Self::Resolve(ResolveError::Fetch { source, .. }) => source
                .downcast_ref::<directory::Error>()
                .map_or(false, directory::Error::is_auth),
            Self::Resolve(ResolveError::Cycle { .. }) => false,
            Self::Apply(error) => error.is_auth(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use prometheus_client::registry::Registry;
    use rbac_sync_controller_core::{GroupRef, Member};
    use rbac_sync_controller_k8s::{BindingConfig, RoleBinding};
    use std::{
        collections::{HashMap, HashSet},
        sync::Arc,
    };
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct Directory {
        groups: HashMap<String, Vec<Member>>,
        forbidden: HashSet<String>,
        // The first `slow_calls` lookups each take `delay`.
        slow_calls: Mutex<usize>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl DirectoryClient for Directory {
        async fn list_members(&self, group: &GroupRef) -> anyhow::Result<Vec<Member>> {
            let slow = {
                let mut remaining = self.slow_calls.lock();
                let slow = *remaining > 0;
                *remaining = remaining.saturating_sub(1);
                slow
            };
            if slow {
                time::sleep(self.delay).await;
            }
            if self.forbidden.contains(group.as_str()) {
                return Err(directory::Error::Status {
                    group: group.to_string(),
                    status: http::StatusCode::FORBIDDEN,
                    body: "Not Authorized to access this resource/api".to_string(),
                }
                .into());
            }
            Ok(self.groups.get(group.as_str()).cloned().unwrap_or_default())
        }
    }

    #[derive(Default)]
    struct Cluster {
        writes: Mutex<Vec<(String, Vec<String>)>>,
        failing: HashSet<String>,
    }

    #[async_trait::async_trait]
    impl ClusterClient for Cluster {
        async fn replace(
            &self,
            namespace: &str,
            _name: &str,
            binding: &RoleBinding,
        ) -> Result<RoleBinding, kube::Error> {
            self.record(namespace, binding);
            if self.failing.contains(namespace) {
                return Err(kube::Error::Api(ErrorResponse {
                    status: "Failure".to_string(),
                    message: "internal error".to_string(),
                    reason: "InternalError".to_string(),
                    code: 500,
                }));
            }
            Ok(binding.clone())
        }

        async fn create(
            &self,
            namespace: &str,
            binding: &RoleBinding,
        ) -> Result<RoleBinding, kube::Error> {
            self.record(namespace, binding);
            Ok(binding.clone())
        }
    }

    impl Cluster {
        fn record(&self, namespace: &str, binding: &RoleBinding) {
            let subjects = binding
                .subjects
                .iter()
                .flatten()
                .map(|s| s.name.clone())
                .collect();
            self.writes.lock().push((namespace.to_string(), subjects));
        }

        fn writes(&self) -> Vec<(String, Vec<String>)> {
            let mut writes = self.writes.lock().clone();
            writes.sort();
            writes
        }
    }

    fn directory() -> Directory {
        Directory {
            groups: HashMap::from([
                (
                    "team-a@x.com".to_string(),
                    vec![Member::user("u1@x.com"), Member::user("u2@x.com")],
                ),
                ("team-b@x.com".to_string(), vec![Member::user("u3@x.com")]),
            ]),
            ..Default::default()
        }
    }

    fn targets() -> Vec<SyncTarget> {
        vec![
            SyncTarget::new("ns-a", "team-a@x.com"),
            SyncTarget::new("ns-b", "team-b@x.com"),
        ]
    }

    fn sync_loop<D: DirectoryClient, C: ClusterClient>(
        directory: D,
        cluster: C,
    ) -> (ReconciliationLoop<D, C>, SyncMetrics) {
        let metrics = SyncMetrics::register(&mut Registry::default());
        let reconciler = BindingReconciler::new(
            cluster,
            BindingConfig {
                cluster_role: "developer".to_string(),
                binding_name: "developer".to_string(),
                write_timeout: Duration::from_secs(10),
            },
        );
        let sync = ReconciliationLoop::new(
            targets(),
            Duration::from_secs(15 * 60),
            MembershipResolver::new(directory),
            reconciler,
            metrics.clone(),
        );
        (sync, metrics)
    }

    fn expected_writes() -> Vec<(String, Vec<String>)> {
        vec![
            (
                "ns-a".to_string(),
                vec!["u1@x.com".to_string(), "u2@x.com".to_string()],
            ),
            ("ns-b".to_string(), vec!["u3@x.com".to_string()]),
        ]
    }

    #[tokio::test]
    async fn syncs_every_target() {
        let cluster = Arc::new(Cluster::default());
        let (sync, metrics) = sync_loop(directory(), cluster.clone());

        let summary = sync.sync_all().await;
        assert_eq!(
            summary,
            PassSummary {
                succeeded: 2,
                failed: 0
            }
        );
        assert_eq!(cluster.writes(), expected_writes());
        assert_eq!(metrics.update_count(), 2);
        assert_eq!(metrics.error_count(Phase::Update), 0);
        assert_eq!(metrics.error_count(Phase::Resolve), 0);
    }

    #[tokio::test]
    async fn update_failure_does_not_stop_other_targets() {
        let cluster = Arc::new(Cluster {
            failing: HashSet::from(["ns-a".to_string()]),
            ..Default::default()
        });
        let (sync, metrics) = sync_loop(directory(), cluster.clone());

        let summary = sync.sync_all().await;
        assert_eq!(
            summary,
            PassSummary {
                succeeded: 1,
                failed: 1
            }
        );
        // Both targets were written; only one write failed.
        assert_eq!(cluster.writes(), expected_writes());
        assert_eq!(metrics.update_count(), 1);
        assert_eq!(metrics.error_count(Phase::Update), 1);
        assert_eq!(metrics.error_count(Phase::Resolve), 0);
    }

    #[tokio::test]
    async fn resolve_failure_skips_the_write() {
        let directory = Directory {
            forbidden: HashSet::from(["team-a@x.com".to_string()]),
            ..directory()
        };
        let cluster = Arc::new(Cluster::default());
        let (sync, metrics) = sync_loop(directory, cluster.clone());

        let summary = sync.sync_all().await;
        assert_eq!(
            summary,
            PassSummary {
                succeeded: 1,
                failed: 1
            }
        );
        assert_eq!(
            cluster.writes(),
            vec![("ns-b".to_string(), vec!["u3@x.com".to_string()])]
        );
        assert_eq!(metrics.update_count(), 1);
        assert_eq!(metrics.error_count(Phase::Resolve), 1);
        assert_eq!(metrics.error_count(Phase::Update), 0);
    }

    #[tokio::test]
    async fn classifies_auth_failures() {
        let directory = Directory {
            forbidden: HashSet::from(["team-a@x.com".to_string()]),
            ..directory()
        };
        let resolver = MembershipResolver::new(directory);
        let error = SyncError::from(
            resolver
                .resolve(&GroupRef::from("team-a@x.com"))
                .await
                .expect_err("must fail"),
        );
        assert_eq!(error.phase(), Phase::Resolve);
        assert!(error.is_auth());

        let error = SyncError::Resolve(ResolveError::Fetch {
            group: GroupRef::from("team-c@x.com"),
            source: anyhow::anyhow!("connection reset"),
        });
        assert!(!error.is_auth());

        let error = SyncError::Resolve(ResolveError::Cycle {
            group: GroupRef::from("team-c@x.com"),
            path: vec!["team-c@x.com".to_string(), "team-c@x.com".to_string()],
        });
        assert_eq!(error.phase(), Phase::Resolve);
        assert!(!error.is_auth());
    }

    #[tokio::test(start_paused = true)]
    async fn runs_passes_until_signaled() {
        let cluster = Arc::new(Cluster::default());
        let (sync, metrics) = sync_loop(directory(), cluster.clone());

        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(sync.run_until(rx));

        // Passes start immediately and then every 15 minutes.
        time::sleep(Duration::from_secs(30 * 60 + 1)).await;
        tx.send(()).expect("loop is running");
        task.await.expect("loop completes");

        assert_eq!(cluster.writes().len(), 6);
        assert_eq!(metrics.update_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn finishes_in_flight_pass_after_signal() {
        let directory = Directory {
            slow_calls: Mutex::new(2),
            delay: Duration::from_secs(25 * 60),
            ..directory()
        };
        let cluster = Arc::new(Cluster::default());
        let (sync, metrics) = sync_loop(directory, cluster.clone());

        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(sync.run_until(rx));

        time::sleep(Duration::from_secs(60)).await;
        assert!(cluster.writes().is_empty(), "pass is still resolving");
        tx.send(()).expect("loop is running");
        task.await.expect("loop completes");

        assert_eq!(cluster.writes(), expected_writes());
        assert_eq!(metrics.update_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn skips_ticks_missed_by_a_slow_pass() {
        // The first pass takes 40 minutes, spanning two 15 minute ticks.
        let directory = Directory {
            slow_calls: Mutex::new(2),
            delay: Duration::from_secs(40 * 60),
            ..directory()
        };
        let cluster = Arc::new(Cluster::default());
        let (sync, metrics) = sync_loop(directory, cluster.clone());

        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(sync.run_until(rx));

        // The slow pass ends at 40m and is followed by one immediate pass. The
        // next tick is realigned to 45m rather than bursting through the
        // missed ones.
        time::sleep(Duration::from_secs(44 * 60)).await;
        tx.send(()).expect("loop is running");
        task.await.expect("loop completes");

        assert_eq!(cluster.writes().len(), 4, "two passes of two targets");
        assert_eq!(metrics.update_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_before_first_pass_when_already_signaled() {
        let cluster = Arc::new(Cluster::default());
        let (sync, metrics) = sync_loop(directory(), cluster.clone());

        let (tx, rx) = oneshot::channel::<()>();
        tx.send(()).expect("receiver held");
        sync.run_until(rx).await;

        assert!(cluster.writes().is_empty());
        assert_eq!(metrics.update_count(), 0);
    }
}
