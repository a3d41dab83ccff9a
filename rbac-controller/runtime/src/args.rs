use crate::{admin, metrics::SyncMetrics, sync::ReconciliationLoop};
use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use futures::Future;
use prometheus_client::registry::Registry;
use rbac_sync_controller_core::{DirectoryClient, MembershipResolver, SyncTarget};
use rbac_sync_controller_directory::{AdminDirectory, FakeDirectory, ServiceAccountKey};
use rbac_sync_controller_k8s::{BindingConfig, BindingReconciler};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::{task::JoinHandle, time::Duration};
use tracing::{error, info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "rbac-sync",
    about = "Keeps namespace role bindings in sync with directory groups"
)]
pub struct Args {
    #[clap(long, default_value = "rbac_sync=info,warn", env = "RBAC_SYNC_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(long, default_value = "0.0.0.0:8080", env = "RBAC_SYNC_ADMIN_ADDR")]
    admin_addr: SocketAddr,

    /// The cluster role referenced by every managed binding.
    #[clap(long, default_value = "developer", env = "RBAC_SYNC_CLUSTER_ROLE_NAME")]
    cluster_role_name: String,

    /// The name of the managed binding in each namespace.
    #[clap(long, default_value = "developer", env = "RBAC_SYNC_ROLE_BINDING_NAME")]
    role_binding_name: String,

    /// Namespace and group pairs, formatted as `namespace:group@example.com`.
    ///
    /// Pairs may be comma-delimited and the flag may be repeated.
    #[clap(long, required = true, env = "RBAC_SYNC_GROUP_LIST")]
    group_list: Vec<Targets>,

    #[clap(
        long,
        default_value = "15m",
        value_parser = parse_duration,
        env = "RBAC_SYNC_UPDATE_INTERVAL"
    )]
    update_interval: Duration,

    /// Bounds each role binding write.
    #[clap(
        long,
        default_value = "10s",
        value_parser = parse_duration,
        env = "RBAC_SYNC_PATCH_TIMEOUT"
    )]
    patch_timeout: Duration,

    /// A service account key with domain-wide delegation.
    #[clap(long, env = "RBAC_SYNC_CONFIG_FILE_PATH")]
    config_file_path: Option<PathBuf>,

    /// The admin account impersonated when reading the directory.
    #[clap(long, env = "RBAC_SYNC_CONFIG_SUBJECT")]
    config_subject: Option<String>,

    /// Answers every group lookup with a single fake user instead of calling
    /// the directory.
    #[clap(long, env = "RBAC_SYNC_FAKE_GROUPS_RESPONSE")]
    fake_groups_response: bool,
}

/// A comma-delimited list of sync targets.
#[derive(Clone, Debug)]
struct Targets(Vec<SyncTarget>);

/// Where group memberships are read from.
#[derive(Clone, Debug, PartialEq, Eq)]
enum DirectorySource {
    Fake,
    Admin { key_path: PathBuf, subject: String },
}

/// Validated settings for the reconciliation loop.
#[derive(Clone, Debug, PartialEq, Eq)]
struct SyncConfig {
    targets: Vec<SyncTarget>,
    interval: Duration,
    binding: BindingConfig,
    directory: DirectorySource,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin_addr,
            cluster_role_name,
            role_binding_name,
            group_list,
            update_interval,
            patch_timeout,
            config_file_path,
            config_subject,
            fake_groups_response,
        } = self;

        let SyncConfig {
            targets,
            interval,
            binding,
            directory,
        } = SyncConfig::validate(
            group_list.into_iter().flat_map(|Targets(t)| t).collect(),
            update_interval,
            BindingConfig {
                cluster_role: cluster_role_name,
                binding_name: role_binding_name,
                write_timeout: patch_timeout,
            },
            config_file_path,
            config_subject,
            fake_groups_response,
        )?;

        log_format.try_init(log_level)?;

        let directory: Arc<dyn DirectoryClient> = match directory {
            DirectorySource::Fake => {
                info!("Using fake directory responses");
                Arc::new(FakeDirectory::default())
            }
            DirectorySource::Admin { key_path, subject } => {
                let key = ServiceAccountKey::from_file(&key_path)
                    .with_context(|| format!("loading {}", key_path.display()))?;
                info!(client = %key.client_email(), %subject, "Using admin directory");
                Arc::new(AdminDirectory::new(key, subject)?)
            }
        };

        let mut prom = <Registry>::default();
        let metrics = SyncMetrics::register(&mut prom);
        let prom = Arc::new(prom);

        let (shutdown, watch) = kubert::shutdown::sigint_or_sigterm()?;
        let client = client
            .try_client()
            .await
            .context("failed to build Kubernetes client")?;

        let admin_watch = watch.clone();
        tokio::spawn(
            async move {
                if let Err(error) = admin::serve(admin_addr, prom, admin_watch).await {
                    error!(%error, "Admin server failed");
                }
            }
            .instrument(info_span!("admin", port = %admin_addr.port())),
        );

        info!(
            targets = targets.len(),
            ?interval,
            cluster_role = %binding.cluster_role,
            binding = %binding.binding_name,
            "Starting reconciliation",
        );
        let sync = ReconciliationLoop::new(
            targets,
            interval,
            MembershipResolver::new(directory),
            BindingReconciler::new(client, binding),
            metrics,
        );
        let sync = tokio::spawn(sync.run(watch).instrument(info_span!("sync")));

        // Block the main thread on the shutdown signal. Once it fires, wait for
        // the background tasks to complete before exiting.
        supervise(sync, shutdown.signaled()).await
    }
}

// === impl SyncConfig ===

impl SyncConfig {
    fn validate(
        targets: Vec<SyncTarget>,
        interval: Duration,
        binding: BindingConfig,
        key_path: Option<PathBuf>,
        subject: Option<String>,
        fake: bool,
    ) -> Result<Self> {
        if binding.cluster_role.trim().is_empty() {
            bail!("--cluster-role-name must not be empty");
        }
        if binding.binding_name.trim().is_empty() {
            bail!("--role-binding-name must not be empty");
        }
        if targets.is_empty() {
            bail!("--group-list must name at least one namespace:group pair");
        }
        if interval.is_zero() {
            bail!("--update-interval must be greater than zero");
        }
        if binding.write_timeout.is_zero() {
            bail!("--patch-timeout must be greater than zero");
        }

        let directory = if fake {
            DirectorySource::Fake
        } else {
            let key_path = key_path.ok_or_else(|| {
                anyhow!("--config-file-path is required unless --fake-groups-response is set")
            })?;
            let subject = subject
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| {
                    anyhow!("--config-subject is required unless --fake-groups-response is set")
                })?;
            DirectorySource::Admin { key_path, subject }
        };

        Ok(Self {
            targets,
            interval,
            binding,
            directory,
        })
    }
}

// === impl Targets ===

impl std::str::FromStr for Targets {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(SyncTarget::parse_list(s)?))
    }
}

/// Parses a whole number followed by one of `ms`, `s`, `m`, `h` or `d`, e.g.
/// `15m`. A bare `0` is accepted.
fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(end);
    if digits.is_empty() {
        bail!("duration {s:?} must start with a number");
    }
    let n = digits.parse::<u64>()?;

    let unit_ms: u64 = match unit {
        "" if n == 0 => 0,
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "" => bail!("duration {s:?} is missing a unit"),
        _ => bail!("duration {s:?} has unknown unit {unit:?}"),
    };
    n.checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| anyhow!("duration {s:?} is too large"))
}

/// Waits for shutdown, failing if the reconciliation task dies first.
///
/// The task finishes on its own once shutdown is signaled, so a clean exit
/// only means the process is draining.
async fn supervise<E>(
    sync: JoinHandle<()>,
    signaled: impl Future<Output = Result<(), E>>,
) -> Result<()> {
    tokio::pin!(signaled);
    tokio::select! {
        biased;
        res = &mut signaled => return res.map_err(|_| anyhow!("Aborted")),
        res = sync => res.context("reconciliation task failed")?,
    }

    if signaled.await.is_err() {
        bail!("Aborted");
    }
    Ok(())
}
