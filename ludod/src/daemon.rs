use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ludo_core::{CatalogClient, ClientConfig};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Env, expand_with_home};
use crate::repository::{OwnerRecord, Repository, SqliteRepository, timestamp_now};
use crate::sync::conflict::ConflictResolutionConfig;
use crate::sync::orchestrator::{OrchestratorConfig, SyncOrchestrator};
use crate::sync::progress::{SyncProgress, SyncType};
use crate::sync::resolver::ConflictResolver;
use crate::sync::scheduler::{SchedulerConfig, SyncScheduler};

const DEFAULT_MAX_CONCURRENT_JOBS: u64 = 3;
const DEFAULT_ITEM_DELAY_MS: u64 = 100;
const DEFAULT_MAINTENANCE_SECS: u64 = 15 * 60;
const SYNC_POLL: Duration = Duration::from_millis(200);

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub api_key: String,
    pub client: ClientConfig,
    pub db_path: PathBuf,
    /// Owners registered on startup so the scheduler picks them up.
    pub owners: Vec<String>,
    pub orchestrator: OrchestratorConfig,
    pub scheduler: SchedulerConfig,
    pub conflicts: ConflictResolutionConfig,
    pub maintenance_interval: Duration,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_source(&Env::process())
    }

    pub fn from_source<F: Fn(&str) -> Option<String>>(env: &Env<F>) -> anyhow::Result<Self> {
        let api_key = env.string("LUDO_API_KEY").context("LUDO_API_KEY is not set")?;

        let mut client = ClientConfig::default();
        if let Some(url) = env.string("LUDO_API_BASE_URL") {
            client.api_base_url = url;
        }
        if let Some(url) = env.string("LUDO_STORE_BASE_URL") {
            client.store_base_url = url;
        }

        let db_path = match env.string("LUDO_DB_PATH") {
            Some(value) => {
                let home = dirs::home_dir().unwrap_or_default();
                expand_with_home(&value, &home)
            }
            None => SqliteRepository::default_path().context("no default database location")?,
        };

        let orchestrator = OrchestratorConfig {
            max_concurrent_jobs: env
                .u64_or("LUDO_MAX_CONCURRENT_JOBS", DEFAULT_MAX_CONCURRENT_JOBS)
                as usize,
            item_delay: Duration::from_millis(
                env.u64_or("LUDO_FULL_SYNC_ITEM_DELAY_MS", DEFAULT_ITEM_DELAY_MS),
            ),
            ..OrchestratorConfig::default()
        };

        Ok(Self {
            api_key,
            client,
            db_path,
            owners: env.list("LUDO_OWNERS"),
            orchestrator,
            scheduler: env.scheduler_config()?,
            conflicts: env.conflict_config()?,
            maintenance_interval: env
                .secs_or("LUDO_MAINTENANCE_INTERVAL_SECS", DEFAULT_MAINTENANCE_SECS),
        })
    }

    pub fn catalog_client(&self) -> anyhow::Result<CatalogClient> {
        CatalogClient::with_config(self.api_key.clone(), self.client.clone())
            .context("invalid catalog client config")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub auto_resolved: usize,
    pub purged_conflicts: usize,
    pub purged_cache_entries: usize,
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    repo: Arc<SqliteRepository>,
    orchestrator: SyncOrchestrator,
    scheduler: Arc<SyncScheduler>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let repo = Arc::new(
            SqliteRepository::open(&config.db_path)
                .await
                .with_context(|| format!("failed to open library database at {:?}", config.db_path))?,
        );
        let client = config.catalog_client()?;
        let resolver = Arc::new(ConflictResolver::new(repo.clone(), config.conflicts.clone()));
        let orchestrator = SyncOrchestrator::new(
            client,
            repo.clone(),
            resolver,
            config.orchestrator.clone(),
        );
        let scheduler = Arc::new(
            SyncScheduler::new(orchestrator.clone(), repo.clone(), config.scheduler.clone())
                .context("invalid scheduler config")?,
        );

        register_owners(repo.as_ref(), &config.owners)
            .await
            .context("failed to register tracked owners")?;

        Ok(Self {
            config,
            repo,
            orchestrator,
            scheduler,
        })
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    pub fn repository(&self) -> &Arc<SqliteRepository> {
        &self.repo
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            db = %self.config.db_path.display(),
            owners = self.config.owners.len(),
            auto_sync = self.config.scheduler.auto_sync,
            "ludod started"
        );

        self.scheduler.start();
        let cancel = CancellationToken::new();
        let maintenance = tokio::spawn(maintenance_loop(
            self.orchestrator.clone(),
            self.config.maintenance_interval,
            cancel.clone(),
        ));

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        info!("shutdown requested");

        stop_maintenance(cancel, maintenance).await;
        self.scheduler.stop();
        if !self.orchestrator.shutdown().await {
            warn!("sync jobs still running after the grace period");
        }
        Ok(())
    }

    /// Runs one sync in the foreground and returns its final progress.
    pub async fn sync_once(
        &self,
        owner_id: &str,
        sync_type: SyncType,
    ) -> anyhow::Result<SyncProgress> {
        self.orchestrator
            .start_sync(owner_id, sync_type)
            .await
            .with_context(|| format!("failed to start {sync_type} sync for {owner_id}"))?;
        wait_for_job(&self.orchestrator, owner_id, SYNC_POLL).await
    }
}

async fn register_owners(
    repo: &dyn Repository,
    owners: &[String],
) -> Result<(), crate::repository::RepositoryError> {
    for owner_id in owners {
        if repo.get_owner_by_id(owner_id).await?.is_none() {
            repo.create_owner(&OwnerRecord::new(owner_id.as_str())).await?;
            info!(owner = %owner_id, "registered owner");
        }
    }
    // a crash mid-sync leaves the flag set and the owner unschedulable
    for mut owner in repo.get_all_owners().await? {
        if owner.sync_in_progress {
            owner.sync_in_progress = false;
            owner.updated_at = timestamp_now();
            repo.update_owner(&owner).await?;
            warn!(owner = %owner.owner_id, "cleared stale sync flag");
        }
    }
    Ok(())
}

async fn wait_for_job(
    orchestrator: &SyncOrchestrator,
    owner_id: &str,
    poll: Duration,
) -> anyhow::Result<SyncProgress> {
    while orchestrator.progress(owner_id).is_some() {
        tokio::time::sleep(poll).await;
    }
    orchestrator
        .history(owner_id)
        .into_iter()
        .next()
        .with_context(|| format!("no sync history for {owner_id}"))
}

async fn maintenance_loop(
    orchestrator: SyncOrchestrator,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                let report = run_maintenance_once(&orchestrator).await;
                debug!(
                    auto_resolved = report.auto_resolved,
                    purged_conflicts = report.purged_conflicts,
                    purged_cache_entries = report.purged_cache_entries,
                    "maintenance pass finished"
                );
            }
        }
    }
}

/// Cancels the maintenance loop and waits for it; returns whether it ended
/// cleanly.
async fn stop_maintenance(cancel: CancellationToken, task: JoinHandle<()>) -> bool {
    cancel.cancel();
    match task.await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "maintenance task ended abnormally");
            false
        }
    }
}

async fn run_maintenance_once(orchestrator: &SyncOrchestrator) -> MaintenanceReport {
    let resolver = orchestrator.resolver();
    let auto_resolved = if resolver.config().auto_resolve {
        resolver.auto_resolve_all().await.resolved
    } else {
        0
    };
    MaintenanceReport {
        auto_resolved,
        purged_conflicts: resolver.cleanup_old().await,
        purged_cache_entries: orchestrator.client().purge_cache(),
    }
}

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
