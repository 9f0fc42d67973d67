use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ludo_core::{CatalogClient, CatalogError, OwnedGame, RecentGame};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::repository::{GameRecord, OwnerRecord, Repository, RepositoryError, timestamp_now};
use crate::sync::progress::{HISTORY_LIMIT, SyncProgress, SyncStatus, SyncType};
use crate::sync::resolver::{ConflictResolver, Reconciled};

const SYNC_ACTOR: &str = "sync";
const DEFAULT_MAX_CONCURRENT_JOBS: usize = 3;
const DEFAULT_ITEM_DELAY_MS: u64 = 100;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
const DRAIN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("a sync is already running for owner {0}")]
    AlreadyRunning(String),
    #[error("no sync is running for owner {0}")]
    NotRunning(String),
    #[error("orchestrator is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_concurrent_jobs: usize,
    /// Pause between items of a full sync.
    pub item_delay: Duration,
    pub shutdown_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            item_delay: Duration::from_millis(DEFAULT_ITEM_DELAY_MS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

struct Job {
    progress: RwLock<SyncProgress>,
    cancelled: AtomicBool,
}

impl Job {
    fn new(progress: SyncProgress) -> Self {
        Self {
            progress: RwLock::new(progress),
            cancelled: AtomicBool::new(false),
        }
    }

    fn snapshot(&self) -> SyncProgress {
        match self.progress.read() {
            Ok(progress) => progress.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut SyncProgress) -> R) -> R {
        match self.progress.write() {
            Ok(mut progress) => f(&mut progress),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemChange {
    New,
    Updated,
    Unchanged,
}

enum JobOutcome {
    Completed,
    Cancelled,
}

struct Inner {
    client: CatalogClient,
    repo: Arc<dyn Repository>,
    resolver: Arc<ConflictResolver>,
    config: OrchestratorConfig,
    slots: Arc<Semaphore>,
    active: DashMap<String, Arc<Job>>,
    history: Mutex<HashMap<String, VecDeque<SyncProgress>>>,
    accepting: AtomicBool,
    shutdown: CancellationToken,
}

/// Runs sync jobs, one per owner at a time, bounded by a global slot count.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    pub fn new(
        client: CatalogClient,
        repo: Arc<dyn Repository>,
        resolver: Arc<ConflictResolver>,
        config: OrchestratorConfig,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self {
            inner: Arc::new(Inner {
                client,
                repo,
                resolver,
                config,
                slots,
                active: DashMap::new(),
                history: Mutex::new(HashMap::new()),
                accepting: AtomicBool::new(true),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.inner.resolver
    }

    pub fn client(&self) -> &CatalogClient {
        &self.inner.client
    }

    /// Registers a job for `owner_id` and spawns it. Returns the initial
    /// progress snapshot without waiting for the job.
    pub async fn start_sync(
        &self,
        owner_id: &str,
        sync_type: SyncType,
    ) -> Result<SyncProgress, OrchestratorError> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShuttingDown);
        }

        let job = Arc::new(Job::new(SyncProgress::new(owner_id, sync_type)));
        match self.inner.active.entry(owner_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(OrchestratorError::AlreadyRunning(owner_id.to_string()));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&job));
            }
        }

        let owner = match self.inner.claim_owner(owner_id).await {
            Ok(owner) => owner,
            Err(err) => {
                job.update(|progress| {
                    progress.record_error(format!("setup failed: {err}"));
                    progress.transition(SyncStatus::Failed);
                });
                self.inner.archive(owner_id, &job);
                warn!(owner = owner_id, error = %err, "sync setup failed");
                return Err(err.into());
            }
        };
        job.update(|progress| progress.library_id = Some(owner.library_id));
        let snapshot = job.snapshot();

        info!(owner = owner_id, %sync_type, "sync started");
        let inner = Arc::clone(&self.inner);
        let owner_id = owner_id.to_string();
        tokio::spawn(async move {
            inner.run_job(owner_id, job).await;
        });
        Ok(snapshot)
    }

    pub fn progress(&self, owner_id: &str) -> Option<SyncProgress> {
        self.inner.active.get(owner_id).map(|job| job.snapshot())
    }

    /// Finished jobs of one owner, most recent first.
    pub fn history(&self, owner_id: &str) -> Vec<SyncProgress> {
        let history = match self.inner.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        history
            .get(owner_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Flags the owner's job for cancellation; the worker stops at the next
    /// item boundary.
    pub fn cancel_sync(&self, owner_id: &str) -> Result<(), OrchestratorError> {
        let job = self
            .inner
            .active
            .get(owner_id)
            .ok_or_else(|| OrchestratorError::NotRunning(owner_id.to_string()))?;
        job.cancelled.store(true, Ordering::SeqCst);
        info!(owner = owner_id, "sync cancellation requested");
        Ok(())
    }

    pub fn is_active(&self, owner_id: &str) -> bool {
        self.inner.active.contains_key(owner_id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    pub fn list_active(&self) -> HashMap<String, SyncProgress> {
        self.inner
            .active
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    /// Stops accepting jobs, fails jobs still waiting for a slot and waits
    /// for running jobs up to the grace period. Returns whether everything
    /// drained in time.
    pub async fn shutdown(&self) -> bool {
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + self.inner.config.shutdown_grace;
        loop {
            let remaining = self.inner.active.len();
            if remaining == 0 {
                info!("orchestrator drained");
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining, "orchestrator shutdown grace period elapsed");
                return false;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }
}

impl Inner {
    async fn claim_owner(&self, owner_id: &str) -> Result<OwnerRecord, RepositoryError> {
        let mut owner = match self.repo.get_owner_by_id(owner_id).await? {
            Some(owner) => owner,
            None => self.repo.create_owner(&OwnerRecord::new(owner_id)).await?,
        };
        owner.sync_in_progress = true;
        owner.updated_at = timestamp_now();
        self.repo.update_owner(&owner).await?;
        Ok(owner)
    }

    async fn run_job(self: Arc<Self>, owner_id: String, job: Arc<Job>) {
        let permit = tokio::select! {
            permit = Arc::clone(&self.slots).acquire_owned() => permit.ok(),
            _ = self.shutdown.cancelled() => None,
        };
        let Some(_permit) = permit else {
            job.update(|progress| {
                progress.record_error("shut down before the job could start");
                progress.transition(SyncStatus::Failed);
            });
            self.finalize(&owner_id, &job).await;
            return;
        };

        job.update(|progress| progress.transition(SyncStatus::Running));
        let status = match self.execute(&owner_id, &job).await {
            Ok(JobOutcome::Completed) => SyncStatus::Completed,
            Ok(JobOutcome::Cancelled) => SyncStatus::Cancelled,
            Err(err) => {
                warn!(owner = %owner_id, error = %err, "sync failed");
                job.update(|progress| progress.record_error(err.to_string()));
                SyncStatus::Failed
            }
        };
        job.update(|progress| progress.transition(status));
        self.finalize(&owner_id, &job).await;
    }

    async fn execute(&self, owner_id: &str, job: &Job) -> Result<JobOutcome, OrchestratorError> {
        let sync_type = job.snapshot().sync_type;
        // cancelled while waiting for a slot
        if job.is_cancelled() {
            return Ok(JobOutcome::Cancelled);
        }
        self.refresh_profile(owner_id, job).await;

        let owned = self.client.get_owned_games(owner_id).await?;
        let stored: HashMap<u32, GameRecord> = self
            .repo
            .get_games_by_owner(owner_id)
            .await?
            .into_iter()
            .map(|game| (game.app_id, game))
            .collect();

        let (items, missing) = match sync_type {
            SyncType::Incremental => {
                let recent = self.client.get_recently_played(owner_id).await?;
                (incremental_items(owned, recent, &stored), Vec::new())
            }
            SyncType::Full => {
                let owned_ids: HashSet<u32> = owned.iter().map(|game| game.appid).collect();
                let mut missing: Vec<&GameRecord> = stored
                    .values()
                    .filter(|game| !owned_ids.contains(&game.app_id))
                    .collect();
                missing.sort_by_key(|game| game.app_id);
                (owned, missing)
            }
        };

        job.update(|progress| {
            progress.total_items = items.len();
            progress.touch();
        });
        debug!(owner = owner_id, %sync_type, items = items.len(), "sync work planned");

        for (index, summary) in items.iter().enumerate() {
            if job.is_cancelled() {
                return Ok(JobOutcome::Cancelled);
            }
            if sync_type == SyncType::Full && index > 0 && !self.config.item_delay.is_zero() {
                tokio::time::sleep(self.config.item_delay).await;
            }

            let local = stored.get(&summary.appid);
            let result = self.sync_item(owner_id, summary, local, job).await;
            job.update(|progress| {
                progress.processed_items += 1;
                match result {
                    Ok(change) => {
                        progress.successful_items += 1;
                        match change {
                            ItemChange::New => progress.new_items += 1,
                            ItemChange::Updated => progress.updated_items += 1,
                            ItemChange::Unchanged => {}
                        }
                    }
                    Err(err) => {
                        progress.failed_items += 1;
                        progress.error_messages.push(format!("app {}: {err}", summary.appid));
                    }
                }
                progress.touch();
            });
        }

        for game in missing {
            if job.is_cancelled() {
                return Ok(JobOutcome::Cancelled);
            }
            let outcome = self.resolver.reconcile(Some(game), None, SYNC_ACTOR).await;
            if let Reconciled::Delete(game) = outcome.action
                && let Err(err) = self.repo.delete_game(game.id).await
            {
                job.update(|progress| {
                    progress.record_error(format!("app {}: {err}", game.app_id));
                });
            }
        }

        Ok(JobOutcome::Completed)
    }

    async fn sync_item(
        &self,
        owner_id: &str,
        summary: &OwnedGame,
        local: Option<&GameRecord>,
        job: &Job,
    ) -> Result<ItemChange, RepositoryError> {
        let remote = self.remote_snapshot(owner_id, summary, local, job).await;
        let outcome = self
            .resolver
            .reconcile(local, Some(&remote), SYNC_ACTOR)
            .await;
        let now = timestamp_now();

        match outcome.action {
            Reconciled::Create(mut game) => {
                game.last_synced_at = Some(now);
                self.repo.create_game(&game).await?;
                Ok(ItemChange::New)
            }
            Reconciled::Update(mut game) => {
                game.last_synced_at = Some(now);
                self.repo.update_game(&game).await?;
                Ok(ItemChange::Updated)
            }
            Reconciled::Unchanged | Reconciled::Delete(_) => {
                if let Some(local) = local {
                    let mut game = local.clone();
                    game.last_synced_at = Some(now);
                    self.repo.update_game(&game).await?;
                }
                Ok(ItemChange::Unchanged)
            }
        }
    }

    /// Builds the remote view of one game. Details and review stats are
    /// fetched independently; a failure of either is recorded and leaves the
    /// corresponding fields unset.
    async fn remote_snapshot(
        &self,
        owner_id: &str,
        summary: &OwnedGame,
        local: Option<&GameRecord>,
        job: &Job,
    ) -> GameRecord {
        let app_id = summary.appid;
        let name = summary
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .or_else(|| local.map(|game| game.name.clone()))
            .unwrap_or_else(|| format!("App {app_id}"));

        let mut game = GameRecord::new(owner_id, app_id, name);
        game.icon_url = summary.icon_url();
        game.playtime_forever = summary.playtime_forever;
        game.playtime_two_weeks = summary.playtime_2weeks.unwrap_or(0);
        game.last_played = summary.rtime_last_played.filter(|at| *at > 0);

        match self.client.get_game_details(app_id).await {
            Ok(details) => {
                if !details.name.is_empty() {
                    game.name = details.name;
                }
                game.short_description = details.short_description;
                game.header_image = details.header_image;
                game.developers = details.developers;
                game.genres = details
                    .genres
                    .into_iter()
                    .map(|genre| genre.description)
                    .collect();
                game.release_date = details
                    .release_date
                    .map(|release| release.date)
                    .filter(|date| !date.is_empty());
                game.metacritic_score = details.metacritic.map(|metacritic| metacritic.score);
            }
            Err(err) => {
                debug!(app_id, error = %err, "game details unavailable");
                job.update(|progress| {
                    progress.record_error(format!("app {app_id}: details unavailable: {err}"));
                });
            }
        }

        match self.client.get_game_reviews(app_id).await {
            Ok(reviews) => {
                game.review_score = Some(reviews.review_score);
                game.review_summary = reviews.review_score_desc;
                game.total_positive = Some(reviews.total_positive);
                game.total_negative = Some(reviews.total_negative);
            }
            Err(err) => {
                debug!(app_id, error = %err, "review stats unavailable");
                job.update(|progress| {
                    progress.record_error(format!("app {app_id}: reviews unavailable: {err}"));
                });
            }
        }

        game
    }

    async fn refresh_profile(&self, owner_id: &str, job: &Job) {
        let profile = match self.client.get_player_profile(owner_id).await {
            Ok(profile) => profile,
            Err(err) => {
                debug!(owner = owner_id, error = %err, "profile refresh skipped");
                return;
            }
        };
        let result = async {
            let Some(mut owner) = self.repo.get_owner_by_id(owner_id).await? else {
                return Ok(());
            };
            owner.display_name = profile.personaname.or(owner.display_name);
            owner.avatar_url = profile.avatarfull.or(owner.avatar_url);
            owner.profile_url = profile.profileurl.or(owner.profile_url);
            owner.updated_at = timestamp_now();
            self.repo.update_owner(&owner).await
        }
        .await;
        if let Err(err) = result {
            job.update(|progress| progress.record_error(format!("profile update failed: {err}")));
        }
    }

    /// Clears the owner's in-progress flag, refreshes aggregate stats and
    /// stamps the sync time on success, then archives the progress.
    async fn finalize(&self, owner_id: &str, job: &Job) {
        let progress = job.snapshot();
        if let Err(err) = self.finalize_owner(owner_id, &progress).await {
            warn!(owner = owner_id, error = %err, "failed to finalize owner record");
        }
        self.archive(owner_id, job);
        info!(
            owner = owner_id,
            status = ?progress.status,
            processed = progress.processed_items,
            new = progress.new_items,
            updated = progress.updated_items,
            failed = progress.failed_items,
            "sync finished"
        );
    }

    async fn finalize_owner(
        &self,
        owner_id: &str,
        progress: &SyncProgress,
    ) -> Result<(), RepositoryError> {
        let Some(mut owner) = self.repo.get_owner_by_id(owner_id).await? else {
            return Ok(());
        };
        let now = timestamp_now();
        if progress.status == SyncStatus::Completed {
            match progress.sync_type {
                SyncType::Incremental => owner.last_incremental_sync = Some(now),
                SyncType::Full => owner.last_full_sync = Some(now),
            }
        }
        owner.sync_in_progress = false;
        let games = self.repo.get_games_by_owner(owner_id).await?;
        owner.recompute_stats(&games);
        owner.updated_at = now;
        self.repo.update_owner(&owner).await
    }

    fn archive(&self, owner_id: &str, job: &Job) {
        let snapshot = job.snapshot();
        {
            let mut history = match self.history.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let entries = history.entry(owner_id.to_string()).or_default();
            entries.push_front(snapshot);
            entries.truncate(HISTORY_LIMIT);
        }
        self.active.remove(owner_id);
    }
}

/// Recently played games first, then owned games not stored yet.
fn incremental_items(
    owned: Vec<OwnedGame>,
    recent: Vec<RecentGame>,
    stored: &HashMap<u32, GameRecord>,
) -> Vec<OwnedGame> {
    let mut owned_by_app: HashMap<u32, OwnedGame> =
        owned.iter().map(|game| (game.appid, game.clone())).collect();
    let mut seen = HashSet::new();
    let mut items = Vec::new();

    for game in recent {
        if !seen.insert(game.appid) {
            continue;
        }
        let recent_two_weeks = game.playtime_2weeks;
        let mut item = owned_by_app
            .remove(&game.appid)
            .unwrap_or_else(|| OwnedGame::from(game));
        item.playtime_2weeks = Some(recent_two_weeks);
        items.push(item);
    }
    for game in owned {
        if !stored.contains_key(&game.appid) && seen.insert(game.appid) {
            items.push(game);
        }
    }
    items
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
