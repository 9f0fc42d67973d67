use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::repository::{OwnerRecord, Repository, RepositoryError};
use crate::sync::orchestrator::SyncOrchestrator;
use crate::sync::progress::SyncType;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid scheduler config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub auto_sync: bool,
    pub incremental_interval: Duration,
    pub full_interval: Duration,
    pub max_concurrent_syncs: usize,
    /// Hour of day (0-23) at which automatic syncs pause.
    pub quiet_hours_start: u8,
    /// Hour of day (0-23) at which automatic syncs resume.
    pub quiet_hours_end: u8,
    pub activity_filter: bool,
    pub activity_threshold_days: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            auto_sync: true,
            incremental_interval: Duration::from_secs(60 * 60),
            full_interval: Duration::from_secs(24 * 60 * 60),
            max_concurrent_syncs: 2,
            quiet_hours_start: 2,
            quiet_hours_end: 6,
            activity_filter: true,
            activity_threshold_days: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.incremental_interval.is_zero() || self.full_interval.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "sync intervals must be positive".into(),
            ));
        }
        if self.quiet_hours_start >= 24 || self.quiet_hours_end >= 24 {
            return Err(SchedulerError::InvalidConfig(
                "quiet hours must be between 0 and 23".into(),
            ));
        }
        if self.max_concurrent_syncs == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max concurrent syncs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// `start > end` spans midnight; `start == end` disables quiet hours.
    pub fn is_quiet_hour(&self, hour: u8) -> bool {
        let (start, end) = (self.quiet_hours_start, self.quiet_hours_end);
        if start == end {
            false
        } else if start < end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }

    pub fn tick_period(&self) -> Duration {
        self.incremental_interval.min(self.full_interval)
    }
}

/// Decides which sync, if any, an owner is due for at `now`.
pub fn plan_sync(
    config: &SchedulerConfig,
    owner: &OwnerRecord,
    now: OffsetDateTime,
) -> Option<SyncType> {
    if config.activity_filter {
        let threshold = time::Duration::days(i64::from(config.activity_threshold_days));
        if now - owner.last_activity() > threshold {
            return None;
        }
    }
    let elapsed_since = |at: Option<OffsetDateTime>, interval: Duration| {
        at.is_none_or(|at| now - at > interval)
    };
    if elapsed_since(owner.last_full_sync, config.full_interval) {
        Some(SyncType::Full)
    } else if elapsed_since(owner.last_sync(), config.incremental_interval) {
        Some(SyncType::Incremental)
    } else {
        None
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub quiet_hours: bool,
    pub started: Vec<(String, SyncType)>,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub auto_sync: bool,
    pub scheduled_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run: Option<OffsetDateTime>,
    pub incremental_interval_secs: u64,
    pub full_interval_secs: u64,
    pub max_concurrent_syncs: usize,
    pub quiet_hours_start: u8,
    pub quiet_hours_end: u8,
}

#[derive(Debug, Default)]
struct Counters {
    scheduled: u64,
    completed: u64,
    failed: u64,
    last_run: Option<OffsetDateTime>,
}

struct LoopHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct SyncScheduler {
    orchestrator: SyncOrchestrator,
    repo: Arc<dyn Repository>,
    config: RwLock<SchedulerConfig>,
    task: Mutex<Option<LoopHandle>>,
    counters: Mutex<Counters>,
}

impl SyncScheduler {
    pub fn new(
        orchestrator: SyncOrchestrator,
        repo: Arc<dyn Repository>,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        Ok(Self {
            orchestrator,
            repo,
            config: RwLock::new(config),
            task: Mutex::new(None),
            counters: Mutex::new(Counters::default()),
        })
    }

    pub fn config(&self) -> SchedulerConfig {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Spawns the periodic loop. Returns `false` when auto-sync is off or the
    /// loop is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let config = self.config();
        if !config.auto_sync {
            info!("automatic sync disabled; scheduler not started");
            return false;
        }
        let mut task = lock(&self.task);
        if task.is_some() {
            return false;
        }

        let period = config.tick_period();
        let cancel = CancellationToken::new();
        let scheduler = Arc::downgrade(self);
        let handle = tokio::spawn(run_loop(scheduler, period, cancel.clone()));
        *task = Some(LoopHandle { cancel, handle });
        info!(period_secs = period.as_secs(), "scheduler started");
        true
    }

    /// Stops the loop; calling it again is a no-op. Returns whether a loop
    /// was running.
    pub fn stop(&self) -> bool {
        let Some(running) = lock(&self.task).take() else {
            return false;
        };
        running.cancel.cancel();
        drop(running.handle);
        info!("scheduler stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        lock(&self.task).is_some()
    }

    /// Swaps the config and restarts the loop so a new period or auto-sync
    /// flag takes effect immediately.
    pub fn update_config(self: &Arc<Self>, config: SchedulerConfig) -> Result<(), SchedulerError> {
        config.validate()?;
        match self.config.write() {
            Ok(mut current) => *current = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
        let was_running = self.stop();
        let started = self.start();
        debug!(was_running, started, "scheduler config updated");
        Ok(())
    }

    pub fn status(&self) -> SchedulerStatus {
        let config = self.config();
        let counters = lock(&self.counters);
        SchedulerStatus {
            running: self.is_running(),
            auto_sync: config.auto_sync,
            scheduled_count: counters.scheduled,
            completed_count: counters.completed,
            failed_count: counters.failed,
            last_run: counters.last_run,
            incremental_interval_secs: config.incremental_interval.as_secs(),
            full_interval_secs: config.full_interval.as_secs(),
            max_concurrent_syncs: config.max_concurrent_syncs,
            quiet_hours_start: config.quiet_hours_start,
            quiet_hours_end: config.quiet_hours_end,
        }
    }

    pub async fn tick(&self) -> Result<TickReport, SchedulerError> {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        self.tick_at(now).await
    }

    /// One scheduling pass as of `now`; the hour of `now` is checked against
    /// quiet hours.
    pub async fn tick_at(&self, now: OffsetDateTime) -> Result<TickReport, SchedulerError> {
        let config = self.config();
        let mut report = TickReport::default();
        if config.is_quiet_hour(now.hour()) {
            debug!(hour = now.hour(), "quiet hours; skipping scheduling pass");
            report.quiet_hours = true;
            return Ok(report);
        }

        let owners = match self.repo.get_all_owners().await {
            Ok(owners) => owners,
            Err(err) => {
                lock(&self.counters).failed += 1;
                return Err(err.into());
            }
        };

        let mut budget = config
            .max_concurrent_syncs
            .saturating_sub(self.orchestrator.active_count());
        for owner in owners {
            if budget == 0 {
                debug!("concurrency budget exhausted for this pass");
                break;
            }
            if owner.sync_in_progress || self.orchestrator.is_active(&owner.owner_id) {
                continue;
            }
            let Some(sync_type) = plan_sync(&config, &owner, now) else {
                continue;
            };
            match self.orchestrator.start_sync(&owner.owner_id, sync_type).await {
                Ok(_) => {
                    budget -= 1;
                    report.started.push((owner.owner_id.clone(), sync_type));
                }
                Err(err) => {
                    warn!(owner = %owner.owner_id, %sync_type, error = %err, "failed to schedule sync");
                    report.failed += 1;
                }
            }
        }

        let mut counters = lock(&self.counters);
        counters.scheduled += report.started.len() as u64;
        counters.failed += report.failed as u64;
        counters.completed += 1;
        counters.last_run = Some(now);
        if !report.started.is_empty() {
            info!(started = report.started.len(), "scheduled syncs");
        }
        Ok(report)
    }
}

async fn run_loop(scheduler: Weak<SyncScheduler>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(scheduler) = scheduler.upgrade() else {
                    break;
                };
                if let Err(err) = scheduler.tick().await {
                    warn!(error = %err, "scheduling pass failed");
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
