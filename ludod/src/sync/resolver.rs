use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::repository::{GameRecord, Repository, RepositoryError, timestamp_now};
use crate::sync::conflict::{
    ConflictInfo, ConflictResolutionConfig, ConflictStatus, ConflictType, ConflictValue, GameField,
    Resolution, ResolutionStrategy, ValueMismatch, decide, detect_conflicts,
};

pub const AUTO_RESOLVER: &str = "auto-resolver";
const MAX_BACKUPS: usize = 256;

type DivergenceKey = (String, u32, ConflictType, Option<GameField>);

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("conflict not found: {0}")]
    NotFound(String),
    #[error("conflict {id} is already {status:?}")]
    NotPending { id: String, status: ConflictStatus },
    #[error("manual strategy cannot be applied to conflict {0}")]
    ManualStrategy(String),
    #[error("game {app_id} of owner {owner_id} is no longer stored")]
    MissingGame { owner_id: String, app_id: u32 },
    #[error(transparent)]
    Value(#[from] ValueMismatch),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Snapshot of a game taken right before a resolution mutated it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GameBackup {
    pub conflict_id: String,
    pub game: GameRecord,
    #[serde(with = "time::serde::rfc3339")]
    pub taken_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AutoResolveReport {
    pub resolved: usize,
    pub skipped_manual: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictStatistics {
    pub total: usize,
    pub pending: usize,
    pub resolved: usize,
    pub ignored: usize,
    pub failed: usize,
    pub by_type: BTreeMap<ConflictType, usize>,
    pub auto_resolve_enabled: bool,
    pub default_strategy: ResolutionStrategy,
}

/// What the orchestrator should persist after reconciling one game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    Unchanged,
    Create(GameRecord),
    Update(GameRecord),
    Delete(GameRecord),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub action: Reconciled,
    pub detected: usize,
    pub applied: usize,
    pub pending: usize,
}

pub struct ConflictResolver {
    repo: Arc<dyn Repository>,
    config: RwLock<ConflictResolutionConfig>,
    registry: AsyncMutex<HashMap<String, ConflictInfo>>,
    backups: Mutex<VecDeque<GameBackup>>,
}

impl ConflictResolver {
    pub fn new(repo: Arc<dyn Repository>, config: ConflictResolutionConfig) -> Self {
        Self {
            repo,
            config: RwLock::new(config),
            registry: AsyncMutex::new(HashMap::new()),
            backups: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> ConflictResolutionConfig {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update_config(&self, config: ConflictResolutionConfig) {
        match self.config.write() {
            Ok(mut current) => *current = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }

    /// Compares the snapshots and registers every divergence as pending. A
    /// divergence that is already pending keeps its id and is refreshed with
    /// the new values.
    pub async fn detect(
        &self,
        local: Option<&GameRecord>,
        remote: Option<&GameRecord>,
    ) -> Vec<ConflictInfo> {
        let mut conflicts = detect_conflicts(local, remote, timestamp_now());
        if !conflicts.is_empty() {
            let mut registry = self.registry.lock().await;
            adopt_pending(&registry, &mut conflicts);
            for conflict in &conflicts {
                registry.insert(conflict.id.clone(), conflict.clone());
            }
        }
        conflicts
    }

    /// Detects divergences and, when auto-resolution is on, applies the
    /// per-type policy in memory. Conflicts whose policy is manual stay
    /// pending. Nothing is persisted here; the caller writes the returned
    /// action once.
    pub async fn reconcile(
        &self,
        local: Option<&GameRecord>,
        remote: Option<&GameRecord>,
        actor: &str,
    ) -> Reconciliation {
        let now = timestamp_now();
        let config = self.config();
        let mut conflicts = detect_conflicts(local, remote, now);
        let detected = conflicts.len();
        if !conflicts.is_empty() {
            adopt_pending(&*self.registry.lock().await, &mut conflicts);
        }

        let mut working = local.cloned();
        let mut changed = false;
        let mut create = None;
        let mut delete = false;
        let mut applied = 0;
        let mut pending = 0;

        for conflict in &mut conflicts {
            let strategy = config.strategy_for(conflict.conflict_type);
            let resolution = match decide(conflict, strategy, &config) {
                Some(resolution) if config.auto_resolve => resolution,
                _ => {
                    pending += 1;
                    continue;
                }
            };

            let outcome = match (conflict.field, &resolution) {
                (_, Resolution::KeepLocal) => Ok(false),
                (Some(field), resolution) => match working.as_mut() {
                    Some(game) => {
                        if config.backup_before_resolve && !changed {
                            self.push_backup(&conflict.id, game, now);
                        }
                        let value = match resolution {
                            Resolution::Set(value) => value,
                            _ => &conflict.remote_value,
                        };
                        field.write(game, value).map(|()| true)
                    }
                    None => Ok(false),
                },
                (None, _) => {
                    match conflict.conflict_type {
                        ConflictType::ResourceAddition => create = remote.cloned(),
                        ConflictType::ResourceDeletion => {
                            if let Some(game) = local {
                                if config.backup_before_resolve {
                                    self.push_backup(&conflict.id, game, now);
                                }
                                delete = true;
                            }
                        }
                        _ => {}
                    }
                    Ok(false)
                }
            };

            match outcome {
                Ok(wrote) => {
                    changed |= wrote;
                    applied += 1;
                    conflict.settle(ConflictStatus::Resolved, Some(strategy), actor, now);
                }
                Err(err) => {
                    warn!(conflict = %conflict.id, error = %err, "failed to apply resolution");
                    conflict.failure = Some(err.to_string());
                    conflict.settle(ConflictStatus::Failed, Some(strategy), actor, now);
                }
            }
        }

        if !conflicts.is_empty() {
            let mut registry = self.registry.lock().await;
            for conflict in conflicts {
                registry.insert(conflict.id.clone(), conflict);
            }
        }

        let action = if let Some(game) = create {
            Reconciled::Create(game)
        } else if delete {
            match local {
                Some(game) => Reconciled::Delete(game.clone()),
                None => Reconciled::Unchanged,
            }
        } else {
            match working {
                Some(mut game) if changed => {
                    game.updated_at = now;
                    Reconciled::Update(game)
                }
                _ => Reconciled::Unchanged,
            }
        };

        Reconciliation {
            action,
            detected,
            applied,
            pending,
        }
    }

    pub async fn resolve(
        &self,
        id: &str,
        strategy: ResolutionStrategy,
        resolved_by: &str,
    ) -> Result<(), ResolveError> {
        let mut registry = self.registry.lock().await;
        let conflict = registry
            .get(id)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(id.to_string()))?;
        if !conflict.is_pending() {
            return Err(ResolveError::NotPending {
                id: id.to_string(),
                status: conflict.status,
            });
        }
        let config = self.config();
        let Some(resolution) = decide(&conflict, strategy, &config) else {
            return Err(ResolveError::ManualStrategy(id.to_string()));
        };

        let result = self.apply(&conflict, &resolution, &config).await;
        let now = timestamp_now();
        if let Some(stored) = registry.get_mut(id) {
            match &result {
                Ok(()) => stored.settle(ConflictStatus::Resolved, Some(strategy), resolved_by, now),
                Err(err) => {
                    stored.failure = Some(err.to_string());
                    stored.settle(ConflictStatus::Failed, Some(strategy), resolved_by, now);
                }
            }
        }
        match &result {
            Ok(()) => debug!(conflict = id, %strategy, "conflict resolved"),
            Err(err) => warn!(conflict = id, %strategy, error = %err, "conflict resolution failed"),
        }
        result
    }

    /// Settles a pending conflict without touching the stored game.
    pub async fn ignore(&self, id: &str, resolved_by: &str) -> Result<(), ResolveError> {
        let mut registry = self.registry.lock().await;
        let conflict = registry
            .get_mut(id)
            .ok_or_else(|| ResolveError::NotFound(id.to_string()))?;
        if !conflict.is_pending() {
            return Err(ResolveError::NotPending {
                id: id.to_string(),
                status: conflict.status,
            });
        }
        conflict.settle(ConflictStatus::Ignored, None, resolved_by, timestamp_now());
        Ok(())
    }

    pub async fn auto_resolve_all(&self) -> AutoResolveReport {
        let config = self.config();
        let pending: Vec<(String, ConflictType)> = {
            let registry = self.registry.lock().await;
            registry
                .values()
                .filter(|conflict| conflict.is_pending())
                .map(|conflict| (conflict.id.clone(), conflict.conflict_type))
                .collect()
        };

        let mut report = AutoResolveReport::default();
        for (id, conflict_type) in pending {
            let strategy = config.strategy_for(conflict_type);
            if strategy == ResolutionStrategy::Manual {
                report.skipped_manual += 1;
                continue;
            }
            match self.resolve(&id, strategy, AUTO_RESOLVER).await {
                Ok(()) => report.resolved += 1,
                // settled concurrently
                Err(ResolveError::NotPending { .. } | ResolveError::NotFound(_)) => {}
                Err(_) => report.failed += 1,
            }
        }
        if report.resolved > 0 || report.failed > 0 {
            info!(
                resolved = report.resolved,
                failed = report.failed,
                skipped_manual = report.skipped_manual,
                "auto-resolve sweep finished"
            );
        }
        report
    }

    pub async fn conflict(&self, id: &str) -> Option<ConflictInfo> {
        self.registry.lock().await.get(id).cloned()
    }

    /// Conflicts ordered by detection time; `None` filters match everything.
    pub async fn conflicts(
        &self,
        status: Option<ConflictStatus>,
        conflict_type: Option<ConflictType>,
    ) -> Vec<ConflictInfo> {
        let registry = self.registry.lock().await;
        let mut matching: Vec<ConflictInfo> = registry
            .values()
            .filter(|c| status.is_none_or(|status| c.status == status))
            .filter(|c| conflict_type.is_none_or(|ty| c.conflict_type == ty))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.detected_at.cmp(&b.detected_at).then(a.id.cmp(&b.id)));
        matching
    }

    pub async fn statistics(&self) -> ConflictStatistics {
        let config = self.config();
        let registry = self.registry.lock().await;
        let mut stats = ConflictStatistics {
            total: registry.len(),
            pending: 0,
            resolved: 0,
            ignored: 0,
            failed: 0,
            by_type: BTreeMap::new(),
            auto_resolve_enabled: config.auto_resolve,
            default_strategy: config.default_strategy,
        };
        for conflict in registry.values() {
            match conflict.status {
                ConflictStatus::Pending => stats.pending += 1,
                ConflictStatus::Resolved => stats.resolved += 1,
                ConflictStatus::Ignored => stats.ignored += 1,
                ConflictStatus::Failed => stats.failed += 1,
            }
            *stats.by_type.entry(conflict.conflict_type).or_default() += 1;
        }
        stats
    }

    /// Drops settled conflicts resolved longer ago than the configured max
    /// age. Pending conflicts are kept regardless of age.
    pub async fn cleanup_old(&self) -> usize {
        self.cleanup_before(timestamp_now()).await
    }

    pub(crate) async fn cleanup_before(&self, now: OffsetDateTime) -> usize {
        let max_age = time::Duration::days(i64::from(self.config().max_conflict_age_days));
        let cutoff = now - max_age;
        let mut registry = self.registry.lock().await;
        let before = registry.len();
        registry.retain(|_, conflict| {
            conflict.is_pending() || conflict.resolved_at.is_none_or(|at| at >= cutoff)
        });
        let purged = before - registry.len();
        if purged > 0 {
            debug!(purged, "purged settled conflicts");
        }
        purged
    }

    /// Backups of one game, oldest first.
    pub fn backups(&self, owner_id: &str, app_id: u32) -> Vec<GameBackup> {
        let backups = match self.backups.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        backups
            .iter()
            .filter(|b| b.game.owner_id == owner_id && b.game.app_id == app_id)
            .cloned()
            .collect()
    }

    async fn apply(
        &self,
        conflict: &ConflictInfo,
        resolution: &Resolution,
        config: &ConflictResolutionConfig,
    ) -> Result<(), ResolveError> {
        let value = match resolution {
            Resolution::KeepLocal => return Ok(()),
            Resolution::TakeRemote => &conflict.remote_value,
            Resolution::Set(value) => value,
        };
        let now = timestamp_now();

        if let Some(field) = conflict.field {
            let mut game = self
                .repo
                .get_game(&conflict.owner_id, conflict.resource_id)
                .await?
                .ok_or_else(|| ResolveError::MissingGame {
                    owner_id: conflict.owner_id.clone(),
                    app_id: conflict.resource_id,
                })?;
            if config.backup_before_resolve {
                self.push_backup(&conflict.id, &game, now);
            }
            field.write(&mut game, value)?;
            game.updated_at = now;
            self.repo.update_game(&game).await?;
            return Ok(());
        }

        match (conflict.conflict_type, value) {
            (ConflictType::ResourceAddition, ConflictValue::Record(Some(remote))) => {
                self.repo.create_game(remote).await?;
            }
            (ConflictType::ResourceDeletion, _) => {
                let stored = self
                    .repo
                    .get_game(&conflict.owner_id, conflict.resource_id)
                    .await?;
                if let Some(game) = stored {
                    if config.backup_before_resolve {
                        self.push_backup(&conflict.id, &game, now);
                    }
                    self.repo.delete_game(game.id).await?;
                }
            }
            _ => {
                return Err(ResolveError::MissingGame {
                    owner_id: conflict.owner_id.clone(),
                    app_id: conflict.resource_id,
                });
            }
        }
        Ok(())
    }

    fn push_backup(&self, conflict_id: &str, game: &GameRecord, taken_at: OffsetDateTime) {
        let mut backups = match self.backups.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if backups.len() == MAX_BACKUPS {
            backups.pop_front();
        }
        backups.push_back(GameBackup {
            conflict_id: conflict_id.to_string(),
            game: game.clone(),
            taken_at,
        });
    }
}

fn divergence_key(conflict: &ConflictInfo) -> DivergenceKey {
    (
        conflict.owner_id.clone(),
        conflict.resource_id,
        conflict.conflict_type,
        conflict.field,
    )
}

/// Points re-detected divergences at the pending conflict they repeat so the
/// registry holds one entry per divergence.
fn adopt_pending(registry: &HashMap<String, ConflictInfo>, conflicts: &mut [ConflictInfo]) {
    let pending: HashMap<DivergenceKey, &ConflictInfo> = registry
        .values()
        .filter(|conflict| conflict.is_pending())
        .map(|conflict| (divergence_key(conflict), conflict))
        .collect();
    for conflict in conflicts {
        if let Some(existing) = pending.get(&divergence_key(conflict)) {
            conflict.id = existing.id.clone();
            conflict.detected_at = existing.detected_at;
        }
    }
}

#[cfg(test)]
#[path = "resolver_tests.rs"]
mod tests;
