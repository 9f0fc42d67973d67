//! Storage contract for owner libraries and their synced games.

mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

pub use sqlite::SqliteRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid list column: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid timestamp: {0}")]
    Timestamp(#[from] time::error::ComponentRange),
    #[error("owner not found: {0}")]
    OwnerNotFound(String),
    #[error("game not found: {0}")]
    GameNotFound(i64),
}

/// One owner's library record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub library_id: i64,
    pub owner_id: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub profile_url: Option<String>,
    pub sync_in_progress: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_incremental_sync: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_full_sync: Option<OffsetDateTime>,
    pub total_games: i64,
    pub played_games: i64,
    pub total_playtime_minutes: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl OwnerRecord {
    pub fn new(owner_id: impl Into<String>) -> Self {
        let now = timestamp_now();
        Self {
            library_id: 0,
            owner_id: owner_id.into(),
            display_name: None,
            avatar_url: None,
            profile_url: None,
            sync_in_progress: false,
            last_incremental_sync: None,
            last_full_sync: None,
            total_games: 0,
            played_games: 0,
            total_playtime_minutes: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Most recent successful sync of either kind.
    pub fn last_sync(&self) -> Option<OffsetDateTime> {
        self.last_incremental_sync.max(self.last_full_sync)
    }

    /// Latest of the last sync and the last record update.
    pub fn last_activity(&self) -> OffsetDateTime {
        self.last_sync()
            .map_or(self.updated_at, |synced| synced.max(self.updated_at))
    }

    pub fn recompute_stats(&mut self, games: &[GameRecord]) {
        self.total_games = games.len() as i64;
        self.played_games = games.iter().filter(|g| g.playtime_forever > 0).count() as i64;
        self.total_playtime_minutes = games.iter().map(|g| g.playtime_forever).sum();
    }
}

/// One game in an owner's library: remote metadata, usage stats and the
/// owner's own customizations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameRecord {
    pub id: i64,
    pub owner_id: String,
    pub app_id: u32,
    pub name: String,
    pub icon_url: Option<String>,
    pub header_image: Option<String>,
    pub short_description: Option<String>,
    pub developers: Vec<String>,
    pub genres: Vec<String>,
    pub release_date: Option<String>,
    pub metacritic_score: Option<i64>,
    pub review_score: Option<i64>,
    pub review_summary: Option<String>,
    pub total_positive: Option<i64>,
    pub total_negative: Option<i64>,
    pub playtime_forever: i64,
    pub playtime_two_weeks: i64,
    /// Unix seconds.
    pub last_played: Option<i64>,
    pub custom_tags: Vec<String>,
    pub custom_notes: Option<String>,
    pub custom_rating: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_synced_at: Option<OffsetDateTime>,
}

impl GameRecord {
    pub fn new(owner_id: impl Into<String>, app_id: u32, name: impl Into<String>) -> Self {
        let now = timestamp_now();
        Self {
            id: 0,
            owner_id: owner_id.into(),
            app_id,
            name: name.into(),
            icon_url: None,
            header_image: None,
            short_description: None,
            developers: Vec::new(),
            genres: Vec::new(),
            release_date: None,
            metacritic_score: None,
            review_score: None,
            review_summary: None,
            total_positive: None,
            total_negative: None,
            playtime_forever: 0,
            playtime_two_weeks: 0,
            last_played: None,
            custom_tags: Vec::new(),
            custom_notes: None,
            custom_rating: None,
            created_at: now,
            updated_at: now,
            last_synced_at: None,
        }
    }
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_owner_by_id(&self, owner_id: &str)
    -> Result<Option<OwnerRecord>, RepositoryError>;

    async fn create_owner(&self, owner: &OwnerRecord) -> Result<OwnerRecord, RepositoryError>;

    async fn update_owner(&self, owner: &OwnerRecord) -> Result<(), RepositoryError>;

    async fn get_all_owners(&self) -> Result<Vec<OwnerRecord>, RepositoryError>;

    async fn get_games_by_owner(&self, owner_id: &str)
    -> Result<Vec<GameRecord>, RepositoryError>;

    async fn get_game_by_id(&self, id: i64) -> Result<Option<GameRecord>, RepositoryError>;

    async fn get_game(
        &self,
        owner_id: &str,
        app_id: u32,
    ) -> Result<Option<GameRecord>, RepositoryError>;

    /// Inserts the game unless the owner already has it; either way the
    /// stored row is returned, so replaying a creation is harmless.
    async fn create_game(&self, game: &GameRecord) -> Result<GameRecord, RepositoryError>;

    async fn update_game(&self, game: &GameRecord) -> Result<(), RepositoryError>;

    async fn delete_game(&self, id: i64) -> Result<(), RepositoryError>;
}

/// Current UTC time truncated to whole seconds, the precision stored on disk.
pub fn timestamp_now() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(0).unwrap_or(now)
}
