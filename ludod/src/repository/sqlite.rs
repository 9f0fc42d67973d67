use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use time::OffsetDateTime;

use super::{GameRecord, OwnerRecord, Repository, RepositoryError};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const OWNER_COLUMNS: &str = "library_id, owner_id, display_name, avatar_url, profile_url, sync_in_progress, last_incremental_sync, last_full_sync, total_games, played_games, total_playtime_minutes, created_at, updated_at";

const GAME_COLUMNS: &str = "id, owner_id, app_id, name, icon_url, header_image, short_description, developers, genres, release_date, metacritic_score, review_score, review_summary, total_positive, total_negative, playtime_forever, playtime_two_weeks, last_played, custom_tags, custom_notes, custom_rating, created_at, updated_at, last_synced_at";

/// SQLite-backed repository. Every write is a single statement, so
/// concurrent sync jobs never observe half-written rows.
#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, RepositoryError> {
        let pool = SqlitePool::connect(database_url).await?;
        let repo = Self { pool };
        repo.init().await?;
        Ok(repo)
    }

    /// Single-connection in-memory database that lives as long as the pool.
    pub async fn in_memory() -> Result<Self, RepositoryError> {
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let repo = Self { pool };
        repo.init().await?;
        Ok(repo)
    }

    pub async fn open(path: &Path) -> Result<Self, RepositoryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let repo = Self { pool };
        repo.init().await?;
        Ok(repo)
    }

    pub fn default_path() -> Result<PathBuf, RepositoryError> {
        let base = dirs::data_dir().ok_or(RepositoryError::MissingDataDir)?;
        Ok(base.join("ludod").join("library.sqlite3"))
    }

    pub async fn init(&self) -> Result<(), RepositoryError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn get_owner_by_id(
        &self,
        owner_id: &str,
    ) -> Result<Option<OwnerRecord>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {OWNER_COLUMNS} FROM owners WHERE owner_id = ?1"
        ))
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(owner_from_row).transpose()
    }

    async fn create_owner(&self, owner: &OwnerRecord) -> Result<OwnerRecord, RepositoryError> {
        sqlx::query(
            "INSERT INTO owners (
                owner_id, display_name, avatar_url, profile_url, sync_in_progress,
                last_incremental_sync, last_full_sync, total_games, played_games,
                total_playtime_minutes, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(owner_id) DO NOTHING",
        )
        .bind(&owner.owner_id)
        .bind(&owner.display_name)
        .bind(&owner.avatar_url)
        .bind(&owner.profile_url)
        .bind(owner.sync_in_progress)
        .bind(owner.last_incremental_sync.map(OffsetDateTime::unix_timestamp))
        .bind(owner.last_full_sync.map(OffsetDateTime::unix_timestamp))
        .bind(owner.total_games)
        .bind(owner.played_games)
        .bind(owner.total_playtime_minutes)
        .bind(owner.created_at.unix_timestamp())
        .bind(owner.updated_at.unix_timestamp())
        .execute(&self.pool)
        .await?;

        self.get_owner_by_id(&owner.owner_id)
            .await?
            .ok_or_else(|| RepositoryError::OwnerNotFound(owner.owner_id.clone()))
    }

    async fn update_owner(&self, owner: &OwnerRecord) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE owners SET
                display_name = ?2,
                avatar_url = ?3,
                profile_url = ?4,
                sync_in_progress = ?5,
                last_incremental_sync = ?6,
                last_full_sync = ?7,
                total_games = ?8,
                played_games = ?9,
                total_playtime_minutes = ?10,
                updated_at = ?11
            WHERE owner_id = ?1",
        )
        .bind(&owner.owner_id)
        .bind(&owner.display_name)
        .bind(&owner.avatar_url)
        .bind(&owner.profile_url)
        .bind(owner.sync_in_progress)
        .bind(owner.last_incremental_sync.map(OffsetDateTime::unix_timestamp))
        .bind(owner.last_full_sync.map(OffsetDateTime::unix_timestamp))
        .bind(owner.total_games)
        .bind(owner.played_games)
        .bind(owner.total_playtime_minutes)
        .bind(owner.updated_at.unix_timestamp())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::OwnerNotFound(owner.owner_id.clone()));
        }
        Ok(())
    }

    async fn get_all_owners(&self) -> Result<Vec<OwnerRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {OWNER_COLUMNS} FROM owners ORDER BY library_id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(owner_from_row).collect()
    }

    async fn get_games_by_owner(
        &self,
        owner_id: &str,
    ) -> Result<Vec<GameRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {GAME_COLUMNS} FROM games WHERE owner_id = ?1 ORDER BY app_id ASC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(game_from_row).collect()
    }

    async fn get_game_by_id(&self, id: i64) -> Result<Option<GameRecord>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {GAME_COLUMNS} FROM games WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(game_from_row).transpose()
    }

    async fn get_game(
        &self,
        owner_id: &str,
        app_id: u32,
    ) -> Result<Option<GameRecord>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {GAME_COLUMNS} FROM games WHERE owner_id = ?1 AND app_id = ?2"
        ))
        .bind(owner_id)
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(game_from_row).transpose()
    }

    async fn create_game(&self, game: &GameRecord) -> Result<GameRecord, RepositoryError> {
        sqlx::query(
            "INSERT INTO games (
                owner_id, app_id, name, icon_url, header_image, short_description,
                developers, genres, release_date, metacritic_score, review_score,
                review_summary, total_positive, total_negative, playtime_forever,
                playtime_two_weeks, last_played, custom_tags, custom_notes, custom_rating,
                created_at, updated_at, last_synced_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)
            ON CONFLICT(owner_id, app_id) DO NOTHING",
        )
        .bind(&game.owner_id)
        .bind(game.app_id)
        .bind(&game.name)
        .bind(&game.icon_url)
        .bind(&game.header_image)
        .bind(&game.short_description)
        .bind(serde_json::to_string(&game.developers)?)
        .bind(serde_json::to_string(&game.genres)?)
        .bind(&game.release_date)
        .bind(game.metacritic_score)
        .bind(game.review_score)
        .bind(&game.review_summary)
        .bind(game.total_positive)
        .bind(game.total_negative)
        .bind(game.playtime_forever)
        .bind(game.playtime_two_weeks)
        .bind(game.last_played)
        .bind(serde_json::to_string(&game.custom_tags)?)
        .bind(&game.custom_notes)
        .bind(game.custom_rating)
        .bind(game.created_at.unix_timestamp())
        .bind(game.updated_at.unix_timestamp())
        .bind(game.last_synced_at.map(OffsetDateTime::unix_timestamp))
        .execute(&self.pool)
        .await?;

        self.get_game(&game.owner_id, game.app_id)
            .await?
            .ok_or_else(|| RepositoryError::OwnerNotFound(game.owner_id.clone()))
    }

    async fn update_game(&self, game: &GameRecord) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE games SET
                name = ?2,
                icon_url = ?3,
                header_image = ?4,
                short_description = ?5,
                developers = ?6,
                genres = ?7,
                release_date = ?8,
                metacritic_score = ?9,
                review_score = ?10,
                review_summary = ?11,
                total_positive = ?12,
                total_negative = ?13,
                playtime_forever = ?14,
                playtime_two_weeks = ?15,
                last_played = ?16,
                custom_tags = ?17,
                custom_notes = ?18,
                custom_rating = ?19,
                updated_at = ?20,
                last_synced_at = ?21
            WHERE id = ?1",
        )
        .bind(game.id)
        .bind(&game.name)
        .bind(&game.icon_url)
        .bind(&game.header_image)
        .bind(&game.short_description)
        .bind(serde_json::to_string(&game.developers)?)
        .bind(serde_json::to_string(&game.genres)?)
        .bind(&game.release_date)
        .bind(game.metacritic_score)
        .bind(game.review_score)
        .bind(&game.review_summary)
        .bind(game.total_positive)
        .bind(game.total_negative)
        .bind(game.playtime_forever)
        .bind(game.playtime_two_weeks)
        .bind(game.last_played)
        .bind(serde_json::to_string(&game.custom_tags)?)
        .bind(&game.custom_notes)
        .bind(game.custom_rating)
        .bind(game.updated_at.unix_timestamp())
        .bind(game.last_synced_at.map(OffsetDateTime::unix_timestamp))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::GameNotFound(game.id));
        }
        Ok(())
    }

    async fn delete_game(&self, id: i64) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM games WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn owner_from_row(row: &SqliteRow) -> Result<OwnerRecord, RepositoryError> {
    Ok(OwnerRecord {
        library_id: row.try_get("library_id")?,
        owner_id: row.try_get("owner_id")?,
        display_name: row.try_get("display_name")?,
        avatar_url: row.try_get("avatar_url")?,
        profile_url: row.try_get("profile_url")?,
        sync_in_progress: row.try_get("sync_in_progress")?,
        last_incremental_sync: optional_timestamp(row.try_get("last_incremental_sync")?)?,
        last_full_sync: optional_timestamp(row.try_get("last_full_sync")?)?,
        total_games: row.try_get("total_games")?,
        played_games: row.try_get("played_games")?,
        total_playtime_minutes: row.try_get("total_playtime_minutes")?,
        created_at: OffsetDateTime::from_unix_timestamp(row.try_get("created_at")?)?,
        updated_at: OffsetDateTime::from_unix_timestamp(row.try_get("updated_at")?)?,
    })
}

fn game_from_row(row: &SqliteRow) -> Result<GameRecord, RepositoryError> {
    let developers: String = row.try_get("developers")?;
    let genres: String = row.try_get("genres")?;
    let custom_tags: String = row.try_get("custom_tags")?;
    Ok(GameRecord {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        app_id: row.try_get("app_id")?,
        name: row.try_get("name")?,
        icon_url: row.try_get("icon_url")?,
        header_image: row.try_get("header_image")?,
        short_description: row.try_get("short_description")?,
        developers: serde_json::from_str(&developers)?,
        genres: serde_json::from_str(&genres)?,
        release_date: row.try_get("release_date")?,
        metacritic_score: row.try_get("metacritic_score")?,
        review_score: row.try_get("review_score")?,
        review_summary: row.try_get("review_summary")?,
        total_positive: row.try_get("total_positive")?,
        total_negative: row.try_get("total_negative")?,
        playtime_forever: row.try_get("playtime_forever")?,
        playtime_two_weeks: row.try_get("playtime_two_weeks")?,
        last_played: row.try_get("last_played")?,
        custom_tags: serde_json::from_str(&custom_tags)?,
        custom_notes: row.try_get("custom_notes")?,
        custom_rating: row.try_get("custom_rating")?,
        created_at: OffsetDateTime::from_unix_timestamp(row.try_get("created_at")?)?,
        updated_at: OffsetDateTime::from_unix_timestamp(row.try_get("updated_at")?)?,
        last_synced_at: optional_timestamp(row.try_get("last_synced_at")?)?,
    })
}

fn optional_timestamp(value: Option<i64>) -> Result<Option<OffsetDateTime>, RepositoryError> {
    value
        .map(OffsetDateTime::from_unix_timestamp)
        .transpose()
        .map_err(RepositoryError::from)
}

#[cfg(test)]
#[path = "sqlite_tests.rs"]
mod tests;
