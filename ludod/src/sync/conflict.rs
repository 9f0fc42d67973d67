use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::repository::GameRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    Metadata,
    UsageStat,
    CustomTag,
    CustomNote,
    CustomRating,
    ResourceDeletion,
    ResourceAddition,
}

impl ConflictType {
    pub const ALL: [ConflictType; 7] = [
        ConflictType::Metadata,
        ConflictType::UsageStat,
        ConflictType::CustomTag,
        ConflictType::CustomNote,
        ConflictType::CustomRating,
        ConflictType::ResourceDeletion,
        ConflictType::ResourceAddition,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::Metadata => "metadata",
            ConflictType::UsageStat => "usage_stat",
            ConflictType::CustomTag => "custom_tag",
            ConflictType::CustomNote => "custom_note",
            ConflictType::CustomRating => "custom_rating",
            ConflictType::ResourceDeletion => "resource_deletion",
            ConflictType::ResourceAddition => "resource_addition",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
    Ignored,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    PreferRemote,
    PreferLocal,
    Manual,
    Merge,
    Newest,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::PreferRemote => "prefer_remote",
            ResolutionStrategy::PreferLocal => "prefer_local",
            ResolutionStrategy::Manual => "manual",
            ResolutionStrategy::Merge => "merge",
            ResolutionStrategy::Newest => "newest",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseNameError {
    kind: &'static str,
    value: String,
}

impl FromStr for ResolutionStrategy {
    type Err = ParseNameError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "prefer_remote" | "remote" => Ok(ResolutionStrategy::PreferRemote),
            "prefer_local" | "local" => Ok(ResolutionStrategy::PreferLocal),
            "manual" => Ok(ResolutionStrategy::Manual),
            "merge" => Ok(ResolutionStrategy::Merge),
            "newest" => Ok(ResolutionStrategy::Newest),
            other => Err(ParseNameError {
                kind: "resolution strategy",
                value: other.to_string(),
            }),
        }
    }
}

impl FromStr for ConflictType {
    type Err = ParseNameError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_ascii_lowercase();
        ConflictType::ALL
            .into_iter()
            .find(|ty| ty.as_str() == value)
            .ok_or(ParseNameError {
                kind: "conflict type",
                value,
            })
    }
}

/// A tracked field of a game. Each field has one conflict type and one value
/// shape, so conflict payloads never need runtime type guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameField {
    Name,
    IconUrl,
    HeaderImage,
    ShortDescription,
    Developers,
    Genres,
    ReleaseDate,
    MetacriticScore,
    ReviewScore,
    ReviewSummary,
    TotalPositive,
    TotalNegative,
    PlaytimeForever,
    PlaytimeTwoWeeks,
    LastPlayed,
    CustomTags,
    CustomNotes,
    CustomRating,
}

impl GameField {
    pub const TRACKED: [GameField; 18] = [
        GameField::Name,
        GameField::IconUrl,
        GameField::HeaderImage,
        GameField::ShortDescription,
        GameField::Developers,
        GameField::Genres,
        GameField::ReleaseDate,
        GameField::MetacriticScore,
        GameField::ReviewScore,
        GameField::ReviewSummary,
        GameField::TotalPositive,
        GameField::TotalNegative,
        GameField::PlaytimeForever,
        GameField::PlaytimeTwoWeeks,
        GameField::LastPlayed,
        GameField::CustomTags,
        GameField::CustomNotes,
        GameField::CustomRating,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GameField::Name => "name",
            GameField::IconUrl => "icon_url",
            GameField::HeaderImage => "header_image",
            GameField::ShortDescription => "short_description",
            GameField::Developers => "developers",
            GameField::Genres => "genres",
            GameField::ReleaseDate => "release_date",
            GameField::MetacriticScore => "metacritic_score",
            GameField::ReviewScore => "review_score",
            GameField::ReviewSummary => "review_summary",
            GameField::TotalPositive => "total_positive",
            GameField::TotalNegative => "total_negative",
            GameField::PlaytimeForever => "playtime_forever",
            GameField::PlaytimeTwoWeeks => "playtime_two_weeks",
            GameField::LastPlayed => "last_played",
            GameField::CustomTags => "custom_tags",
            GameField::CustomNotes => "custom_notes",
            GameField::CustomRating => "custom_rating",
        }
    }

    pub fn conflict_type(&self) -> ConflictType {
        match self {
            GameField::PlaytimeForever | GameField::PlaytimeTwoWeeks | GameField::LastPlayed => {
                ConflictType::UsageStat
            }
            GameField::CustomTags => ConflictType::CustomTag,
            GameField::CustomNotes => ConflictType::CustomNote,
            GameField::CustomRating => ConflictType::CustomRating,
            _ => ConflictType::Metadata,
        }
    }

    pub fn read(&self, game: &GameRecord) -> ConflictValue {
        match self {
            GameField::Name => ConflictValue::Text(Some(game.name.clone())),
            GameField::IconUrl => ConflictValue::Text(game.icon_url.clone()),
            GameField::HeaderImage => ConflictValue::Text(game.header_image.clone()),
            GameField::ShortDescription => ConflictValue::Text(game.short_description.clone()),
            GameField::Developers => ConflictValue::List(game.developers.clone()),
            GameField::Genres => ConflictValue::List(game.genres.clone()),
            GameField::ReleaseDate => ConflictValue::Text(game.release_date.clone()),
            GameField::MetacriticScore => ConflictValue::Number(game.metacritic_score),
            GameField::ReviewScore => ConflictValue::Number(game.review_score),
            GameField::ReviewSummary => ConflictValue::Text(game.review_summary.clone()),
            GameField::TotalPositive => ConflictValue::Number(game.total_positive),
            GameField::TotalNegative => ConflictValue::Number(game.total_negative),
            GameField::PlaytimeForever => ConflictValue::Number(Some(game.playtime_forever)),
            GameField::PlaytimeTwoWeeks => ConflictValue::Number(Some(game.playtime_two_weeks)),
            GameField::LastPlayed => ConflictValue::Number(game.last_played),
            GameField::CustomTags => ConflictValue::List(game.custom_tags.clone()),
            GameField::CustomNotes => ConflictValue::Text(game.custom_notes.clone()),
            GameField::CustomRating => ConflictValue::Number(game.custom_rating),
        }
    }

    pub fn write(&self, game: &mut GameRecord, value: &ConflictValue) -> Result<(), ValueMismatch> {
        let mismatch = || ValueMismatch {
            field: *self,
            value: value.kind(),
        };
        match (self, value) {
            (GameField::Name, ConflictValue::Text(Some(v))) => game.name = v.clone(),
            (GameField::IconUrl, ConflictValue::Text(v)) => game.icon_url = v.clone(),
            (GameField::HeaderImage, ConflictValue::Text(v)) => game.header_image = v.clone(),
            (GameField::ShortDescription, ConflictValue::Text(v)) => {
                game.short_description = v.clone()
            }
            (GameField::Developers, ConflictValue::List(v)) => game.developers = v.clone(),
            (GameField::Genres, ConflictValue::List(v)) => game.genres = v.clone(),
            (GameField::ReleaseDate, ConflictValue::Text(v)) => game.release_date = v.clone(),
            (GameField::MetacriticScore, ConflictValue::Number(v)) => game.metacritic_score = *v,
            (GameField::ReviewScore, ConflictValue::Number(v)) => game.review_score = *v,
            (GameField::ReviewSummary, ConflictValue::Text(v)) => game.review_summary = v.clone(),
            (GameField::TotalPositive, ConflictValue::Number(v)) => game.total_positive = *v,
            (GameField::TotalNegative, ConflictValue::Number(v)) => game.total_negative = *v,
            (GameField::PlaytimeForever, ConflictValue::Number(Some(v))) => {
                game.playtime_forever = *v
            }
            (GameField::PlaytimeTwoWeeks, ConflictValue::Number(Some(v))) => {
                game.playtime_two_weeks = *v
            }
            (GameField::LastPlayed, ConflictValue::Number(v)) => game.last_played = *v,
            (GameField::CustomTags, ConflictValue::List(v)) => game.custom_tags = v.clone(),
            (GameField::CustomNotes, ConflictValue::Text(v)) => game.custom_notes = v.clone(),
            (GameField::CustomRating, ConflictValue::Number(v)) => game.custom_rating = *v,
            _ => return Err(mismatch()),
        }
        Ok(())
    }
}

impl FromStr for GameField {
    type Err = ParseNameError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_ascii_lowercase();
        GameField::TRACKED
            .into_iter()
            .find(|field| field.as_str() == value)
            .ok_or(ParseNameError {
                kind: "game field",
                value,
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{value} value cannot be written to {}", field.as_str())]
pub struct ValueMismatch {
    pub field: GameField,
    pub value: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ConflictValue {
    Text(Option<String>),
    Number(Option<i64>),
    List(Vec<String>),
    Record(Option<Box<GameRecord>>),
}

impl ConflictValue {
    pub fn kind(&self) -> &'static str {
        match self {
            ConflictValue::Text(_) => "text",
            ConflictValue::Number(_) => "number",
            ConflictValue::List(_) => "list",
            ConflictValue::Record(_) => "record",
        }
    }

    /// True when the side carries no information for the field.
    pub fn is_unset(&self) -> bool {
        match self {
            ConflictValue::Text(v) => v.as_deref().is_none_or(str::is_empty),
            ConflictValue::Number(v) => v.is_none(),
            ConflictValue::List(v) => v.is_empty(),
            ConflictValue::Record(v) => v.is_none(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub id: String,
    pub owner_id: String,
    /// Catalog app id of the diverging game.
    pub resource_id: u32,
    pub conflict_type: ConflictType,
    /// `None` for whole-record conflicts (addition/deletion).
    pub field: Option<GameField>,
    pub local_value: ConflictValue,
    pub remote_value: ConflictValue,
    #[serde(with = "time::serde::rfc3339::option")]
    pub local_timestamp: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub remote_timestamp: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub detected_at: OffsetDateTime,
    pub status: ConflictStatus,
    pub strategy: Option<ResolutionStrategy>,
    pub resolved_by: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
    pub failure: Option<String>,
}

impl ConflictInfo {
    fn pending(
        owner_id: &str,
        resource_id: u32,
        conflict_type: ConflictType,
        field: Option<GameField>,
        local_value: ConflictValue,
        remote_value: ConflictValue,
        timestamps: (Option<OffsetDateTime>, Option<OffsetDateTime>),
        detected_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            owner_id: owner_id.to_string(),
            resource_id,
            conflict_type,
            field,
            local_value,
            remote_value,
            local_timestamp: timestamps.0,
            remote_timestamp: timestamps.1,
            detected_at,
            status: ConflictStatus::Pending,
            strategy: None,
            resolved_by: None,
            resolved_at: None,
            failure: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ConflictStatus::Pending
    }

    pub(crate) fn settle(
        &mut self,
        status: ConflictStatus,
        strategy: Option<ResolutionStrategy>,
        actor: &str,
        at: OffsetDateTime,
    ) {
        self.status = status;
        self.strategy = strategy;
        self.resolved_by = Some(actor.to_string());
        self.resolved_at = Some(at);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictResolutionConfig {
    pub default_strategy: ResolutionStrategy,
    pub strategy_by_type: HashMap<ConflictType, ResolutionStrategy>,
    pub auto_resolve: bool,
    pub backup_before_resolve: bool,
    pub max_conflict_age_days: u32,
    /// Fields that keep the local value whatever the strategy says.
    pub protected_fields: Vec<GameField>,
}

impl ConflictResolutionConfig {
    pub fn strategy_for(&self, conflict_type: ConflictType) -> ResolutionStrategy {
        self.strategy_by_type
            .get(&conflict_type)
            .copied()
            .unwrap_or(self.default_strategy)
    }

    pub fn is_protected(&self, field: GameField) -> bool {
        self.protected_fields.contains(&field)
    }
}

impl Default for ConflictResolutionConfig {
    fn default() -> Self {
        Self {
            default_strategy: ResolutionStrategy::Newest,
            strategy_by_type: HashMap::from([
                (ConflictType::Metadata, ResolutionStrategy::PreferRemote),
                (ConflictType::UsageStat, ResolutionStrategy::PreferRemote),
                (ConflictType::ResourceAddition, ResolutionStrategy::PreferRemote),
                (ConflictType::CustomTag, ResolutionStrategy::PreferLocal),
                (ConflictType::CustomNote, ResolutionStrategy::PreferLocal),
                (ConflictType::CustomRating, ResolutionStrategy::PreferLocal),
                (ConflictType::ResourceDeletion, ResolutionStrategy::Manual),
            ]),
            auto_resolve: true,
            backup_before_resolve: true,
            max_conflict_age_days: 30,
            protected_fields: vec![
                GameField::CustomTags,
                GameField::CustomNotes,
                GameField::CustomRating,
            ],
        }
    }
}

/// What a strategy decided for one conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    KeepLocal,
    TakeRemote,
    Set(ConflictValue),
}

/// Compares local and remote snapshots over every tracked field.
///
/// Metadata and custom fields only diverge when the remote side actually
/// reports a value: details are fetched best-effort, and a missing value
/// means "unknown", not "cleared". Usage stats always come with the listing,
/// so any difference counts.
pub fn detect_conflicts(
    local: Option<&GameRecord>,
    remote: Option<&GameRecord>,
    detected_at: OffsetDateTime,
) -> Vec<ConflictInfo> {
    match (local, remote) {
        (None, None) => Vec::new(),
        (Some(local), None) => vec![ConflictInfo::pending(
            &local.owner_id,
            local.app_id,
            ConflictType::ResourceDeletion,
            None,
            ConflictValue::Record(Some(Box::new(local.clone()))),
            ConflictValue::Record(None),
            (Some(local.updated_at), None),
            detected_at,
        )],
        (None, Some(remote)) => vec![ConflictInfo::pending(
            &remote.owner_id,
            remote.app_id,
            ConflictType::ResourceAddition,
            None,
            ConflictValue::Record(None),
            ConflictValue::Record(Some(Box::new(remote.clone()))),
            (None, Some(remote.updated_at)),
            detected_at,
        )],
        (Some(local), Some(remote)) => GameField::TRACKED
            .iter()
            .filter_map(|field| {
                let local_value = field.read(local);
                let remote_value = field.read(remote);
                if local_value == remote_value {
                    return None;
                }
                let conflict_type = field.conflict_type();
                if conflict_type != ConflictType::UsageStat && remote_value.is_unset() {
                    return None;
                }
                Some(ConflictInfo::pending(
                    &local.owner_id,
                    local.app_id,
                    conflict_type,
                    Some(*field),
                    local_value,
                    remote_value,
                    (Some(local.updated_at), Some(remote.updated_at)),
                    detected_at,
                ))
            })
            .collect(),
    }
}

/// Applies `strategy` to a conflict. Returns `None` for `manual`, which is
/// never applied automatically.
pub fn decide(
    conflict: &ConflictInfo,
    strategy: ResolutionStrategy,
    config: &ConflictResolutionConfig,
) -> Option<Resolution> {
    let resolution = match strategy {
        ResolutionStrategy::Manual => return None,
        ResolutionStrategy::PreferLocal => Resolution::KeepLocal,
        ResolutionStrategy::PreferRemote => Resolution::TakeRemote,
        ResolutionStrategy::Newest => newest(conflict),
        ResolutionStrategy::Merge => match (&conflict.local_value, &conflict.remote_value) {
            (ConflictValue::Number(local), ConflictValue::Number(remote))
                if conflict.conflict_type == ConflictType::UsageStat =>
            {
                let merged = (*local).max(*remote);
                if merged == *local {
                    Resolution::KeepLocal
                } else {
                    Resolution::Set(ConflictValue::Number(merged))
                }
            }
            _ => newest(conflict),
        },
    };
    let protected = conflict.field.is_some_and(|field| config.is_protected(field));
    if protected && resolution != Resolution::KeepLocal {
        return Some(Resolution::KeepLocal);
    }
    Some(resolution)
}

fn newest(conflict: &ConflictInfo) -> Resolution {
    match (conflict.local_timestamp, conflict.remote_timestamp) {
        (Some(local), Some(remote)) if remote > local => Resolution::TakeRemote,
        (None, Some(_)) => Resolution::TakeRemote,
        _ => Resolution::KeepLocal,
    }
}
