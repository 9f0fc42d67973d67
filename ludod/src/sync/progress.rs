use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::repository::timestamp_now;

pub const HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    Incremental,
    Full,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Incremental => "incremental",
            SyncType::Full => "full",
        }
    }
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "incremental" => Ok(SyncType::Incremental),
            "full" => Ok(SyncType::Full),
            other => Err(format!("unknown sync type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SyncStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, SyncStatus::Pending | SyncStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn can_transition_to(&self, next: SyncStatus) -> bool {
        matches!(
            (self, next),
            (SyncStatus::Pending, SyncStatus::Running)
                | (SyncStatus::Pending, SyncStatus::Failed)
                | (SyncStatus::Running, SyncStatus::Completed)
                | (SyncStatus::Running, SyncStatus::Failed)
                | (SyncStatus::Running, SyncStatus::Cancelled)
        )
    }
}

/// Live state of one sync job, serialized flat for status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub owner_id: String,
    pub library_id: Option<i64>,
    pub sync_type: SyncType,
    pub status: SyncStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub total_items: usize,
    pub processed_items: usize,
    pub successful_items: usize,
    pub failed_items: usize,
    pub new_items: usize,
    pub updated_items: usize,
    pub error_messages: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: OffsetDateTime,
}

impl SyncProgress {
    pub fn new(owner_id: impl Into<String>, sync_type: SyncType) -> Self {
        let now = timestamp_now();
        Self {
            owner_id: owner_id.into(),
            library_id: None,
            sync_type,
            status: SyncStatus::Pending,
            started_at: now,
            finished_at: None,
            total_items: 0,
            processed_items: 0,
            successful_items: 0,
            failed_items: 0,
            new_items: 0,
            updated_items: 0,
            error_messages: Vec::new(),
            last_activity: now,
        }
    }

    pub fn percent_complete(&self) -> f64 {
        if self.total_items == 0 {
            return 0.0;
        }
        (self.processed_items as f64 / self.total_items as f64 * 100.0).min(100.0)
    }

    /// Moves to `next` if the state machine allows it. Returns whether the
    /// transition happened.
    pub fn transition(&mut self, next: SyncStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.touch();
        if next.is_terminal() {
            self.finished_at = Some(self.last_activity);
        }
        true
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error_messages.push(message.into());
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_activity = timestamp_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_complete_handles_unknown_total() {
        let mut progress = SyncProgress::new("a", SyncType::Full);
        assert_eq!(progress.percent_complete(), 0.0);

        progress.total_items = 4;
        progress.processed_items = 1;
        assert_eq!(progress.percent_complete(), 25.0);

        progress.processed_items = 9;
        assert_eq!(progress.percent_complete(), 100.0);
    }

    #[test]
    fn status_only_moves_forward() {
        let mut progress = SyncProgress::new("a", SyncType::Incremental);
        assert!(!progress.transition(SyncStatus::Completed));
        assert!(progress.transition(SyncStatus::Running));
        assert!(!progress.transition(SyncStatus::Pending));
        assert!(progress.transition(SyncStatus::Cancelled));
        assert!(!progress.transition(SyncStatus::Running));
        assert_eq!(progress.status, SyncStatus::Cancelled);
        assert!(progress.finished_at.is_some());
    }

    #[test]
    fn pending_can_fail_directly() {
        let mut progress = SyncProgress::new("a", SyncType::Full);
        assert!(progress.transition(SyncStatus::Failed));
        assert!(progress.status.is_terminal());
    }

    #[test]
    fn serializes_flat_snake_case() {
        let mut progress = SyncProgress::new("76561197960287930", SyncType::Full);
        progress.library_id = Some(3);
        let json = serde_json::to_value(&progress).unwrap();

        assert_eq!(json["owner_id"], "76561197960287930");
        assert_eq!(json["sync_type"], "full");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["library_id"], 3);
        assert!(json["started_at"].as_str().unwrap().ends_with('Z'));
        assert!(json["finished_at"].is_null());
    }
}
