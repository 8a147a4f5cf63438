//! Write-back queue items

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{EntityKind, Fields};

/// Retries allowed before a task is parked as FAILED
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A unique identifier for a sync task, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new unique task ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl SyncAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(format!("unknown sync action `{other}`")),
        }
    }
}

/// Queue state. `Processing` is never terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown sync status `{other}`")),
        }
    }
}

/// A persisted write-back task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTask {
    pub id: TaskId,
    pub action: SyncAction,
    pub entity_type: EntityKind,
    pub record_id: String,
    /// Spreadsheet row when known at enqueue time
    pub sheet_row_index: Option<i64>,
    /// Full snapshot (CREATE) or changed fields (UPDATE)
    pub payload: Fields,
    pub status: SyncStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// When the current claim was taken (Unix ms)
    pub claimed_at: Option<i64>,
    /// When the task last finished an attempt (Unix ms)
    pub processed_at: Option<i64>,
}

/// Input for `WriteBackQueue::enqueue`
#[derive(Debug, Clone, PartialEq)]
pub struct NewSyncTask {
    pub action: SyncAction,
    pub entity_type: EntityKind,
    pub record_id: String,
    pub sheet_row_index: Option<i64>,
    pub payload: Fields,
    pub max_retries: u32,
}

impl NewSyncTask {
    pub fn new(
        action: SyncAction,
        entity_type: EntityKind,
        record_id: impl Into<String>,
        payload: Fields,
    ) -> Self {
        Self {
            action,
            entity_type,
            record_id: record_id.into(),
            sheet_row_index: None,
            payload,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    #[must_use]
    pub const fn with_row_index(mut self, row_index: Option<i64>) -> Self {
        self.sheet_row_index = row_index;
        self
    }

    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Task counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            SyncStatus::Pending,
            SyncStatus::Processing,
            SyncStatus::Completed,
            SyncStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<SyncStatus>(), Ok(status));
        }
    }

    #[test]
    fn new_task_defaults_to_three_retries() {
        let task = NewSyncTask::new(SyncAction::Create, EntityKind::Request, "R1", Fields::new());
        assert_eq!(task.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(task.sheet_row_index, None);
    }

    #[test]
    fn task_serializes_in_camel_case() {
        let task = SyncTask {
            id: TaskId::new(),
            action: SyncAction::Update,
            entity_type: EntityKind::Revenue,
            record_id: "REV1".to_string(),
            sheet_row_index: Some(7),
            payload: Fields::new(),
            status: SyncStatus::Pending,
            retry_count: 0,
            max_retries: 3,
            last_error: None,
            created_at: 1,
            claimed_at: None,
            processed_at: None,
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["entityType"], "Revenue");
        assert_eq!(json["action"], "UPDATE");
        assert_eq!(json["sheetRowIndex"], 7);
    }
}
