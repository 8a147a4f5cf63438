//! Sync audit log and lock history models

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{EntityKind, LockTier, SyncAction};

/// Result of one write-back attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncOutcome {
    Success,
    /// Nothing to write (record gone, or a DELETE task)
    Skipped,
    Failed,
}

impl SyncOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Skipped => "SKIPPED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(Self::Success),
            "SKIPPED" => Ok(Self::Skipped),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown sync outcome `{other}`")),
        }
    }
}

/// Recorded write-back attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogEntry {
    /// Log row identifier
    pub id: i64,
    pub entity_type: EntityKind,
    pub action: SyncAction,
    pub record_id: String,
    /// Spreadsheet row touched, when known
    pub row_index: Option<i64>,
    pub status: SyncOutcome,
    pub error_message: Option<String>,
    /// Attempt timestamp (Unix ms)
    pub timestamp: i64,
}

/// Input for `SyncLogRepository::record`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSyncLog {
    pub entity_type: EntityKind,
    pub action: SyncAction,
    pub record_id: String,
    pub row_index: Option<i64>,
    pub status: SyncOutcome,
    pub error_message: Option<String>,
}

/// Audit trail entry for a lock or unlock action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockHistoryEntry {
    pub id: i64,
    pub entity_type: EntityKind,
    pub record_id: String,
    pub tier: LockTier,
    /// `true` for lock, `false` for unlock
    pub locked: bool,
    pub actor_id: String,
    /// Action timestamp (Unix ms)
    pub created_at: i64,
}
