//! Write-back runs and their reporting.

mod orchestrator;

use serde::Serialize;

pub use orchestrator::SyncOrchestrator;

use crate::db::SyncLogRepository;
use crate::error::Result;
use crate::models::{QueueStats, SyncLogEntry, SyncTask};
use crate::queue::WriteBackQueue;

/// Rows shown in the failure and audit lists of a status report
pub const STATUS_LIST_LIMIT: usize = 20;

/// Outcome counts of one orchestrator run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Queue health plus, for administrators, recent failures and audit entries
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusReport {
    pub stats: QueueStats,
    pub recent_failed: Vec<SyncTask>,
    pub recent_logs: Vec<SyncLogEntry>,
    /// Latest completion (Unix ms)
    pub last_processed: Option<i64>,
}

/// Build a status report; detail lists stay empty unless `include_details`
pub async fn status_report(
    queue: &WriteBackQueue,
    logs: &SyncLogRepository,
    include_details: bool,
) -> Result<SyncStatusReport> {
    let stats = queue.stats().await?;
    let last_processed = queue.last_processed_at().await?;

    let (recent_failed, recent_logs) = if include_details {
        (
            queue.recent_failed(STATUS_LIST_LIMIT).await?,
            logs.recent(STATUS_LIST_LIMIT).await?,
        )
    } else {
        (Vec::new(), Vec::new())
    };

    Ok(SyncStatusReport {
        stats,
        recent_failed,
        recent_logs,
        last_processed,
    })
}
