use std::path::{Path, PathBuf};

use tourdesk_core::config::EngineConfig;
use tourdesk_core::db::Database;
use tourdesk_core::models::{SyncLogEntry, SyncTask};
use tourdesk_core::sync::SyncStatusReport;

use crate::error::CliError;

pub fn resolve_db_path(cli_db_path: Option<PathBuf>, config: &EngineConfig) -> PathBuf {
    cli_db_path.unwrap_or_else(|| PathBuf::from(&config.database_path))
}

pub async fn open_database(path: &Path) -> Result<Database, CliError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    tracing::debug!(path = %path.display(), "Opening ledger database");
    Ok(Database::open(path).await?)
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}

pub fn format_status_lines(report: &SyncStatusReport, now_ms: i64) -> Vec<String> {
    let stats = &report.stats;
    let mut lines = vec![format!(
        "Queue: {} pending, {} processing, {} completed, {} failed ({} total)",
        stats.pending, stats.processing, stats.completed, stats.failed, stats.total
    )];
    lines.push(report.last_processed.map_or_else(
        || "Last processed: never".to_string(),
        |at| {
            format!(
                "Last processed: {} ({})",
                format_sync_timestamp(at),
                format_relative_time(at, now_ms)
            )
        },
    ));

    if !report.recent_failed.is_empty() {
        lines.push(String::new());
        lines.push("Failed tasks:".to_string());
        lines.extend(report.recent_failed.iter().map(format_failed_task));
    }
    if !report.recent_logs.is_empty() {
        lines.push(String::new());
        lines.push("Recent attempts:".to_string());
        lines.extend(report.recent_logs.iter().map(format_log_entry));
    }
    lines
}

fn format_failed_task(task: &SyncTask) -> String {
    format!(
        "  {}  {:<8} {:<6} {}  retries={}/{}  {}",
        task.id,
        task.entity_type.as_str(),
        task.action.as_str(),
        task.record_id,
        task.retry_count,
        task.max_retries,
        task.last_error.as_deref().unwrap_or("-")
    )
}

fn format_log_entry(entry: &SyncLogEntry) -> String {
    let row = entry
        .row_index
        .map_or_else(|| "-".to_string(), |row| row.to_string());
    let mut line = format!(
        "  {}  {:<7} {:<8} {:<6} {}  row={}",
        format_sync_timestamp(entry.timestamp),
        entry.status.as_str(),
        entry.entity_type.as_str(),
        entry.action.as_str(),
        entry.record_id,
        row
    );
    if let Some(error) = entry.error_message.as_deref() {
        line.push_str("  ");
        line.push_str(error);
    }
    line
}
