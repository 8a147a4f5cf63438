use std::path::Path;
use std::sync::Arc;

use tourdesk_core::config::{EngineConfig, SheetsConfig, SyncSettings};
use tourdesk_core::db::{Database, SyncLogRepository};
use tourdesk_core::queue::WriteBackQueue;
use tourdesk_core::sheets::{GoogleSheetsClient, LocalRateLimiter, SheetsApi, SheetsWriter};
use tourdesk_core::sync::{status_report, SyncOrchestrator, SyncStatusReport, SyncSummary};
use tourdesk_core::util::now_millis;
use tourdesk_core::TaskId;

use crate::commands::common::{format_status_lines, open_database};
use crate::error::CliError;

pub async fn run_sync(
    config: &EngineConfig,
    db_path: &Path,
    as_json: bool,
) -> Result<(), CliError> {
    let sheets = config
        .sheets
        .as_ref()
        .ok_or(CliError::SheetsNotConfigured)?;
    let api = Arc::new(GoogleSheetsClient::new(sheets.clone())?);
    let db = open_database(db_path).await?;

    let summary = sync_once(&db, api, sheets, &config.sync).await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "Sync finished: {} processed, {} succeeded, {} failed",
            summary.processed, summary.succeeded, summary.failed
        );
    }
    Ok(())
}

/// One orchestrator run against `api`
pub async fn sync_once(
    db: &Database,
    api: Arc<dyn SheetsApi>,
    sheets: &SheetsConfig,
    settings: &SyncSettings,
) -> Result<SyncSummary, CliError> {
    let limiter = Arc::new(LocalRateLimiter::per_minute(settings.rate_limit_per_minute));
    let writer = SheetsWriter::new(api, limiter, settings);
    let orchestrator =
        SyncOrchestrator::new(db.connection(), writer, sheets.target(), settings.clone());
    Ok(orchestrator.run().await?)
}

pub async fn run_status(db_path: &Path, as_json: bool) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let report = load_status(&db).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    for line in format_status_lines(&report, now_millis()) {
        println!("{line}");
    }
    Ok(())
}

pub async fn load_status(db: &Database) -> Result<SyncStatusReport, CliError> {
    let queue = WriteBackQueue::new(db.connection().clone());
    let logs = SyncLogRepository::new(db.connection().clone());
    Ok(status_report(&queue, &logs, true).await?)
}

pub async fn run_retry_failed(db_path: &Path, id: Option<&str>) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let retried = retry_failed(&db, id).await?;
    println!("Requeued {retried} failed task(s)");
    Ok(())
}

pub async fn retry_failed(db: &Database, id: Option<&str>) -> Result<u64, CliError> {
    let queue = WriteBackQueue::new(db.connection().clone());
    let Some(raw) = id.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(queue.retry_all_failed().await?);
    };

    let task_id = raw
        .parse::<TaskId>()
        .map_err(|_| CliError::InvalidTaskId(raw.to_string()))?;
    if queue.get(&task_id).await?.is_none() {
        return Err(CliError::TaskNotFound(raw.to_string()));
    }
    Ok(u64::from(queue.retry_failed(&task_id).await?))
}

pub async fn run_reset_stuck(db_path: &Path, minutes: u32) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let queue = WriteBackQueue::new(db.connection().clone());
    let reset = queue.reset_stuck(minutes).await?;
    println!("Returned {reset} stuck task(s) to PENDING (claimed more than {minutes}m ago)");
    Ok(())
}

pub async fn run_cleanup(db_path: &Path, days: u32) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let queue = WriteBackQueue::new(db.connection().clone());
    let deleted = queue.cleanup_completed(days).await?;
    println!("Deleted {deleted} completed task(s) older than {days}d");
    Ok(())
}
