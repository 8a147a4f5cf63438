use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use clap::Parser;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tourdesk_core::config::{EngineConfig, SheetsConfig};
use tourdesk_core::db::{Database, EntityRepository, LibSqlEntityRepository};
use tourdesk_core::models::{
    EntityKind, Fields, NewSyncTask, QueueStats, SyncAction, SyncLogEntry, SyncOutcome,
    SyncStatus,
};
use tourdesk_core::queue::WriteBackQueue;
use tourdesk_core::sheets::{RowUpdate, SheetsApi, SheetsError};
use tourdesk_core::sync::{SyncStatusReport, SyncSummary};
use tourdesk_core::TaskId;

use crate::cli::{Cli, Commands, SyncCommands};
use crate::commands::common::{
    format_relative_time, format_status_lines, format_sync_timestamp, resolve_db_path,
};
use crate::commands::sync::{load_status, retry_failed, sync_once};
use crate::error::CliError;

#[derive(Default)]
struct FakeSheets {
    ranges: Mutex<Vec<String>>,
}

#[async_trait]
impl SheetsApi for FakeSheets {
    async fn batch_update(
        &self,
        _spreadsheet_id: &str,
        updates: &[RowUpdate],
    ) -> Result<(), SheetsError> {
        let mut ranges = self.ranges.lock().unwrap();
        ranges.extend(updates.iter().map(|update| update.range.clone()));
        Ok(())
    }

    async fn append(
        &self,
        _spreadsheet_id: &str,
        range: &str,
        _values: &[Value],
    ) -> Result<i64, SheetsError> {
        self.ranges.lock().unwrap().push(range.to_string());
        Ok(5)
    }
}

fn sheets_config() -> SheetsConfig {
    let config = EngineConfig::from_lookup(|name| match name {
        "GOOGLE_SHEET_ID" => Some("sheet-1".to_string()),
        "GOOGLE_SERVICE_ACCOUNT_EMAIL" => Some("bot@example.iam.gserviceaccount.com".to_string()),
        "GOOGLE_PRIVATE_KEY" => Some("unused".to_string()),
        _ => None,
    })
    .unwrap();
    config.sheets.unwrap()
}

fn fields(value: Value) -> Fields {
    value.as_object().cloned().unwrap()
}

async fn seed_failed_task(db: &Database, record_id: &str) -> TaskId {
    let queue = WriteBackQueue::new(db.connection().clone());
    let id = queue
        .enqueue(NewSyncTask::new(
            SyncAction::Update,
            EntityKind::Operator,
            record_id,
            fields(json!({ "cost": 1_200_000 })),
        ))
        .await
        .unwrap();
    queue.dequeue(10).await;
    queue
        .mark_failed_permanently(&id, "Unable to parse range")
        .await
        .unwrap();
    id
}

#[test]
fn format_relative_time_units() {
    let now = 10_000_000;
    assert_eq!(format_relative_time(now - 30_000, now), "just now");
    assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
    assert_eq!(format_relative_time(now - 2 * 60 * 60_000, now), "2h ago");
    assert_eq!(format_relative_time(now - 3 * 24 * 60 * 60_000, now + 1), "3d ago");
}

#[test]
fn format_sync_timestamp_returns_utc_label() {
    assert_eq!(format_sync_timestamp(0), "1970-01-01 00:00:00 UTC");
}

#[test]
fn resolve_db_path_prefers_cli_flag() {
    let config = EngineConfig::from_lookup(|_| None).unwrap();
    assert_eq!(resolve_db_path(None, &config), PathBuf::from("tourdesk.db"));
    assert_eq!(
        resolve_db_path(Some(PathBuf::from("/tmp/other.db")), &config),
        PathBuf::from("/tmp/other.db")
    );
}

#[test]
fn status_lines_list_failures_and_attempts() {
    let report = SyncStatusReport {
        stats: QueueStats {
            pending: 2,
            processing: 0,
            completed: 10,
            failed: 1,
            total: 13,
        },
        recent_failed: Vec::new(),
        recent_logs: vec![SyncLogEntry {
            id: 1,
            entity_type: EntityKind::Revenue,
            action: SyncAction::Create,
            record_id: "REV20261018093000123".to_string(),
            row_index: None,
            status: SyncOutcome::Failed,
            error_message: Some("quota exhausted".to_string()),
            timestamp: 0,
        }],
        last_processed: None,
    };

    let lines = format_status_lines(&report, 0);
    assert_eq!(
        lines[0],
        "Queue: 2 pending, 0 processing, 10 completed, 1 failed (13 total)"
    );
    assert_eq!(lines[1], "Last processed: never");
    assert!(lines.iter().any(|line| line == "Recent attempts:"));
    let attempt = lines.last().unwrap();
    assert!(attempt.contains("REV20261018093000123"));
    assert!(attempt.contains("row=-"));
    assert!(attempt.ends_with("quota exhausted"));
    assert!(!lines.iter().any(|line| line == "Failed tasks:"));
}

#[test]
fn cli_parses_sync_subcommands_and_bounds() {
    let cli = Cli::try_parse_from(["tourdesk", "sync", "reset-stuck", "--minutes", "15"]).unwrap();
    assert!(matches!(
        cli.command,
        Commands::Sync {
            command: SyncCommands::ResetStuck { minutes: Some(15) }
        }
    ));

    let cli = Cli::try_parse_from(["tourdesk", "--db-path", "x.db", "sync", "status", "--json"])
        .unwrap();
    assert_eq!(cli.db_path, Some(PathBuf::from("x.db")));

    assert!(Cli::try_parse_from(["tourdesk", "sync", "cleanup", "--days", "0"]).is_err());
}

#[cfg_attr(windows, ignore = "libsql integration is flaky on windows CI")]
#[tokio::test(flavor = "multi_thread")]
async fn sync_once_writes_pending_tasks() {
    let db_path = unique_test_db_path();
    let db = Database::open(&db_path).await.unwrap();
    let repo = LibSqlEntityRepository::new(db.connection().clone());
    let payload = fields(json!({ "customer_name": "Tran Thi B", "pax": 4 }));
    repo.create(EntityKind::Request, "SALE0120261018093000123", payload.clone())
        .await
        .unwrap();
    WriteBackQueue::new(db.connection().clone())
        .enqueue(NewSyncTask::new(
            SyncAction::Create,
            EntityKind::Request,
            "SALE0120261018093000123",
            payload,
        ))
        .await
        .unwrap();

    let sheets = Arc::new(FakeSheets::default());
    let summary = sync_once(
        &db,
        sheets.clone(),
        &sheets_config(),
        &EngineConfig::from_lookup(|_| None).unwrap().sync,
    )
    .await
    .unwrap();

    assert_eq!(
        summary,
        SyncSummary {
            processed: 1,
            succeeded: 1,
            failed: 0,
        }
    );
    assert_eq!(
        sheets.ranges.lock().unwrap().as_slice(),
        ["'Request'!A:P".to_string()]
    );
    let record = repo
        .get(EntityKind::Request, "SALE0120261018093000123")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.sheet_row_index, Some(5));

    cleanup_db_files(&db_path);
}

#[cfg_attr(windows, ignore = "libsql integration is flaky on windows CI")]
#[tokio::test(flavor = "multi_thread")]
async fn retry_failed_handles_single_all_and_bad_ids() {
    let db_path = unique_test_db_path();
    let db = Database::open(&db_path).await.unwrap();
    let first = seed_failed_task(&db, "OP1").await;
    seed_failed_task(&db, "OP2").await;

    assert!(matches!(
        retry_failed(&db, Some("nope")).await,
        Err(CliError::InvalidTaskId(_))
    ));
    assert!(matches!(
        retry_failed(&db, Some(&TaskId::new().to_string())).await,
        Err(CliError::TaskNotFound(_))
    ));

    assert_eq!(retry_failed(&db, Some(&first.to_string())).await.unwrap(), 1);
    // Already pending again, so a second targeted retry is a no-op
    assert_eq!(retry_failed(&db, Some(&first.to_string())).await.unwrap(), 0);
    assert_eq!(retry_failed(&db, Some("  ")).await.unwrap(), 1);

    let task = WriteBackQueue::new(db.connection().clone())
        .get(&first)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, SyncStatus::Pending);
    assert_eq!(task.retry_count, 0);

    cleanup_db_files(&db_path);
}

#[cfg_attr(windows, ignore = "libsql integration is flaky on windows CI")]
#[tokio::test(flavor = "multi_thread")]
async fn status_includes_failure_details() {
    let db_path = unique_test_db_path();
    let db = Database::open(&db_path).await.unwrap();
    seed_failed_task(&db, "OP1").await;

    let report = load_status(&db).await.unwrap();
    assert_eq!(report.stats.failed, 1);
    assert_eq!(report.recent_failed.len(), 1);
    assert_eq!(
        report.recent_failed[0].last_error.as_deref(),
        Some("Unable to parse range")
    );

    cleanup_db_files(&db_path);
}

fn unique_test_db_path() -> PathBuf {
    static NEXT_TEST_DB_ID: AtomicU64 = AtomicU64::new(0);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    let sequence = NEXT_TEST_DB_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("tourdesk-cli-test-{timestamp}-{sequence}.db"))
}

fn cleanup_db_files(path: &PathBuf) {
    // On Windows, libsql can keep file handles alive briefly after drop.
    if cfg!(windows) {
        return;
    }

    let _ = std::fs::remove_file(path);
    let _ = std::fs::remove_file(path.with_extension("db-shm"));
    let _ = std::fs::remove_file(path.with_extension("db-wal"));
}
