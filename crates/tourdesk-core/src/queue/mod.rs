//! Durable write-back queue.
//!
//! ```text
//! PENDING --dequeue--> PROCESSING --success--> COMPLETED
//!                      PROCESSING --failure, retries remain--> PENDING
//!                      PROCESSING --failure, exhausted--> FAILED
//!                      PROCESSING --stuck past threshold--> PENDING
//! FAILED --retry_failed--> PENDING (retry_count reset)
//! ```
//!
//! The `sync_queue` table is the only coordination point between concurrent
//! orchestrator runs: `dequeue` claims rows with a single `UPDATE .. RETURNING`
//! so two callers never receive the same task.

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT and counters

use crate::error::{Error, Result};
use crate::models::{EntityKind, NewSyncTask, QueueStats, SyncStatus, SyncTask, TaskId};
use crate::util::{now_millis, sanitize};
use libsql::{params, Connection, Row};

const TASK_COLUMNS: &str = "seq, id, action, entity_type, record_id, sheet_row_index, payload, \
     status, retry_count, max_retries, last_error, created_at, claimed_at, processed_at";

/// Default age (minutes) after which a PROCESSING claim is considered abandoned
pub const DEFAULT_STUCK_MINUTES: u32 = 10;
/// Default retention (days) for COMPLETED tasks
pub const DEFAULT_RETENTION_DAYS: u32 = 7;

const MINUTE_MS: i64 = 60 * 1000;
const DAY_MS: i64 = 24 * 60 * MINUTE_MS;

/// Queue of pending spreadsheet writes backed by the ledger database
#[derive(Clone)]
pub struct WriteBackQueue {
    conn: Connection,
}

impl WriteBackQueue {
    pub const fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Insert a PENDING task. Never fails; errors are logged and `None` returned.
    pub async fn enqueue(&self, task: NewSyncTask) -> Option<TaskId> {
        let entity_type = task.entity_type;
        let record_id = task.record_id.clone();
        match self.try_enqueue(task).await {
            Ok(id) => Some(id),
            Err(error) => {
                tracing::error!(
                    entity_type = entity_type.as_str(),
                    record_id = record_id.as_str(),
                    error = %sanitize(&error),
                    "Failed to enqueue sync task"
                );
                None
            }
        }
    }

    /// Insert a PENDING task, surfacing storage errors
    pub async fn try_enqueue(&self, task: NewSyncTask) -> Result<TaskId> {
        let id = TaskId::new();
        let payload = serde_json::to_string(&task.payload)?;

        self.conn
            .execute(
                "INSERT INTO sync_queue (id, action, entity_type, record_id, sheet_row_index, payload, status, retry_count, max_retries, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, 'PENDING', 0, ?, ?)",
                params![
                    id.as_str(),
                    task.action.as_str(),
                    task.entity_type.as_str(),
                    task.record_id.as_str(),
                    task.sheet_row_index,
                    payload,
                    i64::from(task.max_retries),
                    now_millis()
                ],
            )
            .await?;

        tracing::debug!(
            task_id = %id,
            action = task.action.as_str(),
            entity_type = task.entity_type.as_str(),
            record_id = task.record_id.as_str(),
            "Enqueued sync task"
        );
        Ok(id)
    }

    /// Claim up to `batch_size` of the oldest PENDING tasks.
    ///
    /// Storage errors are logged and yield an empty batch.
    pub async fn dequeue(&self, batch_size: usize) -> Vec<SyncTask> {
        match self.try_dequeue(batch_size).await {
            Ok(tasks) => tasks,
            Err(error) => {
                tracing::error!(error = %sanitize(&error), "Failed to dequeue sync tasks");
                Vec::new()
            }
        }
    }

    /// Atomically claim up to `batch_size` PENDING tasks in FIFO order
    pub async fn try_dequeue(&self, batch_size: usize) -> Result<Vec<SyncTask>> {
        self.try_dequeue_excluding(batch_size, &[]).await
    }

    /// Like `try_dequeue`, passing over the tasks in `exclude`.
    ///
    /// A run uses this to leave tasks it already attempted for the next run
    /// while still reaching newer work queued behind them.
    pub async fn try_dequeue_excluding(
        &self,
        batch_size: usize,
        exclude: &[TaskId],
    ) -> Result<Vec<SyncTask>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let excluded: Vec<String> = exclude.iter().map(TaskId::as_str).collect();
        let sql = format!(
            "UPDATE sync_queue
             SET status = 'PROCESSING', claimed_at = ?1
             WHERE status = 'PENDING'
               AND id IN (
                   SELECT id FROM sync_queue
                   WHERE status = 'PENDING'
                     AND id NOT IN (SELECT value FROM json_each(?3))
                   ORDER BY seq ASC
                   LIMIT ?2
               )
             RETURNING {TASK_COLUMNS}"
        );
        let mut rows = self
            .conn
            .query(
                &sql,
                params![
                    now_millis(),
                    batch_size as i64,
                    serde_json::to_string(&excluded)?
                ],
            )
            .await?;

        let mut claimed = Vec::new();
        while let Some(row) = rows.next().await? {
            claimed.push(parse_task(&row)?);
        }
        // RETURNING order is unspecified
        claimed.sort_by_key(|(seq, _)| *seq);

        Ok(claimed.into_iter().map(|(_, task)| task).collect())
    }

    /// Mark a task COMPLETED. Idempotent; completing twice is a no-op.
    pub async fn mark_complete(&self, id: &TaskId) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE sync_queue
                 SET status = 'COMPLETED', processed_at = ?, claimed_at = NULL, last_error = NULL
                 WHERE id = ? AND status IN ('PROCESSING', 'PENDING')",
                params![now_millis(), id.as_str()],
            )
            .await?;

        if rows == 0 && self.get(id).await?.is_none() {
            return Err(Error::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Record a failed attempt on a PROCESSING task.
    ///
    /// Increments `retry_count`; the task returns to PENDING while retries
    /// remain and becomes FAILED once `retry_count + 1 >= max_retries`.
    /// Returns the new status, or `None` if the task was not being processed.
    pub async fn mark_failed(&self, id: &TaskId, error: &str) -> Result<Option<SyncStatus>> {
        let mut rows = self
            .conn
            .query(
                "UPDATE sync_queue
                 SET status = CASE WHEN retry_count + 1 >= max_retries THEN 'FAILED' ELSE 'PENDING' END,
                     retry_count = retry_count + 1,
                     last_error = ?1,
                     processed_at = ?2,
                     claimed_at = NULL
                 WHERE id = ?3 AND status = 'PROCESSING'
                 RETURNING status, retry_count",
                params![error, now_millis(), id.as_str()],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            tracing::warn!(task_id = %id, "mark_failed on a task that is not PROCESSING");
            return Ok(None);
        };
        let status: String = row.get(0)?;
        let status: SyncStatus = status.parse().map_err(Error::Database)?;
        let retry_count: i64 = row.get(1)?;

        tracing::info!(
            task_id = %id,
            status = status.as_str(),
            retry_count,
            "Sync task attempt failed"
        );
        Ok(Some(status))
    }

    /// Park a PROCESSING task as FAILED regardless of remaining retries
    pub async fn mark_failed_permanently(&self, id: &TaskId, error: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE sync_queue
                 SET status = 'FAILED', retry_count = retry_count + 1, last_error = ?,
                     processed_at = ?, claimed_at = NULL
                 WHERE id = ? AND status = 'PROCESSING'",
                params![error, now_millis(), id.as_str()],
            )
            .await?;
        Ok(rows > 0)
    }

    /// Remember the spreadsheet row a task's record was written to
    pub async fn set_row_index(&self, id: &TaskId, row: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE sync_queue SET sheet_row_index = ? WHERE id = ?",
                params![row, id.as_str()],
            )
            .await?;
        Ok(rows > 0)
    }

    /// Latest spreadsheet row recorded on any task for the record
    pub async fn known_row_index(&self, kind: EntityKind, record_id: &str) -> Result<Option<i64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT sheet_row_index FROM sync_queue
                 WHERE entity_type = ? AND record_id = ? AND sheet_row_index IS NOT NULL
                 ORDER BY seq DESC
                 LIMIT 1",
                params![kind.as_str(), record_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<i64>(0)?)),
            None => Ok(None),
        }
    }

    /// Return claimed tasks to PENDING without consuming a retry
    pub async fn release(&self, ids: &[TaskId]) -> Result<u64> {
        let mut released = 0;
        for id in ids {
            released += self
                .conn
                .execute(
                    "UPDATE sync_queue SET status = 'PENDING', claimed_at = NULL
                     WHERE id = ? AND status = 'PROCESSING'",
                    params![id.as_str()],
                )
                .await?;
        }
        Ok(released)
    }

    /// Reset PROCESSING tasks claimed more than `threshold_minutes` ago
    pub async fn reset_stuck(&self, threshold_minutes: u32) -> Result<u64> {
        let cutoff = now_millis() - i64::from(threshold_minutes) * MINUTE_MS;
        let rows = self
            .conn
            .execute(
                "UPDATE sync_queue SET status = 'PENDING', claimed_at = NULL
                 WHERE status = 'PROCESSING' AND COALESCE(claimed_at, created_at) < ?",
                params![cutoff],
            )
            .await?;

        if rows > 0 {
            tracing::warn!(count = rows, threshold_minutes, "Reset stuck sync tasks");
        }
        Ok(rows)
    }

    /// Delete COMPLETED tasks older than `retention_days`. FAILED tasks are kept.
    pub async fn cleanup_completed(&self, retention_days: u32) -> Result<u64> {
        let cutoff = now_millis() - i64::from(retention_days) * DAY_MS;
        let rows = self
            .conn
            .execute(
                "DELETE FROM sync_queue
                 WHERE status = 'COMPLETED' AND COALESCE(processed_at, created_at) < ?",
                params![cutoff],
            )
            .await?;

        tracing::info!(count = rows, retention_days, "Cleaned up completed sync tasks");
        Ok(rows)
    }

    /// Task counts per status
    pub async fn stats(&self) -> Result<QueueStats> {
        let mut rows = self
            .conn
            .query(
                "SELECT status, COUNT(*) FROM sync_queue GROUP BY status",
                (),
            )
            .await?;

        let mut stats = QueueStats::default();
        while let Some(row) = rows.next().await? {
            let status: String = row.get(0)?;
            let count = u64::try_from(row.get::<i64>(1)?).unwrap_or_default();
            match status.parse::<SyncStatus>().map_err(Error::Database)? {
                SyncStatus::Pending => stats.pending = count,
                SyncStatus::Processing => stats.processing = count,
                SyncStatus::Completed => stats.completed = count,
                SyncStatus::Failed => stats.failed = count,
            }
            stats.total += count;
        }
        Ok(stats)
    }

    /// Move one FAILED task back to PENDING with a fresh retry budget
    pub async fn retry_failed(&self, id: &TaskId) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE sync_queue
                 SET status = 'PENDING', retry_count = 0, last_error = NULL, claimed_at = NULL
                 WHERE id = ? AND status = 'FAILED'",
                params![id.as_str()],
            )
            .await?;
        Ok(rows > 0)
    }

    /// Move every FAILED task back to PENDING
    pub async fn retry_all_failed(&self) -> Result<u64> {
        let rows = self
            .conn
            .execute(
                "UPDATE sync_queue
                 SET status = 'PENDING', retry_count = 0, last_error = NULL, claimed_at = NULL
                 WHERE status = 'FAILED'",
                (),
            )
            .await?;

        tracing::info!(count = rows, "Requeued failed sync tasks");
        Ok(rows)
    }

    pub async fn get(&self, id: &TaskId) -> Result<Option<SyncTask>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM sync_queue WHERE id = ?");
        let mut rows = self.conn.query(&sql, params![id.as_str()]).await?;

        match rows.next().await? {
            Some(row) => Ok(Some(parse_task(&row)?.1)),
            None => Ok(None),
        }
    }

    /// Most recently failed tasks, newest first
    pub async fn recent_failed(&self, limit: usize) -> Result<Vec<SyncTask>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM sync_queue
             WHERE status = 'FAILED'
             ORDER BY processed_at DESC, seq DESC
             LIMIT ?"
        );
        let mut rows = self.conn.query(&sql, params![limit as i64]).await?;

        let mut tasks = Vec::new();
        while let Some(row) = rows.next().await? {
            tasks.push(parse_task(&row)?.1);
        }
        Ok(tasks)
    }

    /// Timestamp of the latest COMPLETED task (Unix ms)
    pub async fn last_processed_at(&self) -> Result<Option<i64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT MAX(processed_at) FROM sync_queue WHERE status = 'COMPLETED'",
                (),
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(row.get::<Option<i64>>(0)?),
            None => Ok(None),
        }
    }
}

/// Parse a `(seq, task)` pair from a row selected with `TASK_COLUMNS`
fn parse_task(row: &Row) -> Result<(i64, SyncTask)> {
    let id: String = row.get(1)?;
    let action: String = row.get(2)?;
    let entity_type: String = row.get(3)?;
    let payload: String = row.get(6)?;
    let status: String = row.get(7)?;

    let task = SyncTask {
        id: id
            .parse()
            .map_err(|e: uuid::Error| Error::Database(e.to_string()))?,
        action: action.parse().map_err(Error::Database)?,
        entity_type: entity_type.parse().map_err(Error::Database)?,
        record_id: row.get(4)?,
        sheet_row_index: row.get(5)?,
        payload: serde_json::from_str(&payload)?,
        status: status.parse().map_err(Error::Database)?,
        retry_count: to_u32(row.get(8)?)?,
        max_retries: to_u32(row.get(9)?)?,
        last_error: row.get(10)?,
        created_at: row.get(11)?,
        claimed_at: row.get(12)?,
        processed_at: row.get(13)?,
    };
    Ok((row.get(0)?, task))
}

fn to_u32(value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|e| Error::Database(format!("counter out of range: {e}")))
}
