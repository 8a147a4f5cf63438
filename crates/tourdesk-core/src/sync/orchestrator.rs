//! Drains the write-back queue into the spreadsheet.
//!
//! Each claimed batch is planned in FIFO order. Tasks whose record has no
//! known row are appended one at a time; rows that are already known are
//! collected and written with a single chunked `update_rows` call once the
//! batch's appends are done.

use std::collections::VecDeque;

use libsql::Connection;
use serde_json::Value;
use tokio::time::Instant;

use super::SyncSummary;
use crate::config::SyncSettings;
use crate::db::{EntityRepository, LibSqlEntityRepository, SyncLogRepository};
use crate::error::Result;
use crate::models::{NewSyncLog, SyncAction, SyncOutcome, SyncTask, TaskId};
use crate::queue::WriteBackQueue;
use crate::sheets::{layout_for, RowUpdate, SheetTarget, SheetsError, SheetsWriter};
use crate::util::sanitize;

/// What a claimed task needs
enum Plan {
    Skip(&'static str),
    Append { range: String, values: Vec<Value> },
    Update(RowUpdate, i64),
}

/// An UPDATE waiting for the batch's combined write
struct PendingUpdate {
    task: SyncTask,
    row: i64,
    update: RowUpdate,
}

/// What happened to one written task
enum TaskOutcome {
    Done,
    Failed,
    /// The API is unreachable; the run must stop
    Abort(SheetsError),
}

/// How a batch ended
enum BatchEnd {
    Drained,
    OutOfBudget,
}

pub struct SyncOrchestrator {
    queue: WriteBackQueue,
    entities: LibSqlEntityRepository,
    logs: SyncLogRepository,
    writer: SheetsWriter,
    target: SheetTarget,
    settings: SyncSettings,
}

impl SyncOrchestrator {
    pub fn new(
        conn: &Connection,
        writer: SheetsWriter,
        target: SheetTarget,
        settings: SyncSettings,
    ) -> Self {
        Self {
            queue: WriteBackQueue::new(conn.clone()),
            entities: LibSqlEntityRepository::new(conn.clone()),
            logs: SyncLogRepository::new(conn.clone()),
            writer,
            target,
            settings,
        }
    }

    /// Process PENDING tasks until the queue is empty or the time budget runs out.
    ///
    /// Stuck claims are recovered first. A task is attempted at most once per
    /// run; one that fails and returns to PENDING waits for the next run while
    /// newer work is still claimed. An unreachable API aborts the run after
    /// returning the rest of the claimed batch to PENDING; tasks already
    /// completed stay completed.
    pub async fn run(&self) -> Result<SyncSummary> {
        let deadline = Instant::now() + self.settings.time_budget;
        self.queue
            .reset_stuck(self.settings.stuck_threshold_minutes)
            .await?;

        let mut summary = SyncSummary::default();
        let mut attempted: Vec<TaskId> = Vec::new();
        loop {
            if Instant::now() >= deadline {
                tracing::info!("Sync time budget exhausted, leaving remaining tasks pending");
                break;
            }

            let batch = self
                .queue
                .try_dequeue_excluding(self.settings.batch_size, &attempted)
                .await?;
            if batch.is_empty() {
                break;
            }
            attempted.extend(batch.iter().map(|task| task.id));

            if let BatchEnd::OutOfBudget = self.run_batch(batch, deadline, &mut summary).await? {
                tracing::info!(?summary, "Sync run ended early");
                return Ok(summary);
            }
        }

        tracing::info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Sync run finished"
        );
        Ok(summary)
    }

    async fn run_batch(
        &self,
        batch: Vec<SyncTask>,
        deadline: Instant,
        summary: &mut SyncSummary,
    ) -> Result<BatchEnd> {
        let mut remaining: VecDeque<SyncTask> = batch.into();
        let mut updates: Vec<PendingUpdate> = Vec::new();

        while let Some(task) = remaining.pop_front() {
            let plan = match self.plan(&task).await {
                Ok(plan) => plan,
                Err(error) => {
                    // Local storage failure; the task is retried on a later run
                    summary.processed += 1;
                    summary.failed += 1;
                    self.fail(&task, &sanitize(&error), true, None).await;
                    continue;
                }
            };

            match plan {
                Plan::Skip(reason) => {
                    summary.processed += 1;
                    summary.succeeded += 1;
                    self.complete(&task, task.sheet_row_index, SyncOutcome::Skipped, Some(reason))
                        .await;
                }
                Plan::Update(update, row) => updates.push(PendingUpdate { task, row, update }),
                Plan::Append { range, values } => {
                    if !self.wait_for_budget(deadline).await {
                        remaining.push_front(task);
                        self.release(remaining.iter().chain(updates.iter().map(|u| &u.task)))
                            .await?;
                        return Ok(BatchEnd::OutOfBudget);
                    }

                    summary.processed += 1;
                    match self.append(&task, &range, &values).await {
                        TaskOutcome::Done => summary.succeeded += 1,
                        TaskOutcome::Failed => summary.failed += 1,
                        TaskOutcome::Abort(error) => {
                            summary.failed += 1;
                            self.release(remaining.iter().chain(updates.iter().map(|u| &u.task)))
                                .await?;
                            return Err(self.abort(summary, error));
                        }
                    }
                }
            }
        }

        if updates.is_empty() {
            return Ok(BatchEnd::Drained);
        }
        if !self.wait_for_budget(deadline).await {
            self.release(updates.iter().map(|u| &u.task)).await?;
            return Ok(BatchEnd::OutOfBudget);
        }
        self.write_updates(&updates, summary).await?;
        Ok(BatchEnd::Drained)
    }

    /// Write every collected row in one chunked call and settle each task from its result
    async fn write_updates(
        &self,
        updates: &[PendingUpdate],
        summary: &mut SyncSummary,
    ) -> Result<()> {
        let rows: Vec<RowUpdate> = updates.iter().map(|u| u.update.clone()).collect();
        let count = u64::try_from(updates.len()).unwrap_or(u64::MAX);
        summary.processed += count;

        match self
            .writer
            .update_rows(&self.target.spreadsheet_id, &rows)
            .await
        {
            Ok(()) => {
                for pending in updates {
                    match self.record_row(&pending.task, pending.row).await {
                        TaskOutcome::Done => summary.succeeded += 1,
                        TaskOutcome::Failed | TaskOutcome::Abort(_) => summary.failed += 1,
                    }
                }
                Ok(())
            }
            Err(error) => {
                summary.failed += count;
                for pending in updates {
                    self.write_failed(&pending.task, &error, Some(pending.row))
                        .await;
                }
                if error.is_transport() {
                    return Err(self.abort(summary, error));
                }
                Ok(())
            }
        }
    }

    fn abort(&self, summary: &SyncSummary, error: SheetsError) -> crate::Error {
        tracing::error!(
            ?summary,
            spreadsheet_id = self.target.spreadsheet_id.as_str(),
            error = %sanitize(&error),
            "Sheets API unreachable, aborting sync run"
        );
        error.into()
    }

    /// Wait out the local limiter if that fits in the remaining budget
    async fn wait_for_budget(&self, deadline: Instant) -> bool {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let limiter = self.writer.limiter();
        if !limiter.should_throttle().await {
            return true;
        }

        let wait = limiter.wait_time().await;
        if now + wait >= deadline {
            return false;
        }
        tracing::info!(
            wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            "Local rate limit reached, pausing"
        );
        tokio::time::sleep(wait).await;
        true
    }

    async fn release<'a>(&self, tasks: impl Iterator<Item = &'a SyncTask>) -> Result<()> {
        let ids: Vec<TaskId> = tasks.map(|task| task.id).collect();
        if ids.is_empty() {
            return Ok(());
        }
        let released = self.queue.release(&ids).await?;
        tracing::info!(released, "Returned unprocessed tasks to the queue");
        Ok(())
    }

    /// Decide how to write `task` from the record's current state.
    ///
    /// The row comes from the record, else from the task, else from any
    /// earlier task for the record that wrote a row it could not persist.
    async fn plan(&self, task: &SyncTask) -> Result<Plan> {
        if task.action == SyncAction::Delete {
            return Ok(Plan::Skip("delete is not mirrored"));
        }

        let kind = task.entity_type;
        let Some(record) = self.entities.get(kind, &task.record_id).await? else {
            return Ok(Plan::Skip("record no longer exists"));
        };

        let layout = layout_for(kind);
        let tab = self.target.tab_for(kind);
        let values = layout.row_values(&record);

        let row = match record.sheet_row_index.or(task.sheet_row_index) {
            Some(row) => Some(row),
            None => self.queue.known_row_index(kind, &record.id).await?,
        };
        Ok(match row {
            Some(row) => Plan::Update(
                RowUpdate {
                    range: layout.row_range(tab, row),
                    values,
                },
                row,
            ),
            None => Plan::Append {
                range: layout.table_range(tab),
                values,
            },
        })
    }

    async fn append(&self, task: &SyncTask, range: &str, values: &[Value]) -> TaskOutcome {
        match self
            .writer
            .append_row(&self.target.spreadsheet_id, range, values)
            .await
        {
            Ok(row) => self.record_row(task, row).await,
            Err(error) => self.write_failed(task, &error, None).await,
        }
    }

    /// Persist `row` on the record and complete the task.
    ///
    /// When the record cannot take the row, the task keeps it and is retried,
    /// so later attempts update that row instead of appending another.
    async fn record_row(&self, task: &SyncTask, row: i64) -> TaskOutcome {
        let kind = task.entity_type;
        match self
            .entities
            .set_sheet_row_index(kind, &task.record_id, row)
            .await
        {
            Ok(_) => {
                self.complete(task, Some(row), SyncOutcome::Success, None)
                    .await;
                TaskOutcome::Done
            }
            Err(error) => {
                if let Err(queue_error) = self.queue.set_row_index(&task.id, row).await {
                    tracing::error!(
                        task_id = %task.id,
                        row,
                        error = %sanitize(&queue_error),
                        "Failed to keep sheet row index on the task"
                    );
                }
                let message = format!(
                    "row {row} written but its index was not saved: {}",
                    sanitize(&error)
                );
                self.fail(task, &message, true, Some(row)).await;
                TaskOutcome::Failed
            }
        }
    }

    async fn write_failed(
        &self,
        task: &SyncTask,
        error: &SheetsError,
        row: Option<i64>,
    ) -> TaskOutcome {
        let message = sanitize(error);
        if error.is_transport() {
            self.fail(task, &message, true, row).await;
            TaskOutcome::Abort(error.clone())
        } else {
            self.fail(task, &message, error.is_transient(), row).await;
            TaskOutcome::Failed
        }
    }

    async fn complete(
        &self,
        task: &SyncTask,
        row_index: Option<i64>,
        status: SyncOutcome,
        note: Option<&str>,
    ) {
        if let Err(error) = self.queue.mark_complete(&task.id).await {
            tracing::error!(
                task_id = %task.id,
                error = %sanitize(&error),
                "Failed to complete sync task"
            );
        }
        tracing::debug!(
            task_id = %task.id,
            entity_type = task.entity_type.as_str(),
            record_id = task.record_id.as_str(),
            status = status.as_str(),
            "Sync task done"
        );
        self.audit(task, row_index, status, note.map(str::to_string))
            .await;
    }

    async fn fail(&self, task: &SyncTask, message: &str, retryable: bool, row: Option<i64>) {
        let marked = if retryable {
            self.queue.mark_failed(&task.id, message).await.map(|_| ())
        } else {
            self.queue
                .mark_failed_permanently(&task.id, message)
                .await
                .map(|_| ())
        };
        if let Err(error) = marked {
            tracing::error!(
                task_id = %task.id,
                error = %sanitize(&error),
                "Failed to record sync failure"
            );
        }

        tracing::warn!(
            task_id = %task.id,
            entity_type = task.entity_type.as_str(),
            record_id = task.record_id.as_str(),
            retryable,
            error = message,
            "Sync task failed"
        );
        let row_index = row.or(task.sheet_row_index);
        self.audit(task, row_index, SyncOutcome::Failed, Some(message.to_string()))
            .await;
    }

    async fn audit(
        &self,
        task: &SyncTask,
        row_index: Option<i64>,
        status: SyncOutcome,
        error_message: Option<String>,
    ) {
        let entry = NewSyncLog {
            entity_type: task.entity_type,
            action: task.action,
            record_id: task.record_id.clone(),
            row_index,
            status,
            error_message,
        };
        if let Err(error) = self.logs.record(entry).await {
            tracing::error!(
                task_id = %task.id,
                error = %sanitize(&error),
                "Failed to write sync log"
            );
        }
    }
}
