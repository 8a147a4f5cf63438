//! Sync audit log repository implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use crate::error::{Error, Result};
use crate::models::{NewSyncLog, SyncLogEntry};
use crate::util::now_millis;
use libsql::{params, Connection};

/// One audit row per write-back attempt outcome
#[derive(Clone)]
pub struct SyncLogRepository {
    conn: Connection,
}

impl SyncLogRepository {
    /// Create a new repository with the given connection
    pub const fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub async fn record(&self, entry: NewSyncLog) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_logs (entity_type, action, record_id, row_index, status, error_message, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    entry.entity_type.as_str(),
                    entry.action.as_str(),
                    entry.record_id,
                    entry.row_index,
                    entry.status.as_str(),
                    entry.error_message,
                    now_millis()
                ],
            )
            .await?;
        Ok(())
    }

    /// Most recent entries, newest first
    pub async fn recent(&self, limit: usize) -> Result<Vec<SyncLogEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, entity_type, action, record_id, row_index, status, error_message, created_at
                 FROM sync_logs
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?",
                params![limit as i64],
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            let entity_type: String = row.get(1)?;
            let action: String = row.get(2)?;
            let status: String = row.get(5)?;
            entries.push(SyncLogEntry {
                id: row.get(0)?,
                entity_type: entity_type.parse().map_err(Error::Database)?,
                action: action.parse().map_err(Error::Database)?,
                record_id: row.get(3)?,
                row_index: row.get(4)?,
                status: status.parse().map_err(Error::Database)?,
                error_message: row.get(6)?,
                timestamp: row.get(7)?,
            });
        }
        Ok(entries)
    }
}
