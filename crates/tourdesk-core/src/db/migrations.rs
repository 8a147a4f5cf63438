//! Database migrations

use crate::error::Result;
use crate::models::EntityKind;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    // Check if schema_version table exists
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Execute a migration's statements in one transaction
async fn apply(conn: &Connection, version: i32, statements: &[String]) -> Result<()> {
    // libsql doesn't have execute_batch, so we run each statement separately
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt.as_str(), ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Migration to version 1: ledger entities with embedded lock tiers
async fn migrate_v1(conn: &Connection) -> Result<()> {
    let mut statements = vec!["CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )"
    .to_string()];

    for kind in EntityKind::ALL {
        let table = kind.table();
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL DEFAULT '{{}}',
                sheet_row_index INTEGER,
                lock_kt INTEGER NOT NULL DEFAULT 0,
                lock_kt_at INTEGER,
                lock_kt_by TEXT,
                lock_admin INTEGER NOT NULL DEFAULT 0,
                lock_admin_at INTEGER,
                lock_admin_by TEXT,
                lock_final INTEGER NOT NULL DEFAULT 0,
                lock_final_at INTEGER,
                lock_final_by TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )"
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_updated ON {table}(updated_at DESC)"
        ));
    }

    statements.push(
        "CREATE TABLE IF NOT EXISTS lock_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            record_id TEXT NOT NULL,
            tier TEXT NOT NULL,
            locked INTEGER NOT NULL,
            actor_id TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )"
        .to_string(),
    );
    statements.push(
        "CREATE INDEX IF NOT EXISTS idx_lock_history_record ON lock_history(entity_type, record_id)"
            .to_string(),
    );
    statements.push("INSERT INTO schema_version (version) VALUES (1)".to_string());

    apply(conn, 1, &statements).await
}

/// Migration to version 2: write-back queue and sync audit log
async fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        // `seq` gives FIFO order independent of clock resolution
        "CREATE TABLE IF NOT EXISTS sync_queue (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            action TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            record_id TEXT NOT NULL,
            sheet_row_index INTEGER,
            payload TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'PENDING',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            claimed_at INTEGER,
            processed_at INTEGER
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_status_seq ON sync_queue(status, seq)",
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_record ON sync_queue(entity_type, record_id)",
        "CREATE TABLE IF NOT EXISTS sync_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            action TEXT NOT NULL,
            record_id TEXT NOT NULL,
            row_index INTEGER,
            status TEXT NOT NULL,
            error_message TEXT,
            created_at INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_logs_created ON sync_logs(created_at DESC)",
        "INSERT INTO schema_version (version) VALUES (2)",
    ]
    .map(str::to_string);

    apply(conn, CURRENT_VERSION, &statements).await
}
