//! Ledger entity repository implementation

use crate::error::{Error, Result};
use crate::lock::LockPatch;
use crate::models::{
    EntityKind, EntityRecord, Fields, LockHistoryEntry, LockState, LockTier, TierLock,
};
use crate::util::now_millis;
use libsql::{params, Connection, Row};

const UPDATE_ATTEMPTS: u32 = 3;

const SELECT_COLUMNS: &str = "id, data, sheet_row_index, \
     lock_kt, lock_kt_at, lock_kt_by, \
     lock_admin, lock_admin_at, lock_admin_by, \
     lock_final, lock_final_at, lock_final_by, \
     created_at, updated_at";

/// Storage operations for the three synced entity kinds (async)
#[allow(async_fn_in_trait)]
pub trait EntityRepository {
    /// Insert a new, unlocked record
    async fn create(&self, kind: EntityKind, id: &str, fields: Fields) -> Result<EntityRecord>;

    /// Get a record by ID
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>>;

    /// Merge `patch` into an unlocked record, returning the record before and after
    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        patch: &Fields,
    ) -> Result<(EntityRecord, EntityRecord)>;

    /// Delete an unlocked record, returning what was removed
    async fn delete(&self, kind: EntityKind, id: &str) -> Result<EntityRecord>;

    /// Point lookup used by the ID generator
    async fn exists(&self, kind: EntityKind, id: &str) -> Result<bool>;

    /// Record the spreadsheet row assigned by an append
    async fn set_sheet_row_index(&self, kind: EntityKind, id: &str, row: i64) -> Result<bool>;
}

/// libSQL implementation of `EntityRepository`
#[derive(Clone)]
pub struct LibSqlEntityRepository {
    conn: Connection,
}

impl LibSqlEntityRepository {
    /// Create a new repository with the given connection
    pub const fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// All IDs of `kind` that start with `prefix`
    pub async fn ids_with_prefix(&self, kind: EntityKind, prefix: &str) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT id FROM {} WHERE substr(id, 1, length(?1)) = ?1",
            kind.table()
        );
        let mut rows = self.conn.query(&sql, params![prefix]).await?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(row.get::<String>(0)?);
        }
        Ok(ids)
    }

    /// Write `before` merged with `patch`, provided the stored record is still
    /// the unlocked version `before` was read as.
    ///
    /// Returns `None` when another write got there first.
    pub async fn apply_patch(
        &self,
        before: &EntityRecord,
        patch: &Fields,
    ) -> Result<Option<EntityRecord>> {
        let mut after = before.clone();
        for (key, value) in patch {
            after.fields.insert(key.clone(), value.clone());
        }
        // Strictly increasing, so it identifies the version
        after.updated_at = now_millis().max(before.updated_at + 1);

        let sql = format!(
            "UPDATE {} SET data = ?, updated_at = ?
             WHERE id = ? AND updated_at = ?
               AND lock_kt = 0 AND lock_admin = 0 AND lock_final = 0",
            before.kind.table()
        );
        let rows = self
            .conn
            .execute(
                &sql,
                params![
                    serde_json::to_string(&after.fields)?,
                    after.updated_at,
                    before.id.as_str(),
                    before.updated_at
                ],
            )
            .await?;

        Ok((rows > 0).then_some(after))
    }

    /// Write one tier's lock columns, guarded by the lock state the caller validated.
    ///
    /// Returns `false` when the stored state no longer matches `expected`.
    pub async fn write_lock(
        &self,
        kind: EntityKind,
        id: &str,
        expected: &LockState,
        patch: &LockPatch,
    ) -> Result<bool> {
        let column = lock_column(patch.tier);
        let sql = format!(
            "UPDATE {table}
             SET {column} = ?1, {column}_at = ?2, {column}_by = ?3,
                 updated_at = MAX(updated_at + 1, ?4)
             WHERE id = ?5 AND lock_kt = ?6 AND lock_admin = ?7 AND lock_final = ?8",
            table = kind.table(),
        );

        let rows = self
            .conn
            .execute(
                &sql,
                params![
                    i64::from(patch.value.locked),
                    patch.value.locked_at,
                    patch.value.locked_by.clone(),
                    now_millis(),
                    id,
                    i64::from(expected.kt.locked),
                    i64::from(expected.admin.locked),
                    i64::from(expected.final_tier.locked)
                ],
            )
            .await?;

        Ok(rows > 0)
    }

    /// Append a lock/unlock action to the audit trail
    pub async fn record_lock_history(
        &self,
        kind: EntityKind,
        id: &str,
        patch: &LockPatch,
        actor_id: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO lock_history (entity_type, record_id, tier, locked, actor_id, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    kind.as_str(),
                    id,
                    patch.tier.as_str(),
                    i64::from(patch.is_lock()),
                    actor_id,
                    now_millis()
                ],
            )
            .await?;
        Ok(())
    }

    /// Lock audit trail for one record, oldest first
    pub async fn lock_history(&self, kind: EntityKind, id: &str) -> Result<Vec<LockHistoryEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, tier, locked, actor_id, created_at
                 FROM lock_history
                 WHERE entity_type = ? AND record_id = ?
                 ORDER BY id ASC",
                params![kind.as_str(), id],
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            let tier: String = row.get(1)?;
            entries.push(LockHistoryEntry {
                id: row.get(0)?,
                entity_type: kind,
                record_id: id.to_string(),
                tier: tier.parse().map_err(Error::Database)?,
                locked: row.get::<i64>(2)? != 0,
                actor_id: row.get(3)?,
                created_at: row.get(4)?,
            });
        }
        Ok(entries)
    }

    /// Parse a record from a database row selected with `SELECT_COLUMNS`
    fn parse_record(kind: EntityKind, row: &Row) -> Result<EntityRecord> {
        let data: String = row.get(1)?;
        let fields: Fields = serde_json::from_str(&data)?;
        Ok(EntityRecord {
            kind,
            id: row.get(0)?,
            fields,
            sheet_row_index: row.get(2)?,
            lock: LockState {
                kt: Self::parse_tier(row, 3)?,
                admin: Self::parse_tier(row, 6)?,
                final_tier: Self::parse_tier(row, 9)?,
            },
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn parse_tier(row: &Row, offset: i32) -> Result<TierLock> {
        Ok(TierLock {
            locked: row.get::<i64>(offset)? != 0,
            locked_at: row.get(offset + 1)?,
            locked_by: row.get(offset + 2)?,
        })
    }

    async fn require(&self, kind: EntityKind, id: &str) -> Result<EntityRecord> {
        self.get(kind, id)
            .await?
            .ok_or_else(|| Error::NotFound(kind, id.to_string()))
    }
}

impl EntityRepository for LibSqlEntityRepository {
    async fn create(&self, kind: EntityKind, id: &str, fields: Fields) -> Result<EntityRecord> {
        let now = now_millis();
        let data = serde_json::to_string(&fields)?;
        let sql = format!(
            "INSERT INTO {} (id, data, created_at, updated_at) VALUES (?, ?, ?, ?)",
            kind.table()
        );
        self.conn
            .execute(&sql, params![id, data, now, now])
            .await?;

        Ok(EntityRecord {
            kind,
            id: id.to_string(),
            fields,
            lock: LockState::default(),
            sheet_row_index: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM {} WHERE id = ?", kind.table());
        let mut rows = self.conn.query(&sql, params![id]).await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_record(kind, &row)?)),
            None => Ok(None),
        }
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        patch: &Fields,
    ) -> Result<(EntityRecord, EntityRecord)> {
        for attempt in 1..=UPDATE_ATTEMPTS {
            let before = self.require(kind, id).await?;
            if before.is_locked() {
                return Err(Error::Locked {
                    kind,
                    id: id.to_string(),
                });
            }

            if let Some(after) = self.apply_patch(&before, patch).await? {
                return Ok((before, after));
            }
            tracing::debug!(
                entity_type = kind.as_str(),
                record_id = id,
                attempt,
                "Record changed since it was read, retrying update"
            );
        }

        Err(Error::Database(format!("{kind} {id} kept changing during update")))
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<EntityRecord> {
        let existing = self.require(kind, id).await?;
        if existing.is_locked() {
            return Err(Error::Locked {
                kind,
                id: id.to_string(),
            });
        }

        let sql = format!(
            "DELETE FROM {} WHERE id = ? AND lock_kt = 0 AND lock_admin = 0 AND lock_final = 0",
            kind.table()
        );
        let rows = self.conn.execute(&sql, params![id]).await?;
        if rows == 0 {
            return Err(Error::Locked {
                kind,
                id: id.to_string(),
            });
        }

        Ok(existing)
    }

    async fn exists(&self, kind: EntityKind, id: &str) -> Result<bool> {
        let sql = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?)", kind.table());
        let mut rows = self.conn.query(&sql, params![id]).await?;

        Ok(match rows.next().await? {
            Some(row) => row.get::<i64>(0)? != 0,
            None => false,
        })
    }

    async fn set_sheet_row_index(&self, kind: EntityKind, id: &str, row: i64) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET sheet_row_index = ? WHERE id = ?",
            kind.table()
        );
        let rows = self.conn.execute(&sql, params![row, id]).await?;
        Ok(rows > 0)
    }
}

const fn lock_column(tier: LockTier) -> &'static str {
    match tier {
        LockTier::Kt => "lock_kt",
        LockTier::Admin => "lock_admin",
        LockTier::Final => "lock_final",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::lock;
    use serde_json::json;

    async fn setup() -> (Database, LibSqlEntityRepository) {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlEntityRepository::new(db.connection().clone());
        (db, repo)
    }

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_and_get() {
        let (_db, repo) = setup().await;

        let created = repo
            .create(
                EntityKind::Request,
                "SALE0120261018093000123",
                fields(json!({"customer_name": "Nguyen Van A", "pax": 4})),
            )
            .await
            .unwrap();
        assert!(!created.is_locked());

        let fetched = repo
            .get(EntityKind::Request, &created.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.field("pax"), Some(&json!(4)));
        assert_eq!(fetched.sheet_row_index, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_merges_patch() {
        let (_db, repo) = setup().await;
        repo.create(
            EntityKind::Operator,
            "OP1",
            fields(json!({"supplier": "Hotel A", "unit_price": 100})),
        )
        .await
        .unwrap();

        let (before, after) = repo
            .update(EntityKind::Operator, "OP1", &fields(json!({"unit_price": 120})))
            .await
            .unwrap();
        assert_eq!(before.field("unit_price"), Some(&json!(100)));
        assert_eq!(after.field("unit_price"), Some(&json!(120)));
        assert_eq!(after.field("supplier"), Some(&json!("Hotel A")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_interleaved_updates_keep_both_fields() {
        let (_db, repo) = setup().await;
        repo.create(EntityKind::Operator, "OP1", fields(json!({"x": 0, "y": 0})))
            .await
            .unwrap();

        // Second writer read the record before the first one committed
        let stale = repo.get(EntityKind::Operator, "OP1").await.unwrap().unwrap();
        let (_, first) = repo
            .update(EntityKind::Operator, "OP1", &fields(json!({"x": 1})))
            .await
            .unwrap();
        assert_eq!(
            repo.apply_patch(&stale, &fields(json!({"y": 2})))
                .await
                .unwrap(),
            None
        );

        let (before, after) = repo
            .update(EntityKind::Operator, "OP1", &fields(json!({"y": 2})))
            .await
            .unwrap();
        assert_eq!(before.field("x"), Some(&json!(1)));
        assert!(after.updated_at > first.updated_at);

        let stored = repo.get(EntityKind::Operator, "OP1").await.unwrap().unwrap();
        assert_eq!(stored.fields, fields(json!({"x": 1, "y": 2})));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_rejects_locked_record() {
        let (_db, repo) = setup().await;
        let record = repo
            .create(EntityKind::Revenue, "REV1", Fields::new())
            .await
            .unwrap();

        let patch = lock::apply(LockTier::Kt, "acct-1", true, 1);
        assert!(repo
            .write_lock(EntityKind::Revenue, "REV1", &record.lock, &patch)
            .await
            .unwrap());

        let err = repo
            .update(EntityKind::Revenue, "REV1", &fields(json!({"amount": 5})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Locked { .. }));

        let err = repo.delete(EntityKind::Revenue, "REV1").await.unwrap_err();
        assert!(matches!(err, Error::Locked { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_lock_detects_stale_state() {
        let (_db, repo) = setup().await;
        let record = repo
            .create(EntityKind::Request, "R1", Fields::new())
            .await
            .unwrap();
        let patch = lock::apply(LockTier::Kt, "admin", true, 1);

        assert!(repo
            .write_lock(EntityKind::Request, "R1", &record.lock, &patch)
            .await
            .unwrap());
        // Second writer validated against the old (unlocked) state
        assert!(!repo
            .write_lock(EntityKind::Request, "R1", &record.lock, &patch)
            .await
            .unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_exists_and_prefix_lookup() {
        let (_db, repo) = setup().await;
        for id in ["BK20261018-0001", "BK20261018-0002", "BK20261019-0001"] {
            repo.create(EntityKind::Revenue, id, Fields::new())
                .await
                .unwrap();
        }

        assert!(repo.exists(EntityKind::Revenue, "BK20261018-0001").await.unwrap());
        assert!(!repo.exists(EntityKind::Request, "BK20261018-0001").await.unwrap());

        let mut ids = repo
            .ids_with_prefix(EntityKind::Revenue, "BK20261018-")
            .await
            .unwrap();
        ids.sort();
        assert_eq!(ids, vec!["BK20261018-0001", "BK20261018-0002"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_set_sheet_row_index() {
        let (_db, repo) = setup().await;
        repo.create(EntityKind::Request, "R1", Fields::new())
            .await
            .unwrap();

        assert!(repo
            .set_sheet_row_index(EntityKind::Request, "R1", 42)
            .await
            .unwrap());
        let record = repo.get(EntityKind::Request, "R1").await.unwrap().unwrap();
        assert_eq!(record.sheet_row_index, Some(42));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_returns_removed_record() {
        let (_db, repo) = setup().await;
        repo.create(EntityKind::Operator, "OP9", Fields::new())
            .await
            .unwrap();

        let removed = repo.delete(EntityKind::Operator, "OP9").await.unwrap();
        assert_eq!(removed.id, "OP9");
        assert!(repo.get(EntityKind::Operator, "OP9").await.unwrap().is_none());
    }
}
