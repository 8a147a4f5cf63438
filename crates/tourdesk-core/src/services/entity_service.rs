//! Entity writes with ID generation, lock enforcement and change events.

use std::sync::Arc;

use chrono::{FixedOffset, Utc};
use libsql::Connection;
use tokio::task::JoinHandle;

use crate::capture::{CaptureHandle, CaptureWorker, ChangeCapture, EntityEvent};
use crate::config::EngineConfig;
use crate::db::{EntityRepository, LibSqlEntityRepository};
use crate::queue::WriteBackQueue;
use crate::error::{Error, Result};
use crate::ids::{normalize_prefix, IdGenerator, IdStyle, MAX_ATTEMPTS};
use crate::lock::{self, Role};
use crate::models::{EntityKind, EntityRecord, Fields, LockHistoryEntry, LockTier};
use crate::util::now_millis;

const LOCK_WRITE_ATTEMPTS: u32 = 3;

/// Front door for ledger mutations.
///
/// Every committed create/update/delete is published to the change capture
/// worker after the write succeeds.
#[derive(Clone)]
pub struct EntityService {
    repo: LibSqlEntityRepository,
    ids: Arc<IdGenerator<LibSqlEntityRepository>>,
    capture: CaptureHandle,
}

impl EntityService {
    pub fn new(
        repo: LibSqlEntityRepository,
        utc_offset: FixedOffset,
        capture: CaptureHandle,
    ) -> Self {
        let ids = IdGenerator::new(repo.clone(), utc_offset);
        Self {
            repo,
            ids: Arc::new(ids),
            capture,
        }
    }

    /// Wire a service to `conn` with a capture worker that stamps tasks with
    /// the configured retry limit.
    ///
    /// The worker stops once the service and every clone of it are dropped.
    pub fn start(conn: &Connection, config: &EngineConfig) -> (Self, JoinHandle<()>) {
        let queue = WriteBackQueue::new(conn.clone());
        let capture = ChangeCapture::from_settings(queue, &config.sync);
        let (handle, join) = CaptureWorker::spawn(capture);
        let service = Self::new(
            LibSqlEntityRepository::new(conn.clone()),
            config.utc_offset,
            handle,
        );
        (service, join)
    }

    pub const fn repository(&self) -> &LibSqlEntityRepository {
        &self.repo
    }

    pub async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>> {
        self.repo.get(kind, id).await
    }

    /// Create a record under a freshly generated identifier.
    ///
    /// A concurrent insert of the same identifier between generation and
    /// insert is treated like any other collision.
    pub async fn create(
        &self,
        kind: EntityKind,
        prefix: &str,
        style: IdStyle,
        fields: Fields,
    ) -> Result<EntityRecord> {
        for attempt in 1..=MAX_ATTEMPTS {
            let id = self.ids.generate(kind, prefix, style, Utc::now()).await?;
            match self.repo.create(kind, &id, fields.clone()).await {
                Ok(record) => {
                    self.publish(EntityEvent::Created {
                        after: record.clone(),
                    });
                    return Ok(record);
                }
                Err(error) if is_unique_violation(&error) => {
                    tracing::debug!(
                        entity_type = kind.as_str(),
                        id,
                        attempt,
                        "Lost identifier race"
                    );
                }
                Err(error) => return Err(error),
            }
        }

        tracing::warn!(
            entity_type = kind.as_str(),
            prefix,
            attempts = MAX_ATTEMPTS,
            "Every generated identifier was taken on insert"
        );
        Err(Error::IdExhausted {
            kind,
            prefix: normalize_prefix(prefix),
            attempts: MAX_ATTEMPTS,
        })
    }

    /// Create a record under a caller-supplied identifier
    pub async fn create_with_id(
        &self,
        kind: EntityKind,
        id: &str,
        fields: Fields,
    ) -> Result<EntityRecord> {
        let record = self.repo.create(kind, id, fields).await?;
        self.publish(EntityEvent::Created {
            after: record.clone(),
        });
        Ok(record)
    }

    /// Merge `patch` into an unlocked record
    pub async fn update(&self, kind: EntityKind, id: &str, patch: Fields) -> Result<EntityRecord> {
        let (before, after) = self.repo.update(kind, id, &patch).await?;
        self.publish(EntityEvent::Updated {
            before,
            after: after.clone(),
        });
        Ok(after)
    }

    /// Delete an unlocked record. The spreadsheet row is left in place.
    pub async fn delete(&self, kind: EntityKind, id: &str) -> Result<EntityRecord> {
        let removed = self.repo.delete(kind, id).await?;
        self.publish(EntityEvent::Deleted {
            before: removed.clone(),
        });
        Ok(removed)
    }

    /// Lock (`locking = true`) or unlock one tier after checking role and
    /// tier order, then append to the lock history.
    pub async fn set_lock(
        &self,
        kind: EntityKind,
        id: &str,
        tier: LockTier,
        role: Role,
        actor_id: &str,
        locking: bool,
    ) -> Result<EntityRecord> {
        for _ in 0..LOCK_WRITE_ATTEMPTS {
            let mut record = self
                .repo
                .get(kind, id)
                .await?
                .ok_or_else(|| Error::NotFound(kind, id.to_string()))?;

            if locking {
                lock::check_lock(role, tier, &record.lock)?;
            } else {
                lock::check_unlock(role, tier, &record.lock)?;
            }

            let patch = lock::apply(tier, actor_id, locking, now_millis());
            if self.repo.write_lock(kind, id, &record.lock, &patch).await? {
                self.repo
                    .record_lock_history(kind, id, &patch, actor_id)
                    .await?;
                patch.apply_to(&mut record.lock);

                tracing::info!(
                    entity_type = kind.as_str(),
                    record_id = id,
                    tier = tier.as_str(),
                    locked = locking,
                    role = role.as_str(),
                    "Lock state changed"
                );
                return Ok(record);
            }
            tracing::debug!(
                entity_type = kind.as_str(),
                record_id = id,
                "Lock state changed concurrently, re-checking"
            );
        }

        Err(Error::Database(format!(
            "lock state of {kind} {id} kept changing during update"
        )))
    }

    pub async fn lock_history(&self, kind: EntityKind, id: &str) -> Result<Vec<LockHistoryEntry>> {
        self.repo.lock_history(kind, id).await
    }

    fn publish(&self, event: EntityEvent) {
        self.capture.publish(event);
    }
}

fn is_unique_violation(error: &Error) -> bool {
    matches!(error, Error::LibSql(_)) && error.to_string().contains("UNIQUE constraint failed")
}
