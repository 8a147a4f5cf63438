//! Change capture: turns committed entity writes into write-back tasks.
//!
//! Rules:
//! - CREATE of an unlocked record enqueues its full external-facing snapshot.
//! - UPDATE enqueues only changed scalar fields, and nothing at all when the
//!   record was locked before the update.
//! - DELETE never enqueues; the spreadsheet row is left in place.

mod worker;

pub use worker::{CaptureHandle, CaptureWorker};

use serde_json::Value;

use crate::config::SyncSettings;
use crate::error::Result;
use crate::models::{
    EntityKind, EntityRecord, Fields, NewSyncTask, SyncAction, TaskId, DEFAULT_MAX_RETRIES,
};
use crate::queue::WriteBackQueue;
use crate::util::sanitize;

/// Keys that never leave the ledger
const DENIED_KEYS: &[&str] = &[
    "id",
    "created_at",
    "updated_at",
    "createdAt",
    "updatedAt",
    "sheet_row_index",
    "sheetRowIndex",
    "connect",
    "disconnect",
    "set",
];

/// Post-commit notification published by `EntityService`
#[derive(Debug, Clone, PartialEq)]
pub enum EntityEvent {
    Created { after: EntityRecord },
    Updated { before: EntityRecord, after: EntityRecord },
    Deleted { before: EntityRecord },
}

impl EntityEvent {
    pub const fn action(&self) -> SyncAction {
        match self {
            Self::Created { .. } => SyncAction::Create,
            Self::Updated { .. } => SyncAction::Update,
            Self::Deleted { .. } => SyncAction::Delete,
        }
    }

    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Created { after } | Self::Updated { after, .. } => after.kind,
            Self::Deleted { before } => before.kind,
        }
    }

    pub fn record_id(&self) -> &str {
        match self {
            Self::Created { after } | Self::Updated { after, .. } => &after.id,
            Self::Deleted { before } => &before.id,
        }
    }
}

/// Scalar business fields safe to mirror externally
pub fn external_fields(fields: &Fields) -> Fields {
    fields
        .iter()
        .filter(|(key, value)| {
            !DENIED_KEYS.contains(&key.as_str())
                && !matches!(value, Value::Object(_) | Value::Array(_))
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// External-facing fields of `after` whose value differs from `before`
pub fn changed_fields(before: &Fields, after: &Fields) -> Fields {
    external_fields(after)
        .into_iter()
        .filter(|(key, value)| before.get(key) != Some(value))
        .collect()
}

/// Decide which task, if any, a write produces
pub fn plan(event: &EntityEvent, max_retries: u32) -> Option<NewSyncTask> {
    match event {
        EntityEvent::Created { after } => {
            if after.is_locked() {
                return None;
            }
            Some(
                NewSyncTask::new(
                    SyncAction::Create,
                    after.kind,
                    after.id.clone(),
                    external_fields(&after.fields),
                )
                .with_max_retries(max_retries),
            )
        }
        EntityEvent::Updated { before, after } => {
            // The pre-update lock state decides
            if before.is_locked() {
                return None;
            }
            let diff = changed_fields(&before.fields, &after.fields);
            if diff.is_empty() {
                return None;
            }
            Some(
                NewSyncTask::new(SyncAction::Update, after.kind, after.id.clone(), diff)
                    .with_row_index(after.sheet_row_index)
                    .with_max_retries(max_retries),
            )
        }
        EntityEvent::Deleted { .. } => None,
    }
}

/// Applies `plan` and enqueues the result
#[derive(Clone)]
pub struct ChangeCapture {
    queue: WriteBackQueue,
    max_retries: u32,
}

impl ChangeCapture {
    pub const fn new(queue: WriteBackQueue) -> Self {
        Self {
            queue,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Tasks get the retry limit from `settings`
    pub const fn from_settings(queue: WriteBackQueue, settings: &SyncSettings) -> Self {
        Self {
            queue,
            max_retries: settings.max_retries,
        }
    }

    /// Enqueue the task for `event`, surfacing storage errors
    pub async fn capture(&self, event: &EntityEvent) -> Result<Option<TaskId>> {
        let Some(task) = plan(event, self.max_retries) else {
            tracing::trace!(
                action = event.action().as_str(),
                entity_type = event.kind().as_str(),
                record_id = event.record_id(),
                "Write produces no sync task"
            );
            return Ok(None);
        };
        self.queue.try_enqueue(task).await.map(Some)
    }

    /// Enqueue the task for `event`. Failures are logged and never propagated.
    pub async fn on_entity_written(&self, event: &EntityEvent) -> Option<TaskId> {
        match self.capture(event).await {
            Ok(id) => id,
            Err(error) => {
                tracing::error!(
                    action = event.action().as_str(),
                    entity_type = event.kind().as_str(),
                    record_id = event.record_id(),
                    error = %sanitize(&error),
                    "Change capture failed to enqueue"
                );
                None
            }
        }
    }
}
