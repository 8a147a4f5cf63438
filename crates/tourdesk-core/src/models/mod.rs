//! Data models for tourdesk

mod entity;
mod lock_state;
mod sync_log;
mod sync_task;

pub use entity::{EntityKind, EntityRecord, Fields};
pub use lock_state::{LockState, LockTier, TierLock};
pub use sync_log::{LockHistoryEntry, NewSyncLog, SyncLogEntry, SyncOutcome};
pub use sync_task::{
    NewSyncTask, QueueStats, SyncAction, SyncStatus, SyncTask, TaskId, DEFAULT_MAX_RETRIES,
};
