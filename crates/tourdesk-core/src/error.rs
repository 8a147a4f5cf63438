//! Error types for tourdesk-core

use thiserror::Error;

use crate::lock::LockError;
use crate::models::EntityKind;
use crate::sheets::SheetsError;

/// Result type alias using tourdesk-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tourdesk-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("{0} not found: {1}")]
    NotFound(EntityKind, String),

    /// Sync task not found
    #[error("Sync task not found: {0}")]
    TaskNotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Edit attempted on a record with an active lock tier
    #[error("{kind} {id} is locked and cannot be edited")]
    Locked { kind: EntityKind, id: String },

    /// Lock or unlock request rejected by the tier rules
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Identifier generation kept colliding
    #[error("Could not generate a unique {kind} id for prefix `{prefix}` after {attempts} attempts")]
    IdExhausted {
        kind: EntityKind,
        prefix: String,
        attempts: u32,
    },

    /// Spreadsheet API error
    #[error(transparent)]
    Sheets(#[from] SheetsError),
}
