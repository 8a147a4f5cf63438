use std::io;

use thiserror::Error;
use tourdesk_core::config::ConfigError;
use tourdesk_core::sheets::SheetsError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] tourdesk_core::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Sheets(#[from] SheetsError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Task ID must be a UUID: {0}")]
    InvalidTaskId(String),
    #[error("Sync task not found: {0}")]
    TaskNotFound(String),
    #[error(
        "Spreadsheet write-back is not configured. Set GOOGLE_SHEET_ID, GOOGLE_SERVICE_ACCOUNT_EMAIL and GOOGLE_PRIVATE_KEY."
    )]
    SheetsNotConfigured,
}
