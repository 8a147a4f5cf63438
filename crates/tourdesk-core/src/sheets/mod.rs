//! Spreadsheet write-back: layouts, API client, rate limiting and retries.

mod client;
mod layout;
mod rate_limit;
mod retry;
mod writer;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::models::EntityKind;
use crate::util::compact_text;

pub use client::{normalize_private_key, parse_row_index, GoogleSheetsClient};
pub use layout::{column_letter, layout_for, Column, SheetLayout};
pub use rate_limit::{LocalRateLimiter, RateLimitMetricsSnapshot, RateLimiter};
pub use retry::RetryPolicy;
pub use writer::SheetsWriter;

/// Spreadsheet and per-kind tab names a run writes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetTarget {
    pub spreadsheet_id: String,
    pub request_tab: String,
    pub operator_tab: String,
    pub revenue_tab: String,
}

impl SheetTarget {
    pub fn tab_for(&self, kind: EntityKind) -> &str {
        match kind {
            EntityKind::Request => &self.request_tab,
            EntityKind::Operator => &self.operator_tab,
            EntityKind::Revenue => &self.revenue_tab,
        }
    }
}

/// One row written to an explicit A1 range
#[derive(Debug, Clone, PartialEq)]
pub struct RowUpdate {
    pub range: String,
    /// One cell per column; `Null` leaves the cell untouched
    pub values: Vec<Value>,
}

/// Errors from the spreadsheet API, classified by how the caller should react
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SheetsError {
    #[error("Sheets API rate limited (HTTP {status}): {message}")]
    RateLimited { status: u16, message: String },
    #[error("Sheets API authentication failed: {0}")]
    Auth(String),
    #[error("Sheets API rejected the request (HTTP {status}): {message}")]
    Api { status: u16, message: String },
    #[error("Sheets API unreachable: {0}")]
    Transport(String),
    #[error("Invalid Sheets API response: {0}")]
    InvalidResponse(String),
    /// The append was accepted but the row it landed on is unknown
    #[error("Appended row could not be located: {0}")]
    UnconfirmedAppend(String),
    #[error("Invalid Sheets credentials: {0}")]
    Credentials(String),
}

impl SheetsError {
    /// Quota or rate rejection; retried with backoff
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Worth another attempt on a later run (rate limits, server errors).
    ///
    /// Never true for an unconfirmed append.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::InvalidResponse(_) => true,
            Self::Api { status, .. } => *status >= 500,
            Self::Auth(_)
            | Self::Transport(_)
            | Self::Credentials(_)
            | Self::UnconfirmedAppend(_) => false,
        }
    }

    /// The API could not be reached at all
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Classify a non-success HTTP response
    pub fn from_response(status: u16, body: &str) -> Self {
        let message = api_error_message(body);
        if status == 429 || (status == 403 && mentions_rate_limit(body)) {
            return Self::RateLimited { status, message };
        }
        match status {
            401 | 403 => Self::Auth(format!("{message} (HTTP {status})")),
            _ => Self::Api { status, message },
        }
    }
}

fn mentions_rate_limit(body: &str) -> bool {
    ["rateLimitExceeded", "RATE_LIMIT_EXCEEDED", "Quota exceeded"]
        .iter()
        .any(|marker| body.contains(marker))
}

#[derive(Debug, Deserialize)]
struct GoogleErrorBody {
    error: GoogleErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorDetail {
    message: Option<String>,
    status: Option<String>,
}

fn api_error_message(body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<GoogleErrorBody>(body) {
        if let Some(message) = payload.error.message.or(payload.error.status) {
            return compact_text(&message);
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        "empty response body".to_string()
    } else {
        trimmed
    }
}

/// Raw spreadsheet API surface; one HTTP call per method
#[async_trait]
pub trait SheetsApi: Send + Sync {
    /// Overwrite the given ranges in a single `values:batchUpdate`
    async fn batch_update(&self, spreadsheet_id: &str, rows: &[RowUpdate])
        -> Result<(), SheetsError>;

    /// Append one row after the table in `range`, returning its 1-based row index
    async fn append(
        &self,
        spreadsheet_id: &str,
        range: &str,
        values: &[Value],
    ) -> Result<i64, SheetsError>;
}
