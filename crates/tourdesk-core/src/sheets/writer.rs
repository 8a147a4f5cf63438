//! Rate-limited, retrying front end over a `SheetsApi`

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::{RateLimiter, RetryPolicy, RowUpdate, SheetsApi, SheetsError};
use crate::config::SyncSettings;

#[derive(Clone)]
pub struct SheetsWriter {
    api: Arc<dyn SheetsApi>,
    limiter: Arc<dyn RateLimiter>,
    retry: RetryPolicy,
    chunk_size: usize,
    chunk_delay: Duration,
}

impl SheetsWriter {
    pub fn new(
        api: Arc<dyn SheetsApi>,
        limiter: Arc<dyn RateLimiter>,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            api,
            limiter,
            retry: RetryPolicy::default(),
            chunk_size: settings.chunk_size.max(1),
            chunk_delay: settings.chunk_delay,
        }
    }

    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn limiter(&self) -> &Arc<dyn RateLimiter> {
        &self.limiter
    }

    /// Write rows in chunks, pausing briefly between chunks
    pub async fn update_rows(
        &self,
        spreadsheet_id: &str,
        updates: &[RowUpdate],
    ) -> Result<(), SheetsError> {
        for (index, chunk) in updates.chunks(self.chunk_size).enumerate() {
            if index > 0 && !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }

            self.retry
                .run("batch_update", |_attempt| async move {
                    self.limiter.record_request().await;
                    self.api.batch_update(spreadsheet_id, chunk).await
                })
                .await?;

            tracing::debug!(
                chunk = index,
                rows = chunk.len(),
                "Wrote spreadsheet rows"
            );
        }
        Ok(())
    }

    /// Append one row and return its 1-based index
    pub async fn append_row(
        &self,
        spreadsheet_id: &str,
        range: &str,
        values: &[Value],
    ) -> Result<i64, SheetsError> {
        let row = self
            .retry
            .run("append", |_attempt| async move {
                self.limiter.record_request().await;
                self.api.append(spreadsheet_id, range, values).await
            })
            .await?;

        tracing::debug!(range, row, "Appended spreadsheet row");
        Ok(row)
    }
}
