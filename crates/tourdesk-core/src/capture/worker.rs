//! Background consumer that keeps enqueueing off the request path

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{ChangeCapture, EntityEvent};
use crate::util::sanitize;

const ENQUEUE_ATTEMPTS: u32 = 3;
const ENQUEUE_RETRY_DELAY: Duration = Duration::from_millis(100);

enum CaptureMessage {
    Event(EntityEvent),
    Flush(oneshot::Sender<()>),
}

/// Cheap, cloneable sender side of the capture worker
#[derive(Clone)]
pub struct CaptureHandle {
    tx: mpsc::UnboundedSender<CaptureMessage>,
}

impl CaptureHandle {
    /// Hand an event to the worker without waiting for the enqueue
    pub fn publish(&self, event: EntityEvent) {
        let action = event.action();
        let kind = event.kind();
        if self.tx.send(CaptureMessage::Event(event)).is_err() {
            tracing::error!(
                action = action.as_str(),
                entity_type = kind.as_str(),
                "Change capture worker is gone, dropping event"
            );
        }
    }

    /// Wait until every event published so far has been handled
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(CaptureMessage::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

pub struct CaptureWorker;

impl CaptureWorker {
    /// Spawn the worker on the current runtime. It stops once every handle is dropped.
    pub fn spawn(capture: ChangeCapture) -> (CaptureHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let join = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    CaptureMessage::Event(event) => handle_event(&capture, &event).await,
                    CaptureMessage::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            tracing::debug!("Change capture worker stopped");
        });

        (CaptureHandle { tx }, join)
    }
}

async fn handle_event(capture: &ChangeCapture, event: &EntityEvent) {
    for attempt in 1..=ENQUEUE_ATTEMPTS {
        match capture.capture(event).await {
            Ok(_) => return,
            Err(error) if attempt < ENQUEUE_ATTEMPTS => {
                tracing::warn!(
                    attempt,
                    entity_type = event.kind().as_str(),
                    record_id = event.record_id(),
                    error = %sanitize(&error),
                    "Enqueue failed, retrying"
                );
                tokio::time::sleep(ENQUEUE_RETRY_DELAY).await;
            }
            Err(error) => {
                tracing::error!(
                    action = event.action().as_str(),
                    entity_type = event.kind().as_str(),
                    record_id = event.record_id(),
                    error = %sanitize(&error),
                    "Dropping sync task after repeated enqueue failures"
                );
            }
        }
    }
}
