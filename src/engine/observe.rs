//! Failure observation.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::store::Database;

/// Receives one call per send or reply-check failure.
#[async_trait]
pub trait FailureSink: Send + Sync {
    async fn record_failure(&self, message_id: Uuid, reason: &str);
}

/// Emits each failure as a structured `warn` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingFailureSink;

#[async_trait]
impl FailureSink for TracingFailureSink {
    async fn record_failure(&self, message_id: Uuid, reason: &str) {
        warn!(message_id = %message_id, reason, "Message failure");
    }
}

/// Appends failures to the store's failure log and traces them.
///
/// A failure repeating the message's latest logged reason is traced but not
/// appended again, so a reply check failing on every poll leaves one row.
pub struct StoreFailureSink {
    store: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
}

impl StoreFailureSink {
    pub fn new(store: Arc<dyn Database>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl FailureSink for StoreFailureSink {
    async fn record_failure(&self, message_id: Uuid, reason: &str) {
        warn!(message_id = %message_id, reason, "Message failure");
        match self.store.latest_failure(message_id).await {
            Ok(Some(latest)) if latest.reason == reason => {
                debug!(message_id = %message_id, "Failure repeats the latest record");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!(message_id = %message_id, "Failed to read failure log: {e}");
            }
        }
        if let Err(e) = self
            .store
            .record_failure_log(message_id, reason, self.clock.now())
            .await
        {
            error!(message_id = %message_id, "Failed to persist failure record: {e}");
        }
    }
}
