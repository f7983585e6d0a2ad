//! Dispatcher: sends due `pending` messages.
//!
//! Each pass lists due rows, then for each one:
//! 1. claims it (`pending → sending`, bumps `attempts`)
//! 2. sends it through the account registry under the call timeout
//! 3. records the outcome (`sending → sent` or `sending → failed`)
//!
//! A failed send is never retried here. A send that timed out may still
//! have been accepted by the provider, so only an explicit reschedule
//! revives a `failed` message.
//!
//! Recording the outcome is retried a few times. If a successful send still
//! cannot be recorded, its provider ids are kept as a send receipt and the
//! row is completed by the next pass (or by startup recovery). If a failed
//! send cannot be recorded, the row stays `sending` and startup recovery
//! fails it and reports it once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::call_with_timeout;
use super::observe::FailureSink;
use super::runner::PeriodicPass;
use crate::accounts::{AccountRegistry, SentReceipt};
use crate::clock::Clock;
use crate::error::DatabaseError;
use crate::store::{Database, MessageState, ScheduledMessage, StateFields};

/// Attempts at writing a send outcome before giving up.
const OUTCOME_WRITE_ATTEMPTS: u32 = 3;

/// Delay before the first rewrite; doubles each attempt.
const OUTCOME_WRITE_BACKOFF: Duration = Duration::from_millis(50);

/// What happened to one due message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    Failed,
    /// Another dispatcher claimed the row first. Not an error.
    ClaimConflict,
    /// The store failed; the row is left for the next pass or for recovery.
    StoreError,
}

/// Counters for one dispatcher pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// `sending` rows completed from receipts kept by earlier passes.
    pub receipts_applied: usize,
    pub due: usize,
    pub sent: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub store_errors: usize,
    /// The pass stopped early because shutdown was requested.
    pub interrupted: bool,
}

pub struct Dispatcher {
    store: Arc<dyn Database>,
    registry: Arc<dyn AccountRegistry>,
    failures: Arc<dyn FailureSink>,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Database>,
        registry: Arc<dyn AccountRegistry>,
        failures: Arc<dyn FailureSink>,
        clock: Arc<dyn Clock>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            failures,
            clock,
            call_timeout,
        }
    }

    /// Run one pass over every message due at the clock's current time.
    pub async fn run_pass(&self, shutdown: &AtomicBool) -> DispatchReport {
        let mut report = DispatchReport::default();

        match self.store.apply_send_receipts().await {
            Ok(completed) => report.receipts_applied = completed.len(),
            Err(e) => {
                error!("Failed to apply kept send receipts: {e}");
                report.store_errors += 1;
            }
        }

        let now = self.clock.now();
        let mut due = match self.store.list_pending_due(now).await {
            Ok(rows) => rows,
            Err(e) => {
                error!("Failed to list due messages: {e}");
                report.store_errors += 1;
                return report;
            }
        };
        // Due-ness and order are re-checked against this pass's `now`.
        due.retain(|m| m.state == MessageState::Pending && m.scheduled_at <= now);
        due.sort_by_key(|m| m.scheduled_at);
        report.due = due.len();

        for (idx, message) in due.iter().enumerate() {
            if shutdown.load(Ordering::Relaxed) {
                info!(remaining = report.due - idx, "Dispatch pass interrupted by shutdown");
                report.interrupted = true;
                break;
            }
            match self.dispatch_one(message).await {
                DispatchOutcome::Sent => report.sent += 1,
                DispatchOutcome::Failed => report.failed += 1,
                DispatchOutcome::ClaimConflict => report.conflicts += 1,
                DispatchOutcome::StoreError => report.store_errors += 1,
            }
        }

        report
    }

    /// Claim, send and record a single message.
    pub async fn dispatch_one(&self, message: &ScheduledMessage) -> DispatchOutcome {
        let claim = StateFields {
            count_attempt: true,
            ..Default::default()
        };
        match self
            .store
            .update_state(message.id, MessageState::Pending, MessageState::Sending, &claim)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(message_id = %message.id, "Message already claimed");
                return DispatchOutcome::ClaimConflict;
            }
            Err(e) => {
                error!(message_id = %message.id, "Failed to claim message: {e}");
                return DispatchOutcome::StoreError;
            }
        }

        let result = call_with_timeout(
            self.call_timeout,
            self.registry.send(
                message.account_id,
                &message.recipients,
                &message.subject,
                &message.body,
            ),
        )
        .await;

        match result {
            Ok(receipt) => self.record_sent(message, receipt).await,
            Err(e) => {
                warn!(
                    message_id = %message.id,
                    account_id = %message.account_id,
                    kind = e.kind(),
                    "Send failed"
                );
                self.record_failed(message, format!("{}: {e}", e.kind())).await
            }
        }
    }

    async fn record_sent(&self, message: &ScheduledMessage, receipt: SentReceipt) -> DispatchOutcome {
        let sent_at = self.clock.now();
        let fields = StateFields {
            sent_at: Some(sent_at),
            provider_thread_id: Some(receipt.provider_thread_id.clone()),
            provider_message_id: Some(receipt.provider_message_id.clone()),
            ..Default::default()
        };
        match self.write_outcome(message, MessageState::Sent, &fields).await {
            Ok(true) => {
                info!(
                    message_id = %message.id,
                    account_id = %message.account_id,
                    recipients = message.recipients.len(),
                    "Message sent"
                );
                DispatchOutcome::Sent
            }
            Ok(false) => {
                warn!(message_id = %message.id, "Message sent but its row changed during the send");
                DispatchOutcome::Sent
            }
            Err(e) => {
                error!(
                    message_id = %message.id,
                    provider_message_id = %receipt.provider_message_id,
                    provider_thread_id = %receipt.provider_thread_id,
                    "Message sent but recording it failed: {e}"
                );
                if let Err(e) = self
                    .store
                    .record_send_receipt(
                        message.id,
                        &receipt.provider_message_id,
                        &receipt.provider_thread_id,
                        sent_at,
                    )
                    .await
                {
                    error!(message_id = %message.id, "Failed to keep send receipt: {e}");
                }
                DispatchOutcome::StoreError
            }
        }
    }

    async fn record_failed(&self, message: &ScheduledMessage, reason: String) -> DispatchOutcome {
        let fields = StateFields {
            last_error: Some(reason.clone()),
            ..Default::default()
        };
        match self.write_outcome(message, MessageState::Failed, &fields).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(message_id = %message.id, "Send failed and its row changed during the send");
            }
            Err(e) => {
                // Left in `sending`; startup recovery fails and reports it.
                error!(message_id = %message.id, reason = %reason, "Failed to record send failure: {e}");
                return DispatchOutcome::StoreError;
            }
        }
        self.failures.record_failure(message.id, &reason).await;
        DispatchOutcome::Failed
    }

    /// Write `sending → next`, retrying store errors with backoff.
    async fn write_outcome(
        &self,
        message: &ScheduledMessage,
        next: MessageState,
        fields: &StateFields,
    ) -> Result<bool, DatabaseError> {
        let mut attempt = 1;
        loop {
            match self
                .store
                .update_state(message.id, MessageState::Sending, next, fields)
                .await
            {
                Err(e) if attempt < OUTCOME_WRITE_ATTEMPTS => {
                    warn!(message_id = %message.id, state = %next, attempt, "Outcome write failed, retrying: {e}");
                    tokio::time::sleep(OUTCOME_WRITE_BACKOFF * 2u32.pow(attempt - 1)).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl PeriodicPass for Dispatcher {
    fn name(&self) -> &'static str {
        "dispatcher"
    }

    async fn run_once(&self, shutdown: &AtomicBool) {
        let report = self.run_pass(shutdown).await;
        if report.due > 0 || report.receipts_applied > 0 {
            info!(
                due = report.due,
                receipts_applied = report.receipts_applied,
                sent = report.sent,
                failed = report.failed,
                conflicts = report.conflicts,
                "Dispatch pass complete"
            );
        }
    }
}
