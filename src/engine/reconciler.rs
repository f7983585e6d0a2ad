//! Reply reconciler: moves `sent` messages to `replied` and stores what the
//! mailbox shows of each detected reply in the inbox.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::call_with_timeout;
use super::observe::FailureSink;
use super::runner::PeriodicPass;
use crate::accounts::{AccountRegistry, ReplySummary};
use crate::clock::Clock;
use crate::store::{Database, MessageState, NewReply, ScheduledMessage, StateFields};

/// What happened to one `sent` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Replied,
    NoReply,
    /// The mailbox query failed; the row went back to `sent` untouched.
    Failed,
    ClaimConflict,
    StoreError,
}

/// Counters for one reconciler pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub candidates: usize,
    pub replied: usize,
    pub no_reply: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub store_errors: usize,
    pub interrupted: bool,
}

pub struct Reconciler {
    store: Arc<dyn Database>,
    registry: Arc<dyn AccountRegistry>,
    failures: Arc<dyn FailureSink>,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
}

impl Reconciler {
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

    /// Check every `sent` message once.
    pub async fn run_pass(&self, shutdown: &AtomicBool) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let sent = match self.store.list_sent().await {
            Ok(rows) => rows,
            Err(e) => {
                error!("Failed to list sent messages: {e}");
                report.store_errors += 1;
                return report;
            }
        };
        report.candidates = sent.len();

        for (idx, message) in sent.iter().enumerate() {
            if shutdown.load(Ordering::Relaxed) {
                info!(remaining = report.candidates - idx, "Reconcile pass interrupted by shutdown");
                report.interrupted = true;
                break;
            }
            match self.check_one(message).await {
                CheckOutcome::Replied => report.replied += 1,
                CheckOutcome::NoReply => report.no_reply += 1,
                CheckOutcome::Failed => report.failed += 1,
                CheckOutcome::ClaimConflict => report.conflicts += 1,
                CheckOutcome::StoreError => report.store_errors += 1,
            }
        }

        report
    }

    /// Claim one `sent` message, ask the registry about its thread, record
    /// the answer.
    pub async fn check_one(&self, message: &ScheduledMessage) -> CheckOutcome {
        let Some(thread_id) = message.provider_thread_id.as_deref() else {
            error!(message_id = %message.id, "Sent message has no thread id");
            return CheckOutcome::StoreError;
        };

        match self
            .store
            .update_state(
                message.id,
                MessageState::Sent,
                MessageState::Checking,
                &StateFields::default(),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(message_id = %message.id, "Message already claimed for checking");
                return CheckOutcome::ClaimConflict;
            }
            Err(e) => {
                error!(message_id = %message.id, "Failed to claim message for checking: {e}");
                return CheckOutcome::StoreError;
            }
        }

        let since = message.sent_at.unwrap_or(message.scheduled_at);
        let result = call_with_timeout(
            self.call_timeout,
            self.registry
                .find_external_reply(message.account_id, thread_id, since),
        )
        .await;

        let now = self.clock.now();
        let (next, fields, outcome) = match &result {
            Ok(Some(_)) => (
                MessageState::Replied,
                StateFields {
                    replied_at: Some(now),
                    last_checked_at: Some(now),
                    ..Default::default()
                },
                CheckOutcome::Replied,
            ),
            Ok(None) => (
                MessageState::Sent,
                StateFields {
                    last_checked_at: Some(now),
                    ..Default::default()
                },
                CheckOutcome::NoReply,
            ),
            Err(_) => (MessageState::Sent, StateFields::default(), CheckOutcome::Failed),
        };

        let recorded = self
            .store
            .update_state(message.id, MessageState::Checking, next, &fields)
            .await;

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                let reason = format!("reply check {}: {e}", e.kind());
                warn!(
                    message_id = %message.id,
                    account_id = %message.account_id,
                    kind = e.kind(),
                    "Reply check failed"
                );
                self.failures.record_failure(message.id, &reason).await;
                None
            }
        };

        match recorded {
            Ok(true) => {
                if let Some(reply) = reply {
                    info!(message_id = %message.id, account_id = %message.account_id, "Reply detected");
                    self.store_reply(message, reply, now).await;
                }
                outcome
            }
            Ok(false) => {
                warn!(message_id = %message.id, "Checked message changed during the check");
                outcome
            }
            Err(e) => {
                error!(message_id = %message.id, state = %next, "Failed to record reply check: {e}");
                CheckOutcome::StoreError
            }
        }
    }

    /// Add a detected reply to the inbox. The message is already `replied`,
    /// so a failed write only loses the summary.
    async fn store_reply(&self, message: &ScheduledMessage, reply: ReplySummary, now: DateTime<Utc>) {
        let entry = NewReply {
            message_id: message.id,
            account_id: message.account_id,
            sender: reply.from,
            subject: reply.subject,
            body: reply.body,
            received_at: reply.received_at,
        };
        if let Err(e) = self.store.record_reply(&entry, now).await {
            error!(message_id = %message.id, "Failed to store reply in inbox: {e}");
        }
    }
}

#[async_trait]
impl PeriodicPass for Reconciler {
    fn name(&self) -> &'static str {
        "reconciler"
    }

    async fn run_once(&self, shutdown: &AtomicBool) {
        let report = self.run_pass(shutdown).await;
        if report.candidates > 0 {
            debug!(
                candidates = report.candidates,
                replied = report.replied,
                failed = report.failed,
                "Reconcile pass complete"
            );
        }
    }
}
