//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use secrecy::SecretString;
use uuid::Uuid;

use mail_scheduler::accounts::{AccountRegistry, SentReceipt};
use mail_scheduler::config::MailServers;
use mail_scheduler::engine::FailureSink;
use mail_scheduler::error::{DatabaseError, MailboxError};
use mail_scheduler::store::{
    Account, AccountStats, Database, FailureRecord, LibSqlBackend, MessageState, NewAccount,
    NewReply, NewScheduledMessage, RecoveryReport, ReplyRecord, ScheduledMessage, StateFields,
};

/// 2024-01-01 at `h:m` UTC.
pub fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
}

pub async fn store() -> Arc<dyn Database> {
    Arc::new(LibSqlBackend::new_memory().await.unwrap())
}

pub async fn add_account(store: &Arc<dyn Database>, address: &str) -> Uuid {
    store
        .create_account(&NewAccount {
            display_name: address.to_string(),
            address: address.to_string(),
            secret: SecretString::from("app-password".to_string()),
            servers: Some(MailServers::default()),
        })
        .await
        .unwrap()
        .id
}

pub async fn schedule(
    store: &Arc<dyn Database>,
    account_id: Uuid,
    subject: &str,
    when: DateTime<Utc>,
) -> Uuid {
    store
        .schedule_message(&NewScheduledMessage {
            account_id,
            recipients: vec!["bob@example.com".to_string()],
            subject: subject.to_string(),
            body: "<p>Hello</p>".to_string(),
            scheduled_at: when,
        })
        .await
        .unwrap()
        .id
}

/// One recorded `send` call.
#[derive(Debug, Clone)]
pub struct SendCall {
    pub account_id: Uuid,
    pub subject: String,
}

/// Scripted stand-in for a mailbox provider.
///
/// Sends succeed unless a result has been queued with [`script_send`];
/// reply checks return whatever [`answer_replies`] last set.
pub struct FakeRegistry {
    sends: Mutex<Vec<SendCall>>,
    send_script: Mutex<VecDeque<Result<(), MailboxError>>>,
    reply_answer: Mutex<Result<bool, MailboxError>>,
    reply_checks: AtomicUsize,
    next_id: AtomicUsize,
    send_delay: Option<Duration>,
    /// Set after the first send completes.
    trip_after_send: Option<Arc<AtomicBool>>,
}

impl Default for FakeRegistry {
    fn default() -> Self {
        Self {
            sends: Mutex::new(Vec::new()),
            send_script: Mutex::new(VecDeque::new()),
            reply_answer: Mutex::new(Ok(false)),
            reply_checks: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
            send_delay: None,
            trip_after_send: None,
        }
    }
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = Some(delay);
        self
    }

    pub fn tripping(mut self, flag: Arc<AtomicBool>) -> Self {
        self.trip_after_send = Some(flag);
        self
    }

    pub fn script_send(&self, result: Result<(), MailboxError>) {
        self.send_script.lock().unwrap().push_back(result);
    }

    pub fn answer_replies(&self, answer: Result<bool, MailboxError>) {
        *self.reply_answer.lock().unwrap() = answer;
    }

    pub fn sends(&self) -> Vec<SendCall> {
        self.sends.lock().unwrap().clone()
    }

    pub fn send_count(&self) -> usize {
        self.sends.lock().unwrap().len()
    }

    pub fn reply_checks(&self) -> usize {
        self.reply_checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccountRegistry for FakeRegistry {
    async fn send(
        &self,
        account_id: Uuid,
        _recipients: &[String],
        subject: &str,
        _body: &str,
    ) -> Result<SentReceipt, MailboxError> {
        self.sends.lock().unwrap().push(SendCall {
            account_id,
            subject: subject.to_string(),
        });
        if let Some(delay) = self.send_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(flag) = &self.trip_after_send {
            flag.store(true, Ordering::SeqCst);
        }

        let scripted = self.send_script.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(()))?;

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("<msg-{n}@example.com>");
        Ok(SentReceipt {
            provider_message_id: id.clone(),
            provider_thread_id: id,
        })
    }

    async fn has_external_reply(
        &self,
        _account_id: Uuid,
        _thread_id: &str,
        _since: DateTime<Utc>,
    ) -> Result<bool, MailboxError> {
        self.reply_checks.fetch_add(1, Ordering::SeqCst);
        self.reply_answer.lock().unwrap().clone()
    }
}

/// Failure sink that keeps every call.
#[derive(Default)]
pub struct RecordingFailureSink {
    records: Mutex<Vec<(Uuid, String)>>,
}

impl RecordingFailureSink {
    pub fn records(&self) -> Vec<(Uuid, String)> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl FailureSink for RecordingFailureSink {
    async fn record_failure(&self, message_id: Uuid, reason: &str) {
        self.records
            .lock()
            .unwrap()
            .push((message_id, reason.to_string()));
    }
}

/// Store that fails chosen writes, delegating everything else to an
/// in-memory backend.
///
/// [`fail_outcome_writes`](Self::fail_outcome_writes) makes the next `n`
/// `sending → target` updates return a query error without touching the
/// row. Recovery runs against the inner store, as after a restart.
pub struct FlakyStore {
    inner: Arc<dyn Database>,
    failing: Mutex<HashMap<MessageState, usize>>,
    fail_receipts: AtomicBool,
}

impl FlakyStore {
    pub async fn new() -> Self {
        Self {
            inner: store().await,
            failing: Mutex::new(HashMap::new()),
            fail_receipts: AtomicBool::new(false),
        }
    }

    pub fn fail_outcome_writes(&self, target: MessageState, n: usize) {
        self.failing.lock().unwrap().insert(target, n);
    }

    pub fn fail_receipts(&self) {
        self.fail_receipts.store(true, Ordering::SeqCst);
    }

    fn take_failure(&self, expected: MessageState, new: MessageState) -> bool {
        if expected != MessageState::Sending {
            return false;
        }
        let mut failing = self.failing.lock().unwrap();
        match failing.get_mut(&new) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

fn injected() -> DatabaseError {
    DatabaseError::Query("injected: database is locked".to_string())
}

#[async_trait]
impl Database for FlakyStore {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        self.inner.init_schema().await
    }

    async fn create_account(&self, account: &NewAccount) -> Result<Account, DatabaseError> {
        self.inner.create_account(account).await
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>, DatabaseError> {
        self.inner.get_account(id).await
    }

    async fn get_account_by_address(
        &self,
        address: &str,
    ) -> Result<Option<Account>, DatabaseError> {
        self.inner.get_account_by_address(address).await
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, DatabaseError> {
        self.inner.list_accounts().await
    }

    async fn delete_account(&self, id: Uuid) -> Result<bool, DatabaseError> {
        self.inner.delete_account(id).await
    }

    async fn account_stats(&self, account_id: Uuid) -> Result<AccountStats, DatabaseError> {
        self.inner.account_stats(account_id).await
    }

    async fn schedule_message(
        &self,
        message: &NewScheduledMessage,
    ) -> Result<ScheduledMessage, DatabaseError> {
        self.inner.schedule_message(message).await
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<ScheduledMessage>, DatabaseError> {
        self.inner.get_message(id).await
    }

    async fn list_messages(&self, limit: usize) -> Result<Vec<ScheduledMessage>, DatabaseError> {
        self.inner.list_messages(limit).await
    }

    async fn list_pending_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledMessage>, DatabaseError> {
        self.inner.list_pending_due(now).await
    }

    async fn list_sent(&self) -> Result<Vec<ScheduledMessage>, DatabaseError> {
        self.inner.list_sent().await
    }

    async fn update_state(
        &self,
        id: Uuid,
        expected: MessageState,
        new: MessageState,
        fields: &StateFields,
    ) -> Result<bool, DatabaseError> {
        if self.take_failure(expected, new) {
            return Err(injected());
        }
        self.inner.update_state(id, expected, new, fields).await
    }

    async fn reschedule_message(
        &self,
        id: Uuid,
        scheduled_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        self.inner.reschedule_message(id, scheduled_at).await
    }

    async fn delete_message(&self, id: Uuid) -> Result<bool, DatabaseError> {
        self.inner.delete_message(id).await
    }

    async fn record_send_receipt(
        &self,
        message_id: Uuid,
        provider_message_id: &str,
        provider_thread_id: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        if self.fail_receipts.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.inner
            .record_send_receipt(message_id, provider_message_id, provider_thread_id, sent_at)
            .await
    }

    async fn apply_send_receipts(&self) -> Result<Vec<Uuid>, DatabaseError> {
        self.inner.apply_send_receipts().await
    }

    async fn recover_interrupted_claims(&self) -> Result<RecoveryReport, DatabaseError> {
        self.inner.recover_interrupted_claims().await
    }

    async fn record_failure_log(
        &self,
        message_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.inner.record_failure_log(message_id, reason, at).await
    }

    async fn list_failures(&self, message_id: Uuid) -> Result<Vec<FailureRecord>, DatabaseError> {
        self.inner.list_failures(message_id).await
    }

    async fn latest_failure(
        &self,
        message_id: Uuid,
    ) -> Result<Option<FailureRecord>, DatabaseError> {
        self.inner.latest_failure(message_id).await
    }

    async fn record_reply(
        &self,
        reply: &NewReply,
        recorded_at: DateTime<Utc>,
    ) -> Result<ReplyRecord, DatabaseError> {
        self.inner.record_reply(reply, recorded_at).await
    }

    async fn list_replies(
        &self,
        account_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<ReplyRecord>, DatabaseError> {
        self.inner.list_replies(account_id, limit).await
    }
}
