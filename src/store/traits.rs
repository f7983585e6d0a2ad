//! `Database` trait, the single async persistence interface.
//!
//! The dispatcher and reconciler drive `list_pending_due`, `list_sent` and
//! `update_state`, plus send receipts and the inbox; everything else serves
//! account management and the user-facing scheduling operations.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::MailServers;
use crate::error::DatabaseError;

/// Lifecycle state of a scheduled message.
///
/// `Sending` and `Checking` are claim states: a row sits in them only while
/// a dispatcher or reconciler is talking to the provider about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    /// Waiting for its scheduled time.
    Pending,
    /// Claimed by a dispatcher; send in flight.
    Sending,
    /// Delivered to the provider, awaiting a reply.
    Sent,
    /// Claimed by a reconciler; mailbox query in flight.
    Checking,
    /// A reply was detected in the thread.
    Replied,
    /// Send failed. Needs an explicit reschedule.
    Failed,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Checking => "checking",
            Self::Replied => "replied",
            Self::Failed => "failed",
        }
    }

    /// States in which the provider thread id must be present.
    pub fn has_thread(&self) -> bool {
        matches!(self, Self::Sent | Self::Checking | Self::Replied)
    }

    /// No engine transition leaves these states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Replied | Self::Failed)
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageState {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "checking" => Ok(Self::Checking),
            "replied" => Ok(Self::Replied),
            "failed" => Ok(Self::Failed),
            other => Err(DatabaseError::Serialization(format!(
                "unknown message state: {other}"
            ))),
        }
    }
}

/// A registered mailbox account.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: Uuid,
    pub display_name: String,
    /// Mailbox address; unique across the registry.
    pub address: String,
    /// App password (or token) used for SMTP and IMAP login.
    pub secret: SecretString,
    pub servers: MailServers,
    pub created_at: DateTime<Utc>,
}

/// Input for registering an account.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub display_name: String,
    pub address: String,
    pub secret: SecretString,
    /// `None` uses the backend's configured default servers.
    pub servers: Option<MailServers>,
}

/// A message scheduled for future delivery.
#[derive(Debug, Clone)]
pub struct ScheduledMessage {
    pub id: Uuid,
    pub account_id: Uuid,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub scheduled_at: DateTime<Utc>,
    pub state: MessageState,
    pub provider_message_id: Option<String>,
    pub provider_thread_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub replied_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for scheduling a message.
#[derive(Debug, Clone)]
pub struct NewScheduledMessage {
    pub account_id: Uuid,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub scheduled_at: DateTime<Utc>,
}

/// Columns written alongside a state transition. `None` leaves the column
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct StateFields {
    pub provider_message_id: Option<String>,
    pub provider_thread_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub replied_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Bump the send-attempt counter.
    pub count_attempt: bool,
}

/// Per-account message counts for the accounts overview.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AccountStats {
    pub total: u64,
    pub sent: u64,
    pub replied: u64,
    pub failed: u64,
}

/// Outcome of releasing claims left behind by a crash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `checking` rows returned to `sent`.
    pub released_checks: usize,
    /// `sending` rows whose send receipt was kept, moved to `sent`.
    pub confirmed_sends: Vec<Uuid>,
    /// `sending` rows moved to `failed`; the send may or may not have happened.
    pub abandoned_sends: Vec<Uuid>,
}

/// A reply to store in the inbox.
#[derive(Debug, Clone, Default)]
pub struct NewReply {
    pub message_id: Uuid,
    pub account_id: Uuid,
    pub sender: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
}

/// An inbox entry: a detected reply linked to the message it answers.
#[derive(Debug, Clone, Serialize)]
pub struct ReplyRecord {
    pub id: i64,
    pub message_id: Uuid,
    pub account_id: Uuid,
    pub sender: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

/// A persisted failure observation.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub id: i64,
    pub message_id: Uuid,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// Backend-agnostic database trait covering accounts, scheduled messages and
/// the failure log.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Accounts ────────────────────────────────────────────────────

    /// Register an account. Fails with `Constraint` if the address is taken.
    async fn create_account(&self, account: &NewAccount) -> Result<Account, DatabaseError>;

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>, DatabaseError>;

    async fn get_account_by_address(&self, address: &str)
    -> Result<Option<Account>, DatabaseError>;

    async fn list_accounts(&self) -> Result<Vec<Account>, DatabaseError>;

    /// Delete an account together with its scheduled messages.
    async fn delete_account(&self, id: Uuid) -> Result<bool, DatabaseError>;

    async fn account_stats(&self, account_id: Uuid) -> Result<AccountStats, DatabaseError>;

    // ── Scheduled messages ──────────────────────────────────────────

    /// Create a message in state `pending`.
    async fn schedule_message(
        &self,
        message: &NewScheduledMessage,
    ) -> Result<ScheduledMessage, DatabaseError>;

    async fn get_message(&self, id: Uuid) -> Result<Option<ScheduledMessage>, DatabaseError>;

    /// Messages ordered by scheduled time, newest first.
    async fn list_messages(&self, limit: usize) -> Result<Vec<ScheduledMessage>, DatabaseError>;

    /// `pending` messages with `scheduled_at <= now`, oldest first.
    async fn list_pending_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledMessage>, DatabaseError>;

    /// All `sent` messages.
    async fn list_sent(&self) -> Result<Vec<ScheduledMessage>, DatabaseError>;

    /// Conditional transition. Returns `false` when the row is no longer in
    /// `expected` (or does not exist), in which case nothing is written.
    async fn update_state(
        &self,
        id: Uuid,
        expected: MessageState,
        new: MessageState,
        fields: &StateFields,
    ) -> Result<bool, DatabaseError>;

    /// Move a `pending` or `failed` message to `pending` at a new time.
    async fn reschedule_message(
        &self,
        id: Uuid,
        scheduled_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn delete_message(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Keep the provider ids of a send whose `sending → sent` write failed,
    /// so the row can still be completed later.
    async fn record_send_receipt(
        &self,
        message_id: Uuid,
        provider_message_id: &str,
        provider_thread_id: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Move `sending` rows with a kept receipt to `sent` and drop every
    /// receipt. Returns the completed message ids.
    async fn apply_send_receipts(&self) -> Result<Vec<Uuid>, DatabaseError>;

    /// Release claim states left behind by an interrupted process. Kept
    /// receipts are applied first.
    async fn recover_interrupted_claims(&self) -> Result<RecoveryReport, DatabaseError>;

    // ── Failure log ─────────────────────────────────────────────────

    async fn record_failure_log(
        &self,
        message_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Failures for one message, oldest first.
    async fn list_failures(&self, message_id: Uuid) -> Result<Vec<FailureRecord>, DatabaseError>;

    /// Most recent failure for one message.
    async fn latest_failure(&self, message_id: Uuid)
    -> Result<Option<FailureRecord>, DatabaseError>;

    // ── Inbox ──────────────────────────────────────────────

    async fn record_reply(
        &self,
        reply: &NewReply,
        recorded_at: DateTime<Utc>,
    ) -> Result<ReplyRecord, DatabaseError>;

    /// Recorded replies, newest first, optionally for one account.
    async fn list_replies(
        &self,
        account_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<ReplyRecord>, DatabaseError>;
}
