//! Account registry: the narrow mailbox capability the engine depends on.
//!
//! The dispatcher and reconciler only ever see [`AccountRegistry`]; which
//! provider sits behind it (SMTP/IMAP today) is invisible to them.

pub mod imap;
pub mod registry;
pub mod smtp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::MailboxError;

pub use registry::SmtpImapRegistry;

/// Provider identifiers returned by a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentReceipt {
    pub provider_message_id: String,
    /// Identifies the thread replies will attach to.
    pub provider_thread_id: String,
}

/// What the mailbox shows of a detected reply. Every field is best effort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplySummary {
    /// Sender as `Name <address>` or a bare address.
    pub from: Option<String>,
    pub subject: Option<String>,
    /// The reply's own `Date` header.
    pub received_at: Option<DateTime<Utc>>,
    /// Leading plain-text body.
    pub body: Option<String>,
}

/// Send and reply-detection capability for registered accounts.
#[async_trait]
pub trait AccountRegistry: Send + Sync {
    /// Send a message from `account_id`'s mailbox.
    async fn send(
        &self,
        account_id: Uuid,
        recipients: &[String],
        subject: &str,
        body: &str,
    ) -> Result<SentReceipt, MailboxError>;

    /// Whether `thread_id` holds a message authored by someone other than
    /// the account, received at or after `since`.
    async fn has_external_reply(
        &self,
        account_id: Uuid,
        thread_id: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, MailboxError>;

    /// Like [`has_external_reply`](Self::has_external_reply), but returns
    /// what is known about the reply. Registries that cannot read message
    /// contents keep the default, which reports an empty summary.
    async fn find_external_reply(
        &self,
        account_id: Uuid,
        thread_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<ReplySummary>, MailboxError> {
        let replied = self.has_external_reply(account_id, thread_id, since).await?;
        Ok(replied.then(ReplySummary::default))
    }
}
