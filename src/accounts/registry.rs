//! SMTP/IMAP-backed account registry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{AccountRegistry, ReplySummary, SentReceipt, imap, smtp};
use crate::error::MailboxError;
use crate::store::{Account, Database};

/// Account registry that reads credentials from the store and talks to each
/// account's own SMTP and IMAP servers.
pub struct SmtpImapRegistry {
    store: Arc<dyn Database>,
    /// Socket-level timeout handed to the blocking clients.
    io_timeout: Duration,
}

impl SmtpImapRegistry {
    pub fn new(store: Arc<dyn Database>, io_timeout: Duration) -> Self {
        Self { store, io_timeout }
    }

    /// Load the account fresh on every call so credential edits apply at once.
    async fn load_account(&self, account_id: Uuid) -> Result<Account, MailboxError> {
        match self.store.get_account(account_id).await {
            Ok(Some(account)) => Ok(account),
            Ok(None) => Err(MailboxError::auth(
                account_id.to_string(),
                "account not registered",
            )),
            Err(e) => Err(MailboxError::transient(format!(
                "failed to load account: {e}"
            ))),
        }
    }
}

#[async_trait]
impl AccountRegistry for SmtpImapRegistry {
    async fn send(
        &self,
        account_id: Uuid,
        recipients: &[String],
        subject: &str,
        body: &str,
    ) -> Result<SentReceipt, MailboxError> {
        let account = self.load_account(account_id).await?;
        let message_id = smtp::new_message_id(&account.address);
        let message = smtp::build_message(&account, recipients, subject, body, &message_id)?;

        let timeout = self.io_timeout;
        tokio::task::spawn_blocking(move || smtp::deliver(&account, &message, timeout))
            .await
            .map_err(|e| MailboxError::transient(format!("SMTP task panicked: {e}")))??;

        debug!(account_id = %account_id, message_id = %message_id, "Send accepted");
        Ok(SentReceipt {
            provider_thread_id: message_id.clone(),
            provider_message_id: message_id,
        })
    }

    async fn has_external_reply(
        &self,
        account_id: Uuid,
        thread_id: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, MailboxError> {
        Ok(self
            .find_external_reply(account_id, thread_id, since)
            .await?
            .is_some())
    }

    async fn find_external_reply(
        &self,
        account_id: Uuid,
        thread_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<ReplySummary>, MailboxError> {
        let account = self.load_account(account_id).await?;
        let thread = thread_id.to_string();
        let timeout = self.io_timeout;

        let result = tokio::task::spawn_blocking(move || {
            imap::find_external_reply(&account, &thread, since, timeout)
        })
        .await
        .map_err(|e| MailboxError::transient(format!("IMAP task panicked: {e}")))?;

        if let Err(ref e) = result {
            warn!(account_id = %account_id, error = %e, "Reply check failed");
        }
        result
    }
}
