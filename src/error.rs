//! Error types for the mail scheduler.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Failures of the account registry's send / reply-check capabilities.
///
/// The variant decides what the engine does with the message, so providers
/// must classify carefully: `Auth` and `Permanent` need a human, `Transient`
/// may succeed on a later pass.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MailboxError {
    #[error("Authentication failed for account {account_id}: {reason}")]
    Auth { account_id: String, reason: String },

    #[error("Transient provider failure: {reason}")]
    Transient { reason: String },

    #[error("Provider rejected the message: {reason}")]
    Permanent { reason: String },
}

impl MailboxError {
    pub fn auth(account_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Auth {
            account_id: account_id.into(),
            reason: reason.into(),
        }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }

    /// A registry call that did not answer within the per-call budget.
    pub fn timed_out(timeout: Duration) -> Self {
        Self::Transient {
            reason: format!("provider call timed out after {timeout:?}"),
        }
    }

    /// Short label used in logs and failure records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Transient { .. } => "transient",
            Self::Permanent { .. } => "permanent",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
