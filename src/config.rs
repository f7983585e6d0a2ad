//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Scheduler daemon configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// How often the dispatcher scans for due messages.
    pub dispatch_interval: Duration,
    /// How often the reconciler polls mailboxes for replies.
    pub reply_poll_interval: Duration,
    /// Upper bound for a single send or mailbox query.
    pub call_timeout: Duration,
    /// Server defaults applied to accounts registered without explicit hosts.
    pub default_servers: MailServers,
    /// Directory for rolling log files. Logs go to stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

/// SMTP / IMAP endpoints of a mailbox provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailServers {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub imap_host: String,
    pub imap_port: u16,
}

impl Default for MailServers {
    fn default() -> Self {
        Self {
            smtp_host: "smtp.gmail.com".to_string(),
            smtp_port: 587,
            imap_host: "imap.gmail.com".to_string(),
            imap_port: 993,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/mail-scheduler.db"),
            dispatch_interval: Duration::from_secs(15),
            reply_poll_interval: Duration::from_secs(120), // 2 minutes
            call_timeout: Duration::from_secs(30),
            default_servers: MailServers::default(),
            log_dir: None,
        }
    }
}

impl SchedulerConfig {
    /// Build config from `MAIL_SCHEDULER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let db_path = lookup("MAIL_SCHEDULER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let dispatch_interval = secs(
            &lookup,
            "MAIL_SCHEDULER_DISPATCH_INTERVAL_SECS",
            defaults.dispatch_interval,
        )?;
        let reply_poll_interval = secs(
            &lookup,
            "MAIL_SCHEDULER_REPLY_POLL_INTERVAL_SECS",
            defaults.reply_poll_interval,
        )?;
        let call_timeout = secs(
            &lookup,
            "MAIL_SCHEDULER_CALL_TIMEOUT_SECS",
            defaults.call_timeout,
        )?;

        let base = defaults.default_servers;
        let default_servers = MailServers {
            smtp_host: lookup("MAIL_SCHEDULER_DEFAULT_SMTP_HOST").unwrap_or(base.smtp_host),
            smtp_port: port(&lookup, "MAIL_SCHEDULER_DEFAULT_SMTP_PORT", base.smtp_port)?,
            imap_host: lookup("MAIL_SCHEDULER_DEFAULT_IMAP_HOST").unwrap_or(base.imap_host),
            imap_port: port(&lookup, "MAIL_SCHEDULER_DEFAULT_IMAP_PORT", base.imap_port)?,
        };

        let log_dir = lookup("MAIL_SCHEDULER_LOG_DIR")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            db_path,
            dispatch_interval,
            reply_poll_interval,
            call_timeout,
            default_servers,
            log_dir,
        })
    }
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let value: u64 = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?} is not a number of seconds: {e}"),
    })?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(value))
}

fn port(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u16,
) -> Result<u16, ConfigError> {
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?} is not a port: {e}"),
        }),
        None => Ok(default),
    }
}
