//! libSQL backend for the async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Every state transition is a
//! single `UPDATE ... WHERE id = ? AND state = ?`, which is what makes the
//! dispatcher/reconciler claims atomic.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MailServers;
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    Account, AccountStats, Database, FailureRecord, MessageState, NewAccount, NewReply,
    NewScheduledMessage, RecoveryReport, ReplyRecord, ScheduledMessage, StateFields,
};

/// Reason stored on rows whose send was cut off by a restart.
pub const INTERRUPTED_SEND_REASON: &str = "interrupted during send; delivery unknown";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    /// Servers given to accounts registered without their own.
    default_servers: MailServers,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            default_servers: MailServers::default(),
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            default_servers: MailServers::default(),
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Use `servers` for accounts registered without explicit hosts.
    pub fn with_default_servers(mut self, servers: MailServers) -> Self {
        self.default_servers = servers;
        self
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_messages(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<ScheduledMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            match row_to_message(&row) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!("Skipping scheduled message row: {e}"),
            }
        }
        Ok(messages)
    }

    async fn query_accounts(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<Account>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut accounts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            match row_to_account(&row) {
                Ok(acc) => accounts.push(acc),
                Err(e) => warn!("Skipping account row: {e}"),
            }
        }
        Ok(accounts)
    }

    async fn query_failures(
        &self,
        sql: &str,
        message_id: Uuid,
        op: &str,
    ) -> Result<Vec<FailureRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params![message_id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            let msg_id: String = row.get(1).map_err(row_err)?;
            let recorded: String = row.get(3).map_err(row_err)?;
            records.push(FailureRecord {
                id: row.get(0).map_err(row_err)?,
                message_id: parse_uuid(&msg_id)?,
                reason: row.get(2).map_err(row_err)?,
                recorded_at: parse_datetime(&recorded),
            });
        }
        Ok(records)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width, so text comparison in SQL
/// orders the same way as time.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    opt_text_owned(dt.map(fmt_ts))
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s:?}: {e}")))
}

fn row_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row parse: {e}"))
}

const ACCOUNT_COLUMNS: &str =
    "id, display_name, address, secret, smtp_host, smtp_port, imap_host, imap_port, created_at";

const MESSAGE_COLUMNS: &str = "id, account_id, recipients, subject, body, scheduled_at, state, provider_message_id, provider_thread_id, sent_at, replied_at, last_checked_at, last_error, attempts, created_at, updated_at";

const REPLY_COLUMNS: &str =
    "id, message_id, account_id, sender, subject, body, received_at, recorded_at";

/// Map a libsql Row to a ReplyRecord. Column order matches REPLY_COLUMNS.
fn row_to_reply(row: &libsql::Row) -> Result<ReplyRecord, DatabaseError> {
    let message_id: String = row.get(1).map_err(row_err)?;
    let account_id: String = row.get(2).map_err(row_err)?;
    let received: Option<String> = row.get(6).ok();
    let recorded: String = row.get(7).map_err(row_err)?;

    Ok(ReplyRecord {
        id: row.get(0).map_err(row_err)?,
        message_id: parse_uuid(&message_id)?,
        account_id: parse_uuid(&account_id)?,
        sender: row.get(3).ok(),
        subject: row.get(4).ok(),
        body: row.get(5).ok(),
        received_at: parse_optional_datetime(&received),
        recorded_at: parse_datetime(&recorded),
    })
}

/// Map a libsql Row to an Account. Column order matches ACCOUNT_COLUMNS.
fn row_to_account(row: &libsql::Row) -> Result<Account, DatabaseError> {
    let id: String = row.get(0).map_err(row_err)?;
    let secret: String = row.get(3).map_err(row_err)?;
    let smtp_port: i64 = row.get(5).map_err(row_err)?;
    let imap_port: i64 = row.get(7).map_err(row_err)?;
    let created: String = row.get(8).map_err(row_err)?;

    Ok(Account {
        id: parse_uuid(&id)?,
        display_name: row.get(1).map_err(row_err)?,
        address: row.get(2).map_err(row_err)?,
        secret: SecretString::from(secret),
        servers: MailServers {
            smtp_host: row.get(4).map_err(row_err)?,
            smtp_port: u16::try_from(smtp_port)
                .map_err(|e| DatabaseError::Serialization(format!("smtp_port: {e}")))?,
            imap_host: row.get(6).map_err(row_err)?,
            imap_port: u16::try_from(imap_port)
                .map_err(|e| DatabaseError::Serialization(format!("imap_port: {e}")))?,
        },
        created_at: parse_datetime(&created),
    })
}

/// Map a libsql Row to a ScheduledMessage. Column order matches MESSAGE_COLUMNS.
fn row_to_message(row: &libsql::Row) -> Result<ScheduledMessage, DatabaseError> {
    let id: String = row.get(0).map_err(row_err)?;
    let account_id: String = row.get(1).map_err(row_err)?;
    let recipients_json: String = row.get(2).map_err(row_err)?;
    let scheduled: String = row.get(5).map_err(row_err)?;
    let state: String = row.get(6).map_err(row_err)?;
    let sent: Option<String> = row.get(9).ok();
    let replied: Option<String> = row.get(10).ok();
    let checked: Option<String> = row.get(11).ok();
    let attempts: i64 = row.get(13).map_err(row_err)?;
    let created: String = row.get(14).map_err(row_err)?;
    let updated: String = row.get(15).map_err(row_err)?;

    let recipients: Vec<String> = serde_json::from_str(&recipients_json)
        .map_err(|e| DatabaseError::Serialization(format!("recipients: {e}")))?;

    Ok(ScheduledMessage {
        id: parse_uuid(&id)?,
        account_id: parse_uuid(&account_id)?,
        recipients,
        subject: row.get(3).map_err(row_err)?,
        body: row.get(4).map_err(row_err)?,
        scheduled_at: parse_datetime(&scheduled),
        state: state.parse()?,
        provider_message_id: row.get(7).ok(),
        provider_thread_id: row.get(8).ok(),
        sent_at: parse_optional_datetime(&sent),
        replied_at: parse_optional_datetime(&replied),
        last_checked_at: parse_optional_datetime(&checked),
        last_error: row.get(12).ok(),
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn validate_recipients(recipients: &[String]) -> Result<(), DatabaseError> {
    if recipients.is_empty() {
        return Err(DatabaseError::Constraint(
            "a scheduled message needs at least one recipient".into(),
        ));
    }
    if let Some(bad) = recipients
        .iter()
        .find(|r| r.trim().is_empty() || !r.contains('@'))
    {
        return Err(DatabaseError::Constraint(format!(
            "invalid recipient address: {bad:?}"
        )));
    }
    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Accounts ────────────────────────────────────────────────────

    async fn create_account(&self, account: &NewAccount) -> Result<Account, DatabaseError> {
        let address = account.address.trim().to_string();
        if !address.contains('@') {
            return Err(DatabaseError::Constraint(format!(
                "invalid mailbox address: {address:?}"
            )));
        }
        if self.get_account_by_address(&address).await?.is_some() {
            return Err(DatabaseError::Constraint(format!(
                "mailbox {address} is already registered"
            )));
        }

        let servers = account
            .servers
            .clone()
            .unwrap_or_else(|| self.default_servers.clone());
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.conn()
            .execute(
                "INSERT INTO accounts (id, display_name, address, secret, smtp_host, smtp_port,
                    imap_host, imap_port, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id.to_string(),
                    account.display_name.clone(),
                    address.clone(),
                    account.secret.expose_secret().to_string(),
                    servers.smtp_host.clone(),
                    i64::from(servers.smtp_port),
                    servers.imap_host.clone(),
                    i64::from(servers.imap_port),
                    fmt_ts(now),
                ],
            )
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE") {
                    DatabaseError::Constraint(format!("mailbox {address} is already registered"))
                } else {
                    DatabaseError::Query(format!("create_account: {msg}"))
                }
            })?;

        info!(account_id = %id, address = %address, "Account registered");
        Ok(Account {
            id,
            display_name: account.display_name.clone(),
            address,
            secret: account.secret.clone(),
            servers,
            created_at: parse_datetime(&fmt_ts(now)),
        })
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>, DatabaseError> {
        let mut accounts = self
            .query_accounts(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                params![id.to_string()],
                "get_account",
            )
            .await?;
        Ok(accounts.pop())
    }

    async fn get_account_by_address(
        &self,
        address: &str,
    ) -> Result<Option<Account>, DatabaseError> {
        let mut accounts = self
            .query_accounts(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE address = ?1 COLLATE NOCASE"),
                params![address.trim()],
                "get_account_by_address",
            )
            .await?;
        Ok(accounts.pop())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, DatabaseError> {
        self.query_accounts(
            &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY created_at ASC"),
            (),
            "list_accounts",
        )
        .await
    }

    async fn delete_account(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let id_str = id.to_string();

        // SQLite only enforces ON DELETE CASCADE with foreign_keys=ON, so
        // dependent rows are removed explicitly.
        conn.execute(
            "DELETE FROM failure_log WHERE message_id IN
                (SELECT id FROM scheduled_messages WHERE account_id = ?1)",
            params![id_str.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("delete_account (failures): {e}")))?;

        conn.execute(
            "DELETE FROM send_receipts WHERE message_id IN
                (SELECT id FROM scheduled_messages WHERE account_id = ?1)",
            params![id_str.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("delete_account (receipts): {e}")))?;

        conn.execute(
            "DELETE FROM replies WHERE account_id = ?1",
            params![id_str.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("delete_account (replies): {e}")))?;

        let removed_messages = conn
            .execute(
                "DELETE FROM scheduled_messages WHERE account_id = ?1",
                params![id_str.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_account (messages): {e}")))?;

        let count = conn
            .execute("DELETE FROM accounts WHERE id = ?1", params![id_str])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_account: {e}")))?;

        if count > 0 {
            info!(account_id = %id, removed_messages, "Account deleted");
        }
        Ok(count > 0)
    }

    async fn account_stats(&self, account_id: Uuid) -> Result<AccountStats, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*),
                    COALESCE(SUM(state IN ('sent', 'checking')), 0),
                    COALESCE(SUM(state = 'replied'), 0),
                    COALESCE(SUM(state = 'failed'), 0)
                 FROM scheduled_messages WHERE account_id = ?1",
                params![account_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("account_stats: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("account_stats: {e}")))?;
        let Some(row) = row else {
            return Ok(AccountStats::default());
        };

        let get = |idx: i32| -> Result<u64, DatabaseError> {
            let v: i64 = row.get(idx).map_err(row_err)?;
            Ok(u64::try_from(v).unwrap_or(0))
        };
        Ok(AccountStats {
            total: get(0)?,
            sent: get(1)?,
            replied: get(2)?,
            failed: get(3)?,
        })
    }

    // ── Scheduled messages ──────────────────────────────────────────

    async fn schedule_message(
        &self,
        message: &NewScheduledMessage,
    ) -> Result<ScheduledMessage, DatabaseError> {
        validate_recipients(&message.recipients)?;
        if self.get_account(message.account_id).await?.is_none() {
            return Err(DatabaseError::NotFound {
                entity: "account".into(),
                id: message.account_id.to_string(),
            });
        }

        let id = Uuid::new_v4();
        let now = fmt_ts(Utc::now());
        let recipients: Vec<String> = message
            .recipients
            .iter()
            .map(|r| r.trim().to_string())
            .collect();
        let recipients_json = serde_json::to_string(&recipients)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO scheduled_messages (id, account_id, recipients, subject, body,
                    scheduled_at, state, attempts, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7, ?7)",
                params![
                    id.to_string(),
                    message.account_id.to_string(),
                    recipients_json,
                    message.subject.clone(),
                    message.body.clone(),
                    fmt_ts(message.scheduled_at),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("schedule_message: {e}")))?;

        debug!(
            message_id = %id,
            account_id = %message.account_id,
            scheduled_at = %message.scheduled_at,
            "Message scheduled"
        );

        self.get_message(id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "scheduled_message".into(),
            id: id.to_string(),
        })
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<ScheduledMessage>, DatabaseError> {
        let mut messages = self
            .query_messages(
                &format!("SELECT {MESSAGE_COLUMNS} FROM scheduled_messages WHERE id = ?1"),
                params![id.to_string()],
                "get_message",
            )
            .await?;
        Ok(messages.pop())
    }

    async fn list_messages(&self, limit: usize) -> Result<Vec<ScheduledMessage>, DatabaseError> {
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM scheduled_messages ORDER BY scheduled_at DESC LIMIT ?1"
            ),
            params![i64::try_from(limit).unwrap_or(i64::MAX)],
            "list_messages",
        )
        .await
    }

    async fn list_pending_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledMessage>, DatabaseError> {
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM scheduled_messages
                 WHERE state = 'pending' AND scheduled_at <= ?1
                 ORDER BY scheduled_at ASC, created_at ASC"
            ),
            params![fmt_ts(now)],
            "list_pending_due",
        )
        .await
    }

    async fn list_sent(&self) -> Result<Vec<ScheduledMessage>, DatabaseError> {
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM scheduled_messages
                 WHERE state = 'sent'
                 ORDER BY sent_at ASC"
            ),
            (),
            "list_sent",
        )
        .await
    }

    async fn update_state(
        &self,
        id: Uuid,
        expected: MessageState,
        new: MessageState,
        fields: &StateFields,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE scheduled_messages SET
                    state = ?1,
                    provider_message_id = COALESCE(?2, provider_message_id),
                    provider_thread_id = COALESCE(?3, provider_thread_id),
                    sent_at = COALESCE(?4, sent_at),
                    replied_at = COALESCE(?5, replied_at),
                    last_checked_at = COALESCE(?6, last_checked_at),
                    last_error = COALESCE(?7, last_error),
                    attempts = attempts + ?8,
                    updated_at = ?9
                 WHERE id = ?10 AND state = ?11",
                params![
                    new.as_str(),
                    opt_text_owned(fields.provider_message_id.clone()),
                    opt_text_owned(fields.provider_thread_id.clone()),
                    opt_ts(fields.sent_at),
                    opt_ts(fields.replied_at),
                    opt_ts(fields.last_checked_at),
                    opt_text_owned(fields.last_error.clone()),
                    i64::from(fields.count_attempt),
                    fmt_ts(Utc::now()),
                    id.to_string(),
                    expected.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_state: {e}")))?;

        debug!(
            message_id = %id,
            from = %expected,
            to = %new,
            applied = count > 0,
            "Conditional state update"
        );
        Ok(count > 0)
    }

    async fn reschedule_message(
        &self,
        id: Uuid,
        scheduled_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE scheduled_messages
                 SET state = 'pending', scheduled_at = ?1, last_error = NULL, updated_at = ?2
                 WHERE id = ?3 AND state IN ('pending', 'failed')",
                params![fmt_ts(scheduled_at), fmt_ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reschedule_message: {e}")))?;

        if count > 0 {
            info!(message_id = %id, scheduled_at = %scheduled_at, "Message rescheduled");
        }
        Ok(count > 0)
    }

    async fn delete_message(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM failure_log WHERE message_id = ?1",
            params![id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("delete_message (failures): {e}")))?;

        for table in ["replies", "send_receipts"] {
            conn.execute(
                &format!("DELETE FROM {table} WHERE message_id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_message ({table}): {e}")))?;
        }

        let count = conn
            .execute(
                "DELETE FROM scheduled_messages WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_message: {e}")))?;
        Ok(count > 0)
    }

    async fn record_send_receipt(
        &self,
        message_id: Uuid,
        provider_message_id: &str,
        provider_thread_id: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO send_receipts
                    (message_id, provider_message_id, provider_thread_id, sent_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    message_id.to_string(),
                    provider_message_id,
                    provider_thread_id,
                    fmt_ts(sent_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_send_receipt: {e}")))?;
        Ok(())
    }

    async fn apply_send_receipts(&self) -> Result<Vec<Uuid>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT message_id, provider_message_id, provider_thread_id, sent_at
                 FROM send_receipts",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("apply_send_receipts: {e}")))?;

        let mut receipts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("apply_send_receipts: {e}")))?
        {
            let message_id: String = row.get(0).map_err(row_err)?;
            let sent_at: String = row.get(3).map_err(row_err)?;
            receipts.push((
                message_id,
                StateFields {
                    provider_message_id: Some(row.get(1).map_err(row_err)?),
                    provider_thread_id: Some(row.get(2).map_err(row_err)?),
                    sent_at: Some(parse_datetime(&sent_at)),
                    ..Default::default()
                },
            ));
        }

        let mut completed = Vec::new();
        for (message_id, fields) in receipts {
            match parse_uuid(&message_id) {
                Ok(id) => {
                    if self
                        .update_state(id, MessageState::Sending, MessageState::Sent, &fields)
                        .await?
                    {
                        info!(message_id = %id, "Completed send from kept receipt");
                        completed.push(id);
                    }
                }
                Err(e) => warn!("Dropping send receipt: {e}"),
            }
            // Rows no longer in `sending` have nothing left to complete.
            self.conn()
                .execute(
                    "DELETE FROM send_receipts WHERE message_id = ?1",
                    params![message_id],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("apply_send_receipts: {e}")))?;
        }
        Ok(completed)
    }

    async fn recover_interrupted_claims(&self) -> Result<RecoveryReport, DatabaseError> {
        let confirmed_sends = self.apply_send_receipts().await?;

        let released_checks = self
            .conn()
            .execute(
                "UPDATE scheduled_messages SET state = 'sent', updated_at = ?1
                 WHERE state = 'checking'",
                params![fmt_ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recover_interrupted_claims: {e}")))?;

        let stuck = self
            .query_messages(
                &format!("SELECT {MESSAGE_COLUMNS} FROM scheduled_messages WHERE state = 'sending'"),
                (),
                "recover_interrupted_claims",
            )
            .await?;

        let mut abandoned_sends = Vec::new();
        for msg in stuck {
            let fields = StateFields {
                last_error: Some(INTERRUPTED_SEND_REASON.to_string()),
                ..Default::default()
            };
            if self
                .update_state(msg.id, MessageState::Sending, MessageState::Failed, &fields)
                .await?
            {
                abandoned_sends.push(msg.id);
            }
        }

        if released_checks > 0 || !confirmed_sends.is_empty() || !abandoned_sends.is_empty() {
            warn!(
                released_checks,
                confirmed_sends = confirmed_sends.len(),
                abandoned_sends = abandoned_sends.len(),
                "Recovered claims left by an interrupted run"
            );
        }
        Ok(RecoveryReport {
            released_checks: usize::try_from(released_checks).unwrap_or(usize::MAX),
            confirmed_sends,
            abandoned_sends,
        })
    }

    // ── Failure log ─────────────────────────────────────────────────

    async fn record_failure_log(
        &self,
        message_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO failure_log (message_id, reason, recorded_at) VALUES (?1, ?2, ?3)",
                params![message_id.to_string(), reason, fmt_ts(at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_failure_log: {e}")))?;
        Ok(())
    }

    async fn list_failures(&self, message_id: Uuid) -> Result<Vec<FailureRecord>, DatabaseError> {
        self.query_failures(
            "SELECT id, message_id, reason, recorded_at FROM failure_log
             WHERE message_id = ?1 ORDER BY id ASC",
            message_id,
            "list_failures",
        )
        .await
    }

    async fn latest_failure(
        &self,
        message_id: Uuid,
    ) -> Result<Option<FailureRecord>, DatabaseError> {
        let mut records = self
            .query_failures(
                "SELECT id, message_id, reason, recorded_at FROM failure_log
                 WHERE message_id = ?1 ORDER BY id DESC LIMIT 1",
                message_id,
                "latest_failure",
            )
            .await?;
        Ok(records.pop())
    }

    // ── Inbox ───────────────────────────────────────────────────────

    async fn record_reply(
        &self,
        reply: &NewReply,
        recorded_at: DateTime<Utc>,
    ) -> Result<ReplyRecord, DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO replies (message_id, account_id, sender, subject, body,
                    received_at, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    reply.message_id.to_string(),
                    reply.account_id.to_string(),
                    opt_text_owned(reply.sender.clone()),
                    opt_text_owned(reply.subject.clone()),
                    opt_text_owned(reply.body.clone()),
                    opt_ts(reply.received_at),
                    fmt_ts(recorded_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_reply: {e}")))?;

        debug!(message_id = %reply.message_id, "Reply stored");
        Ok(ReplyRecord {
            id: self.conn().last_insert_rowid(),
            message_id: reply.message_id,
            account_id: reply.account_id,
            sender: reply.sender.clone(),
            subject: reply.subject.clone(),
            body: reply.body.clone(),
            received_at: reply.received_at,
            recorded_at: parse_datetime(&fmt_ts(recorded_at)),
        })
    }

    async fn list_replies(
        &self,
        account_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<ReplyRecord>, DatabaseError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = match account_id {
            Some(account_id) => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {REPLY_COLUMNS} FROM replies WHERE account_id = ?1
                             ORDER BY recorded_at DESC, id DESC LIMIT ?2"
                        ),
                        params![account_id.to_string(), limit],
                    )
                    .await
            }
            None => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {REPLY_COLUMNS} FROM replies
                             ORDER BY recorded_at DESC, id DESC LIMIT ?1"
                        ),
                        params![limit],
                    )
                    .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("list_replies: {e}")))?;

        let mut replies = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_replies: {e}")))?
        {
            match row_to_reply(&row) {
                Ok(reply) => replies.push(reply),
                Err(e) => warn!("Skipping reply row: {e}"),
            }
        }
        Ok(replies)
    }
}
