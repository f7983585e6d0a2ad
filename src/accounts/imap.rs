//! Reply detection over IMAP.
//!
//! Raw IMAP over rustls. Blocking; callers run it in `spawn_blocking`.
//! Only `BODY.PEEK` fetches are issued, so checking never marks mail as
//! `\Seen`.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use secrecy::ExposeSecret;

use super::ReplySummary;
use crate::error::MailboxError;
use crate::store::Account;

/// Replies dated slightly before our send time still count; sender clocks
/// are not trustworthy to the second.
const CLOCK_SKEW_ALLOWANCE_SECS: i64 = 300;

fn clock_skew_allowance() -> chrono::Duration {
    chrono::Duration::seconds(CLOCK_SKEW_ALLOWANCE_SECS)
}

/// Upper bound on a single literal, guards against a hostile server.
const MAX_LITERAL_BYTES: usize = 1 << 20;

/// Upper bound on one response line, CRLF included.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Stored reply bodies are cut to this many characters.
const MAX_REPLY_BODY_CHARS: usize = 4000;

/// Completion status of a tagged IMAP command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
}

/// A tagged command's full response.
#[derive(Debug, Default)]
pub struct Response {
    /// Untagged lines (`* ...`), CRLF stripped.
    pub untagged: Vec<String>,
    /// Literal payloads (`{n}` blocks) in arrival order.
    pub literals: Vec<Vec<u8>>,
    pub status: Option<Status>,
    /// Text after the tagged status.
    pub text: String,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.status == Some(Status::Ok)
    }
}

/// A minimal IMAP client session over any byte stream.
pub struct ImapSession<S> {
    stream: S,
    next_tag: u32,
}

impl<S: Read + Write> ImapSession<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            next_tag: 1,
        }
    }

    fn read_line(&mut self) -> Result<String, MailboxError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.stream.read(&mut byte) {
                Ok(0) => return Err(MailboxError::transient("IMAP connection closed")),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        buf.truncate(buf.len() - 2);
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                    if buf.len() >= MAX_LINE_BYTES {
                        return Err(MailboxError::transient(format!(
                            "IMAP line exceeds {MAX_LINE_BYTES} bytes"
                        )));
                    }
                }
                Err(e) => return Err(MailboxError::transient(format!("IMAP read failed: {e}"))),
            }
        }
    }

    fn read_literal(&mut self, len: usize) -> Result<Vec<u8>, MailboxError> {
        if len > MAX_LITERAL_BYTES {
            return Err(MailboxError::transient(format!(
                "IMAP literal too large: {len} bytes"
            )));
        }
        let mut buf = vec![0u8; len];
        self.stream
            .read_exact(&mut buf)
            .map_err(|e| MailboxError::transient(format!("IMAP read failed: {e}")))?;
        Ok(buf)
    }

    /// Read and check the server greeting.
    pub fn greeting(&mut self) -> Result<(), MailboxError> {
        let line = self.read_line()?;
        if line.starts_with("* OK") || line.starts_with("* PREAUTH") {
            Ok(())
        } else {
            Err(MailboxError::transient(format!(
                "Unexpected IMAP greeting: {line}"
            )))
        }
    }

    /// Send one command and collect everything up to its tagged completion.
    pub fn command(&mut self, cmd: &str) -> Result<Response, MailboxError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let full = format!("{tag} {cmd}\r\n");
        self.stream
            .write_all(full.as_bytes())
            .and_then(|_| self.stream.flush())
            .map_err(|e| MailboxError::transient(format!("IMAP write failed: {e}")))?;

        let prefix = format!("{tag} ");
        let mut response = Response::default();
        loop {
            let line = self.read_line()?;
            if let Some(rest) = line.strip_prefix(&prefix) {
                let (status, text) = rest.split_once(' ').unwrap_or((rest, ""));
                response.status = match status.to_ascii_uppercase().as_str() {
                    "OK" => Some(Status::Ok),
                    "NO" => Some(Status::No),
                    _ => Some(Status::Bad),
                };
                response.text = text.to_string();
                return Ok(response);
            }
            if let Some(len) = literal_len(&line) {
                let literal = self.read_literal(len)?;
                response.literals.push(literal);
            }
            response.untagged.push(line);
        }
    }
}

/// Length announced by a trailing `{n}` literal marker, if any.
fn literal_len(line: &str) -> Option<usize> {
    let inner = line.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

/// Quote a string for use as an IMAP quoted string.
pub fn quote(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// IMAP `SINCE` date (day granularity, e.g. `1-Jan-2024`).
pub fn imap_date(dt: DateTime<Utc>) -> String {
    dt.format("%-d-%b-%Y").to_string()
}

/// Search for messages referencing `thread_id` dated on or after `since`.
pub fn reply_search_command(thread_id: &str, since: DateTime<Utc>) -> String {
    let since_day = since - clock_skew_allowance();
    format!(
        "SEARCH SINCE {} OR HEADER In-Reply-To {} HEADER References {}",
        imap_date(since_day),
        quote(thread_id),
        quote(thread_id)
    )
}

/// Sequence numbers from `* SEARCH` lines.
pub fn parse_search(untagged: &[String]) -> Vec<u32> {
    untagged
        .iter()
        .filter_map(|line| line.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
        .collect()
}

/// Decide whether a fetched header block is a reply from someone else.
pub fn is_external_reply(headers: &[u8], own_address: &str, since: DateTime<Utc>) -> bool {
    let Some(parsed) = MessageParser::default().parse(headers) else {
        return false;
    };

    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string());
    match sender {
        Some(ref s) if !s.eq_ignore_ascii_case(own_address) => {}
        _ => return false,
    }

    match parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
    {
        Some(date) => date + clock_skew_allowance() >= since,
        // SEARCH SINCE already bounded the day.
        None => true,
    }
}

/// Sender, subject, date and leading body text of a fetched reply.
pub fn summarize_reply(raw: &[u8]) -> ReplySummary {
    let Some(parsed) = MessageParser::default().parse(raw) else {
        return ReplySummary::default();
    };

    let from = parsed.from().and_then(|addr| addr.first()).and_then(|a| {
        match (a.name(), a.address()) {
            (Some(name), Some(address)) => Some(format!("{name} <{address}>")),
            (None, Some(address)) => Some(address.to_string()),
            (Some(name), None) => Some(name.to_string()),
            (None, None) => None,
        }
    });
    let body = parsed.body_text(0).map(|text| {
        let text = text.trim();
        match text.char_indices().nth(MAX_REPLY_BODY_CHARS) {
            Some((cut, _)) => text[..cut].to_string(),
            None => text.to_string(),
        }
    });

    ReplySummary {
        from,
        subject: parsed.subject().map(|s| s.to_string()),
        received_at: parsed
            .date()
            .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0)),
        body: body.filter(|b| !b.is_empty()),
    }
}

/// Run the reply check on an established session.
///
/// Headers are peeked for every hit; only the first external reply has its
/// full text fetched.
pub fn check_thread<S: Read + Write>(
    session: &mut ImapSession<S>,
    account: &Account,
    thread_id: &str,
    since: DateTime<Utc>,
) -> Result<Option<ReplySummary>, MailboxError> {
    session.greeting()?;

    let login = session.command(&format!(
        "LOGIN {} {}",
        quote(&account.address),
        quote(account.secret.expose_secret())
    ))?;
    if !login.is_ok() {
        return Err(MailboxError::auth(
            account.id.to_string(),
            format!("IMAP login rejected: {}", login.text),
        ));
    }

    let select = session.command("SELECT \"INBOX\"")?;
    if !select.is_ok() {
        return Err(MailboxError::transient(format!(
            "IMAP SELECT failed: {}",
            select.text
        )));
    }

    let search = session.command(&reply_search_command(thread_id, since))?;
    if !search.is_ok() {
        return Err(MailboxError::transient(format!(
            "IMAP SEARCH failed: {}",
            search.text
        )));
    }
    let hits = parse_search(&search.untagged);
    tracing::debug!(account_id = %account.id, hits = hits.len(), "Thread search complete");

    let mut found = None;
    for seq in hits {
        let fetch = session.command(&format!("FETCH {seq} BODY.PEEK[HEADER]"))?;
        if !fetch.is_ok() {
            continue;
        }
        let Some(headers) = fetch
            .literals
            .iter()
            .find(|h| is_external_reply(h, &account.address, since))
        else {
            continue;
        };

        let full = session.command(&format!("FETCH {seq} BODY.PEEK[]"))?;
        let summary = match full.literals.first() {
            Some(raw) if full.is_ok() => summarize_reply(raw),
            _ => summarize_reply(headers),
        };
        found = Some(summary);
        break;
    }

    let _ = session.command("LOGOUT");
    Ok(found)
}

/// Connect to the account's IMAP server over TLS and check for a reply.
pub fn find_external_reply(
    account: &Account,
    thread_id: &str,
    since: DateTime<Utc>,
    timeout: Duration,
) -> Result<Option<ReplySummary>, MailboxError> {
    let host = account.servers.imap_host.as_str();
    let addr = (host, account.servers.imap_port)
        .to_socket_addrs()
        .map_err(|e| MailboxError::transient(format!("Cannot resolve {host}: {e}")))?
        .next()
        .ok_or_else(|| MailboxError::transient(format!("No address for {host}")))?;

    let io_err = |e: std::io::Error| MailboxError::transient(format!("IMAP connect failed: {e}"));
    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(io_err)?;
    tcp.set_read_timeout(Some(timeout)).map_err(io_err)?;
    tcp.set_write_timeout(Some(timeout)).map_err(io_err)?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = rustls_pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| MailboxError::transient(format!("Invalid IMAP host {host}: {e}")))?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| MailboxError::transient(format!("TLS setup failed: {e}")))?;
    let tls = rustls::StreamOwned::new(conn, tcp);

    let mut session = ImapSession::new(tls);
    check_thread(&mut session, account, thread_id, since)
}
