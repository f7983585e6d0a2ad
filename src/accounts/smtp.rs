//! Outbound delivery over SMTP via lettre.

use std::time::Duration;

use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use uuid::Uuid;

use crate::error::MailboxError;
use crate::store::Account;

/// Generate a globally unique `Message-ID` in the sender's domain.
pub fn new_message_id(address: &str) -> String {
    let domain = address
        .rsplit_once('@')
        .map(|(_, d)| d)
        .filter(|d| !d.is_empty())
        .unwrap_or("localhost");
    format!("<{}@{}>", Uuid::new_v4().simple(), domain)
}

/// Build the outgoing message. Bodies are sent as HTML.
pub fn build_message(
    account: &Account,
    recipients: &[String],
    subject: &str,
    body: &str,
    message_id: &str,
) -> Result<Message, MailboxError> {
    let from_addr: Address = account.address.parse().map_err(|e| {
        MailboxError::permanent(format!("Invalid from address {}: {e}", account.address))
    })?;
    let from = Mailbox::new(Some(account.display_name.clone()), from_addr);

    let mut builder = Message::builder()
        .from(from)
        .subject(subject)
        .message_id(Some(message_id.to_string()))
        .header(ContentType::TEXT_HTML);

    if recipients.is_empty() {
        return Err(MailboxError::permanent("No recipients"));
    }
    for to in recipients {
        let mailbox: Mailbox = to
            .parse()
            .map_err(|e| MailboxError::permanent(format!("Invalid to address {to}: {e}")))?;
        builder = builder.to(mailbox);
    }

    builder
        .body(body.to_string())
        .map_err(|e| MailboxError::permanent(format!("Failed to build email: {e}")))
}

/// Submit a message over SMTP (blocking; run in spawn_blocking).
///
/// Port 465 uses implicit TLS; anything else negotiates STARTTLS.
pub fn deliver(account: &Account, message: &Message, timeout: Duration) -> Result<(), MailboxError> {
    let creds = Credentials::new(
        account.address.clone(),
        account.secret.expose_secret().to_string(),
    );

    let host = &account.servers.smtp_host;
    let builder = if account.servers.smtp_port == 465 {
        SmtpTransport::relay(host)
    } else {
        SmtpTransport::starttls_relay(host)
    }
    .map_err(|e| MailboxError::transient(format!("SMTP relay error: {e}")))?;

    let transport = builder
        .port(account.servers.smtp_port)
        .credentials(creds)
        .timeout(Some(timeout))
        .build();

    transport
        .send(message)
        .map_err(|e| classify_smtp_error(&account.id.to_string(), &e))?;

    tracing::info!(account_id = %account.id, "Email submitted over SMTP");
    Ok(())
}

fn classify_smtp_error(account_id: &str, err: &lettre::transport::smtp::Error) -> MailboxError {
    let status = err.status().map(|code| code.to_string());
    classify(account_id, status.as_deref(), err.is_permanent(), err.to_string())
}

/// Map an SMTP failure onto the registry error taxonomy.
///
/// 530/534/535 are authentication replies; other 5xx are rejections of the
/// message itself; everything else (4xx, I/O, TLS, timeouts) may clear up.
pub(crate) fn classify(
    account_id: &str,
    status: Option<&str>,
    permanent: bool,
    detail: String,
) -> MailboxError {
    match status {
        Some("530" | "534" | "535") => MailboxError::auth(account_id, detail),
        _ if permanent => MailboxError::permanent(detail),
        _ if detail.to_ascii_lowercase().contains("authentication") => {
            MailboxError::auth(account_id, detail)
        }
        _ => MailboxError::transient(detail),
    }
}
