use std::borrow::Cow;

use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::Message;
use thiserror::Error;

/// Per-mailbox message identifier assigned by the server (or derived from a
/// local file name).
pub type Uid = u32;

#[derive(Error, Debug)]
pub enum MailError {
    #[error("IMAP error: {0}")]
    Imap(String),

    #[error("Server rejected the command: {0}")]
    Rejected(String),

    #[error("Connection lost")]
    Disconnected,

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SMTP error: {0}")]
    Smtp(String),

    #[error("Parsing error: {0}")]
    Parse(String),

    #[error("Shutdown requested")]
    Shutdown,
}

impl MailError {
    /// Connectivity faults that are cured by reconnecting and trying again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MailError::Imap(_) | MailError::Disconnected | MailError::Tls(_) | MailError::Io(_)
        )
    }
}

impl From<imap::Error> for MailError {
    fn from(err: imap::Error) -> Self {
        match err {
            imap::Error::Io(e) => MailError::Io(e),
            imap::Error::ConnectionLost => MailError::Disconnected,
            imap::Error::No(reason) | imap::Error::Bad(reason) => MailError::Rejected(reason),
            // APPEND answered with a tagged NO instead of a continuation.
            imap::Error::Append => MailError::Rejected("server refused to store the message".to_string()),
            imap::Error::Parse(e) => MailError::Parse(e.to_string()),
            imap::Error::Validate(e) => MailError::Parse(e.to_string()),
            other => MailError::Imap(other.to_string()),
        }
    }
}

impl From<lettre::error::Error> for MailError {
    fn from(err: lettre::error::Error) -> Self {
        MailError::Smtp(err.to_string())
    }
}

/// A raw message together with its source identifier and flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub uid: Uid,
    pub raw: Vec<u8>,
    pub deleted: bool,
}

impl Envelope {
    pub fn new(uid: Uid, raw: Vec<u8>) -> Self {
        Self { uid, raw, deleted: false }
    }

    pub fn headers(&self) -> MessageHeaders {
        MessageHeaders::parse(&self.raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress {
    pub name: Option<String>,
    pub address: String,
}

impl EmailAddress {
    /// The forms a routing pattern is tested against: the bare address and,
    /// when a display name is present, `Name <address>`.
    pub fn match_forms(&self) -> Vec<Cow<'_, str>> {
        let mut forms = vec![Cow::Borrowed(self.address.as_str())];
        if let Some(name) = &self.name {
            forms.push(Cow::Owned(format!("{} <{}>", name, self.address)));
        }
        forms
    }
}

/// The header fields routing and logging care about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    pub subject: String,
    pub message_id: Option<String>,
    pub from: Vec<EmailAddress>,
    pub recipients: Vec<EmailAddress>,
}

impl MessageHeaders {
    /// Unparseable payloads yield empty headers rather than an error so they
    /// can still be copied verbatim.
    pub fn parse(raw: &[u8]) -> Self {
        let Some(parsed) = mail_parser::Message::parse(raw) else {
            log::debug!("Message of {} bytes could not be parsed", raw.len());
            return Self::default();
        };

        let mut headers = Self {
            subject: parsed.subject().unwrap_or_default().to_string(),
            message_id: parsed.message_id().map(|id| id.to_string()),
            ..Self::default()
        };
        collect_addresses(parsed.from(), &mut headers.from);
        collect_addresses(parsed.to(), &mut headers.recipients);
        collect_addresses(parsed.cc(), &mut headers.recipients);
        collect_addresses(parsed.bcc(), &mut headers.recipients);
        headers
    }

    pub fn sender(&self) -> Option<&EmailAddress> {
        self.from.first()
    }
}

fn collect_addresses(value: &mail_parser::HeaderValue, out: &mut Vec<EmailAddress>) {
    match value {
        mail_parser::HeaderValue::Address(addr) => push_addr(addr, out),
        mail_parser::HeaderValue::AddressList(addrs) => {
            for addr in addrs {
                push_addr(addr, out);
            }
        }
        mail_parser::HeaderValue::Group(group) => {
            for addr in &group.addresses {
                push_addr(addr, out);
            }
        }
        mail_parser::HeaderValue::GroupList(groups) => {
            for addr in groups.iter().flat_map(|g| g.addresses.iter()) {
                push_addr(addr, out);
            }
        }
        _ => {}
    }
}

fn push_addr(addr: &mail_parser::Addr, out: &mut Vec<EmailAddress>) {
    let address = addr.address.as_ref().map(|s| s.to_string()).unwrap_or_default();
    if address.is_empty() {
        return;
    }
    let name = addr
        .name
        .as_ref()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());
    out.push(EmailAddress { name, address });
}

/// Parses an address for use in outgoing headers, falling back to a local
/// placeholder when the configured value (often a bare login name) is not an
/// email address.
pub fn mailbox_or_placeholder(value: &str) -> Result<Mailbox, MailError> {
    value
        .parse()
        .or_else(|_| "imapmirror@localhost".parse())
        .map_err(|e: lettre::address::AddressError| MailError::Parse(e.to_string()))
}

/// Builds the message stored in place of one the destination refused.
pub fn error_notice(owner: &str, reason: &str, original: &MessageHeaders) -> Result<Vec<u8>, MailError> {
    let mailbox = mailbox_or_placeholder(owner)?;
    let body = format!(
        "An error occurred when trying to copy a message.\nError: {}\nSubject: {}\nTime: {}\n",
        reason,
        original.subject,
        chrono::Local::now().to_rfc2822(),
    );
    let message = Message::builder()
        .from(mailbox.clone())
        .to(mailbox)
        .subject(format!("imapmirror error: {} for message: {}", reason, original.subject))
        .header(ContentType::TEXT_PLAIN)
        .body(body)?;
    Ok(message.formatted())
}
