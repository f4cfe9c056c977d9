//! Capabilities the sync engine is written against: something that yields
//! messages by UID, something that stores them, and the live connection
//! primitives a remote mailbox adds on top.

use std::time::Duration;

use log::{info, warn};

use crate::email::{Envelope, MailError, MessageHeaders, Uid};
use crate::shutdown::Shutdown;

pub trait MessageSource {
    /// Highest identifier assigned so far (0 for an empty mailbox).
    fn high_water(&mut self) -> Result<Uid, MailError>;

    /// Existing identifiers in `(after, upto]`, ascending.
    fn uids_in(&mut self, after: Uid, upto: Uid) -> Result<Vec<Uid>, MailError>;

    /// `Ok(None)` when the message is gone.
    fn fetch(&mut self, uid: Uid) -> Result<Option<Envelope>, MailError>;

    /// Flags the message deleted and expunges it.
    fn remove(&mut self, uid: Uid) -> Result<(), MailError>;
}

pub trait MessageSink: Send {
    /// Folder used when no routing rule matches.
    fn default_folder(&self) -> &str;

    fn connect(&mut self) -> Result<(), MailError>;

    fn deliver(&mut self, folder: &str, message: &Envelope, headers: &MessageHeaders) -> Result<(), MailError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    /// The server reported a change to the selected folder.
    NewMail,
    TimedOut,
}

/// One open connection to a remote mail server.
pub trait MailStore: MessageSource + Send {
    fn append(&mut self, folder: &str, raw: &[u8]) -> Result<(), MailError>;

    /// Creates the folder if it does not exist. Returns `true` if it was
    /// created.
    fn ensure_folder(&mut self, folder: &str) -> Result<bool, MailError>;

    fn noop(&mut self) -> Result<(), MailError>;

    /// Blocks until the server pushes a change or `timeout` passes.
    fn idle(&mut self, timeout: Duration) -> Result<IdleEvent, MailError>;

    fn logout(&mut self);
}

/// Opens new [`MailStore`] connections to one endpoint.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn MailStore>, MailError>;

    fn describe(&self) -> String;
}

/// Connects, retrying every `delay` until it works or shutdown is requested.
pub fn connect_with_retry(
    connector: &dyn Connector,
    delay: Duration,
    shutdown: &Shutdown,
) -> Result<Box<dyn MailStore>, MailError> {
    loop {
        if shutdown.is_triggered() {
            return Err(MailError::Shutdown);
        }
        info!("Connecting to {}", connector.describe());
        match connector.connect() {
            Ok(store) => return Ok(store),
            Err(e) => {
                warn!("Connecting to {} failed: {}", connector.describe(), e);
                if shutdown.sleep(delay) {
                    return Err(MailError::Shutdown);
                }
            }
        }
    }
}
