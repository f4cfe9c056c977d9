use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use crate::email::{error_notice, Envelope, MailError, MessageHeaders};
use crate::filter::{resolve_folder, FilterRule};
use crate::shutdown::Shutdown;
use crate::store::{connect_with_retry, Connector, MailStore, MessageSink};

/// Appends messages to folders on a remote IMAP server.
pub struct RemoteSink {
    connector: Arc<dyn Connector>,
    store: Option<Box<dyn MailStore>>,
    /// Folders known to exist on the current connection.
    folders: HashSet<String>,
    default_folder: String,
    /// Routing rules applied to error notices.
    rules: Vec<FilterRule>,
    owner: String,
    retry_delay: Duration,
    shutdown: Shutdown,
}

impl RemoteSink {
    pub fn new(
        connector: Arc<dyn Connector>,
        default_folder: impl Into<String>,
        owner: impl Into<String>,
        retry_delay: Duration,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            connector,
            store: None,
            folders: HashSet::new(),
            default_folder: default_folder.into(),
            rules: Vec::new(),
            owner: owner.into(),
            retry_delay,
            shutdown,
        }
    }

    pub fn with_rules(mut self, rules: Vec<FilterRule>) -> Self {
        self.rules = rules;
        self
    }

    fn reconnect(&mut self) -> Result<(), MailError> {
        if let Some(mut old) = self.store.take() {
            old.logout();
        }
        self.folders.clear();
        self.store = Some(connect_with_retry(self.connector.as_ref(), self.retry_delay, &self.shutdown)?);
        Ok(())
    }

    fn append(&mut self, folder: &str, raw: &[u8]) -> Result<(), MailError> {
        if self.store.is_none() {
            self.reconnect()?;
        }
        let store = self.store.as_mut().ok_or(MailError::Disconnected)?;

        if !self.folders.contains(folder) {
            if store.ensure_folder(folder)? {
                info!("Creating IMAP folder \"{}\"", folder);
            }
            self.folders.insert(folder.to_string());
        }
        store.append(folder, raw)
    }

    fn append_with_retry(&mut self, folder: &str, raw: &[u8]) -> Result<(), MailError> {
        match self.append(folder, raw) {
            Err(e) if e.is_transient() => {
                warn!("Appending to \"{}\" failed ({}), reconnecting", folder, e);
                self.reconnect()?;
                self.append(folder, raw)
            }
            other => other,
        }
    }
}

impl MessageSink for RemoteSink {
    fn default_folder(&self) -> &str {
        &self.default_folder
    }

    fn connect(&mut self) -> Result<(), MailError> {
        self.reconnect()?;
        let default_folder = self.default_folder.clone();
        if let Some(store) = self.store.as_mut() {
            if store.ensure_folder(&default_folder)? {
                info!("Creating IMAP folder \"{}\"", default_folder);
            }
            self.folders.insert(default_folder);
        }
        Ok(())
    }

    fn deliver(&mut self, folder: &str, message: &Envelope, headers: &MessageHeaders) -> Result<(), MailError> {
        info!("Copying \"{}\" to \"{}\"", headers.subject, folder);
        match self.append_with_retry(folder, &message.raw) {
            Err(MailError::Rejected(reason)) => {
                error!("Server refused \"{}\": {}", headers.subject, reason);
                let notice = error_notice(&self.owner, &reason, headers)?;
                let notice_folder =
                    resolve_folder(&self.default_folder, &self.rules, &MessageHeaders::parse(&notice)).to_string();
                match self.append_with_retry(&notice_folder, &notice) {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        error!("Could not store error notice: {}", e);
                        Err(MailError::Rejected(reason))
                    }
                }
            }
            other => other,
        }
    }
}

impl Drop for RemoteSink {
    fn drop(&mut self) {
        if let Some(mut store) = self.store.take() {
            store.logout();
        }
    }
}
