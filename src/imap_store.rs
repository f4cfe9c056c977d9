use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use imap::extensions::idle::{SetReadTimeout, WaitOutcome};
use imap::types::Flag;
use imap::Session;
use log::debug;
use native_tls::TlsConnector;

use crate::config::{ImapSecurity, RemoteEndpoint};
use crate::email::{Envelope, MailError, Uid};
use crate::store::{Connector, IdleEvent, MailStore, MessageSource};

/// How a new connection opens the endpoint's folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderAccess {
    ReadOnly,
    ReadWrite,
    /// Log in only; used by sinks, which append by folder name.
    None,
}

pub struct ImapConnector {
    endpoint: RemoteEndpoint,
    password: String,
    access: FolderAccess,
}

impl ImapConnector {
    pub fn new(endpoint: RemoteEndpoint, password: String, access: FolderAccess) -> Self {
        Self {
            endpoint,
            password,
            access,
        }
    }

    fn open<T>(&self, client: imap::Client<T>) -> Result<Box<dyn MailStore>, MailError>
    where
        T: Read + Write + SetReadTimeout + Send + 'static,
    {
        let mut session = client
            .login(&self.endpoint.user, &self.password)
            .map_err(|e| MailError::from(e.0))?;

        match self.access {
            FolderAccess::ReadOnly => {
                session.examine(&self.endpoint.folder)?;
            }
            FolderAccess::ReadWrite => {
                session.select(&self.endpoint.folder)?;
            }
            FolderAccess::None => {}
        }
        debug!("Logged in to {} ({:?})", self.endpoint, self.access);

        Ok(Box::new(ImapStore {
            session,
            folder: self.endpoint.folder.clone(),
        }))
    }
}

impl Connector for ImapConnector {
    fn connect(&self) -> Result<Box<dyn MailStore>, MailError> {
        let domain = self.endpoint.server.as_str();
        let port = self.endpoint.port;

        match self.endpoint.security {
            ImapSecurity::SSL => {
                let tls = TlsConnector::builder().build()?;
                let client = imap::connect((domain, port), domain, &tls)?;
                self.open(client)
            }
            ImapSecurity::StartTLS => {
                let tls = TlsConnector::builder().build()?;
                let client = imap::connect_starttls((domain, port), domain, &tls)?;
                self.open(client)
            }
            ImapSecurity::None => {
                let tcp_stream = TcpStream::connect((domain, port))?;
                let mut client = imap::Client::new(tcp_stream);
                client.read_greeting()?;
                self.open(client)
            }
        }
    }

    fn describe(&self) -> String {
        self.endpoint.to_string()
    }
}

/// A logged-in IMAP session with the endpoint's folder selected.
pub struct ImapStore<T: Read + Write> {
    session: Session<T>,
    folder: String,
}

impl<T> MessageSource for ImapStore<T>
where
    T: Read + Write + SetReadTimeout + Send,
{
    fn high_water(&mut self) -> Result<Uid, MailError> {
        let mailbox = self.session.status(&self.folder, "(UIDNEXT)")?;
        if let Some(uid_next) = mailbox.uid_next {
            return Ok(uid_next.saturating_sub(1));
        }
        // Server left UIDNEXT out; the highest existing UID is close enough.
        let uids = self.session.uid_search("UID *")?;
        Ok(uids.into_iter().max().unwrap_or(0))
    }

    fn uids_in(&mut self, after: Uid, upto: Uid) -> Result<Vec<Uid>, MailError> {
        if after >= upto {
            return Ok(Vec::new());
        }
        let found: HashSet<Uid> = self.session.uid_search(format!("UID {}:{}", after + 1, upto))?;
        let mut uids: Vec<Uid> = found.into_iter().filter(|uid| *uid > after && *uid <= upto).collect();
        uids.sort_unstable();
        Ok(uids)
    }

    fn fetch(&mut self, uid: Uid) -> Result<Option<Envelope>, MailError> {
        let fetches = self.session.uid_fetch(uid.to_string(), "(UID FLAGS BODY.PEEK[])")?;
        let Some(fetch) = fetches.iter().find(|f| f.uid == Some(uid)) else {
            return Ok(None);
        };
        let Some(body) = fetch.body() else {
            return Ok(None);
        };
        Ok(Some(Envelope {
            uid,
            raw: body.to_vec(),
            deleted: fetch.flags().iter().any(|flag| matches!(flag, Flag::Deleted)),
        }))
    }

    fn remove(&mut self, uid: Uid) -> Result<(), MailError> {
        let set = uid.to_string();
        self.session.uid_store(&set, "+FLAGS.SILENT (\\Deleted)")?;
        self.session.uid_expunge(&set)?;
        Ok(())
    }
}

impl<T> MailStore for ImapStore<T>
where
    T: Read + Write + SetReadTimeout + Send,
{
    fn append(&mut self, folder: &str, raw: &[u8]) -> Result<(), MailError> {
        self.session.append(folder, raw)?;
        Ok(())
    }

    fn ensure_folder(&mut self, folder: &str) -> Result<bool, MailError> {
        let existing = self.session.list(Some(""), Some(folder))?;
        if existing.iter().any(|name| name.name() == folder) {
            return Ok(false);
        }
        self.session.create(folder)?;
        Ok(true)
    }

    fn noop(&mut self) -> Result<(), MailError> {
        self.session.noop()?;
        Ok(())
    }

    fn idle(&mut self, timeout: Duration) -> Result<IdleEvent, MailError> {
        let handle = self.session.idle()?;
        match handle.wait_with_timeout(timeout)? {
            WaitOutcome::MailboxChanged => Ok(IdleEvent::NewMail),
            WaitOutcome::TimedOut => Ok(IdleEvent::TimedOut),
        }
    }

    fn logout(&mut self) {
        if let Err(e) = self.session.logout() {
            debug!("Logout from {} failed: {}", self.folder, e);
        }
    }
}
