//! In-memory mail server used by the unit tests.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::email::{Envelope, MailError, MessageHeaders, Uid};
use crate::store::{Connector, IdleEvent, MailStore, MessageSink, MessageSource};

pub fn message(subject: &str, from: &str) -> Vec<u8> {
    format!(
        "From: {}\r\nTo: me@example.com\r\nSubject: {}\r\nMessage-ID: <{}@test>\r\n\r\nBody of {}\r\n",
        from,
        subject,
        subject.replace(' ', "."),
        subject
    )
    .into_bytes()
}

/// What the server does the next time a client sits in IDLE.
pub enum IdleStep {
    /// A message arrives and the client is told about it.
    Arrive(Vec<u8>),
    /// A message arrives but the notification is lost.
    ArriveUnnoticed(Vec<u8>),
    /// The connection drops.
    Drop,
}

struct ServerState {
    messages: BTreeMap<Uid, Envelope>,
    next_uid: Uid,
    existing_folders: BTreeSet<String>,
    appended: BTreeMap<String, Vec<Vec<u8>>>,
    folder_creations: usize,
    connect_attempts: usize,
    connections: u64,
    dead: HashSet<u64>,
    fail_connects: usize,
    idle_script: VecDeque<IdleStep>,
    append_failures: VecDeque<MailError>,
    noop_failures: usize,
    noops: usize,
    broken: HashSet<Uid>,
    fetch_failures: usize,
    expunged: Vec<Uid>,
}

#[derive(Clone)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn new() -> Self {
        let mut existing_folders = BTreeSet::new();
        existing_folders.insert("INBOX".to_string());
        Self {
            state: Arc::new(Mutex::new(ServerState {
                messages: BTreeMap::new(),
                next_uid: 1,
                existing_folders,
                appended: BTreeMap::new(),
                folder_creations: 0,
                connect_attempts: 0,
                connections: 0,
                dead: HashSet::new(),
                fail_connects: 0,
                idle_script: VecDeque::new(),
                append_failures: VecDeque::new(),
                noop_failures: 0,
                noops: 0,
                broken: HashSet::new(),
                fetch_failures: 0,
                expunged: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector { server: self.clone() }
    }

    pub fn add_message(&self, raw: Vec<u8>) -> Uid {
        self.lock().insert(raw, false)
    }

    pub fn add_deleted_message(&self, raw: Vec<u8>) -> Uid {
        self.lock().insert(raw, true)
    }

    /// Burns a UID without a message, like an expunge would.
    pub fn skip_uid(&self) -> Uid {
        let mut state = self.lock();
        let uid = state.next_uid;
        state.next_uid += 1;
        uid
    }

    pub fn script(&self, steps: Vec<IdleStep>) {
        self.lock().idle_script.extend(steps);
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.lock().fail_connects = count;
    }

    pub fn fail_next_appends(&self, errors: Vec<MailError>) {
        self.lock().append_failures.extend(errors);
    }

    /// Every fetch of `uid` answers with a response the client cannot parse.
    pub fn break_message(&self, uid: Uid) {
        self.lock().broken.insert(uid);
    }

    /// The connection drops during each of the next `count` fetches.
    pub fn fail_next_fetches(&self, count: usize) {
        self.lock().fetch_failures = count;
    }

    pub fn fail_next_noops(&self, count: usize) {
        self.lock().noop_failures = count;
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn connections(&self) -> u64 {
        self.lock().connections
    }

    pub fn noops(&self) -> usize {
        self.lock().noops
    }

    pub fn folder_creations(&self) -> usize {
        self.lock().folder_creations
    }

    pub fn appended(&self, folder: &str) -> Vec<Vec<u8>> {
        self.lock().appended.get(folder).cloned().unwrap_or_default()
    }

    pub fn remaining(&self) -> Vec<Uid> {
        self.lock().messages.keys().copied().collect()
    }

    pub fn expunged(&self) -> Vec<Uid> {
        self.lock().expunged.clone()
    }
}

impl ServerState {
    fn insert(&mut self, raw: Vec<u8>, deleted: bool) -> Uid {
        let uid = self.next_uid;
        self.next_uid += 1;
        self.messages.insert(uid, Envelope { uid, raw, deleted });
        uid
    }
}

pub struct FakeConnector {
    server: FakeServer,
}

impl Connector for FakeConnector {
    fn connect(&self) -> Result<Box<dyn MailStore>, MailError> {
        let mut state = self.server.lock();
        state.connect_attempts += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(MailError::Io(std::io::ErrorKind::ConnectionRefused.into()));
        }
        state.connections += 1;
        Ok(Box::new(FakeStore {
            server: self.server.clone(),
            id: state.connections,
        }))
    }

    fn describe(&self) -> String {
        "fake server".to_string()
    }
}

pub struct FakeStore {
    server: FakeServer,
    id: u64,
}

impl FakeStore {
    fn live(&self) -> Result<MutexGuard<'_, ServerState>, MailError> {
        let state = self.server.lock();
        if state.dead.contains(&self.id) {
            return Err(MailError::Disconnected);
        }
        Ok(state)
    }
}

impl MessageSource for FakeStore {
    fn high_water(&mut self) -> Result<Uid, MailError> {
        Ok(self.live()?.next_uid - 1)
    }

    fn uids_in(&mut self, after: Uid, upto: Uid) -> Result<Vec<Uid>, MailError> {
        if after >= upto {
            return Ok(Vec::new());
        }
        Ok(self.live()?.messages.range(after + 1..=upto).map(|(uid, _)| *uid).collect())
    }

    fn fetch(&mut self, uid: Uid) -> Result<Option<Envelope>, MailError> {
        let id = self.id;
        let mut state = self.live()?;
        if state.fetch_failures > 0 {
            state.fetch_failures -= 1;
            state.dead.insert(id);
            return Err(MailError::Disconnected);
        }
        if state.broken.contains(&uid) {
            return Err(MailError::Parse(format!("unexpected response to UID FETCH {}", uid)));
        }
        Ok(state.messages.get(&uid).cloned())
    }

    fn remove(&mut self, uid: Uid) -> Result<(), MailError> {
        let mut state = self.live()?;
        if state.messages.remove(&uid).is_some() {
            state.expunged.push(uid);
        }
        Ok(())
    }
}

impl MailStore for FakeStore {
    fn append(&mut self, folder: &str, raw: &[u8]) -> Result<(), MailError> {
        let id = self.id;
        let mut state = self.live()?;
        if let Some(err) = state.append_failures.pop_front() {
            if err.is_transient() {
                state.dead.insert(id);
            }
            return Err(err);
        }
        if !state.existing_folders.contains(folder) {
            return Err(MailError::Rejected(format!("[TRYCREATE] no folder {}", folder)));
        }
        state.appended.entry(folder.to_string()).or_default().push(raw.to_vec());
        Ok(())
    }

    fn ensure_folder(&mut self, folder: &str) -> Result<bool, MailError> {
        let mut state = self.live()?;
        if state.existing_folders.insert(folder.to_string()) {
            state.folder_creations += 1;
            return Ok(true);
        }
        Ok(false)
    }

    fn noop(&mut self) -> Result<(), MailError> {
        let id = self.id;
        let mut state = self.live()?;
        state.noops += 1;
        if state.noop_failures > 0 {
            state.noop_failures -= 1;
            state.dead.insert(id);
            return Err(MailError::Disconnected);
        }
        Ok(())
    }

    fn idle(&mut self, timeout: Duration) -> Result<IdleEvent, MailError> {
        {
            let id = self.id;
            let mut state = self.live()?;
            while let Some(step) = state.idle_script.pop_front() {
                match step {
                    IdleStep::Arrive(raw) => {
                        state.insert(raw, false);
                        return Ok(IdleEvent::NewMail);
                    }
                    IdleStep::ArriveUnnoticed(raw) => {
                        state.insert(raw, false);
                    }
                    IdleStep::Drop => {
                        state.dead.insert(id);
                        return Err(MailError::Disconnected);
                    }
                }
            }
        }
        thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(IdleEvent::TimedOut)
    }

    fn logout(&mut self) {
        let id = self.id;
        self.server.lock().dead.insert(id);
    }
}

/// Sink that records what it was given.
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub delivered: Arc<Mutex<Vec<(String, Uid)>>>,
    pub reject: HashSet<Uid>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(uids: &[Uid]) -> Self {
        Self {
            reject: uids.iter().copied().collect(),
            ..Self::default()
        }
    }

    pub fn uids(&self) -> Vec<Uid> {
        self.delivered.lock().unwrap().iter().map(|(_, uid)| *uid).collect()
    }

    pub fn deliveries(&self) -> Vec<(String, Uid)> {
        self.delivered.lock().unwrap().clone()
    }
}

impl MessageSink for RecordingSink {
    fn default_folder(&self) -> &str {
        "INBOX"
    }

    fn connect(&mut self) -> Result<(), MailError> {
        Ok(())
    }

    fn deliver(&mut self, folder: &str, message: &Envelope, _headers: &MessageHeaders) -> Result<(), MailError> {
        if self.reject.contains(&message.uid) {
            return Err(MailError::Rejected("message refused".to_string()));
        }
        self.delivered.lock().unwrap().push((folder.to_string(), message.uid));
        Ok(())
    }
}
