//! Live mirroring of a remote folder: an IDLE listener that syncs whenever
//! the server reports a change, and a keep-alive monitor that pings the
//! connection and retires it when it gets too old.
//!
//! Only the listener replaces the connection. The monitor asks for a
//! reconnect by sending the epoch it observed; requests for an epoch that has
//! already been replaced are dropped.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::config::Options;
use crate::email::MailError;
use crate::shutdown::Shutdown;
use crate::store::{connect_with_retry, Connector, IdleEvent, MailStore, MessageSink, MessageSource};
use crate::sync::{SyncEngine, SyncReport};

/// How often the listener wakes while waiting for the monitor to finish a
/// probe.
const PROBE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub keepalive: Duration,
    pub max_connection_age: Duration,
    pub reconnect_delay: Duration,
    /// Longest single IDLE wait before the listener checks for requests.
    pub idle_timeout: Duration,
}

impl From<&Options> for WatchSettings {
    fn from(options: &Options) -> Self {
        Self {
            keepalive: options.keepalive(),
            max_connection_age: options.max_connection_age(),
            reconnect_delay: options.reconnect_delay(),
            idle_timeout: options.idle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Listening,
    Reconnecting,
    Stopped,
}

struct ReconnectRequest {
    epoch: u64,
    reason: String,
}

struct Connection {
    /// Number of times the connection has been replaced.
    epoch: u64,
    store: Option<Box<dyn MailStore>>,
    opened_at: Instant,
}

/// State shared between the listener and the keep-alive monitor.
struct Link {
    connection: Mutex<Connection>,
    probe_pending: Mutex<bool>,
    probe_done: Condvar,
    state: Mutex<WatchState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Link {
    fn new() -> Self {
        Self {
            connection: Mutex::new(Connection {
                epoch: 0,
                store: None,
                opened_at: Instant::now(),
            }),
            probe_pending: Mutex::new(false),
            probe_done: Condvar::new(),
            state: Mutex::new(WatchState::Idle),
        }
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        lock(&self.connection)
    }

    fn set_state(&self, state: WatchState) {
        *lock(&self.state) = state;
    }

    /// Runs `check` on the connection, holding the listener off until it is
    /// done.
    fn probe<R>(&self, check: impl FnOnce(&mut Connection) -> R) -> R {
        *lock(&self.probe_pending) = true;
        let result = {
            let mut connection = self.connection();
            check(&mut connection)
        };
        *lock(&self.probe_pending) = false;
        self.probe_done.notify_all();
        result
    }

    fn wait_for_probe(&self, shutdown: &Shutdown) {
        let mut pending = lock(&self.probe_pending);
        while *pending && !shutdown.is_triggered() {
            pending = match self.probe_done.wait_timeout(pending, PROBE_POLL) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

/// Keeps a source folder mirrored until shutdown.
pub struct WatchSupervisor {
    connector: Arc<dyn Connector>,
    link: Arc<Link>,
    engine: SyncEngine,
    sink: Box<dyn MessageSink>,
    settings: WatchSettings,
    shutdown: Shutdown,
}

impl WatchSupervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        engine: SyncEngine,
        sink: Box<dyn MessageSink>,
        settings: WatchSettings,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            connector,
            link: Arc::new(Link::new()),
            engine,
            sink,
            settings,
            shutdown,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.link.connection().epoch
    }

    pub fn state(&self) -> WatchState {
        *lock(&self.link.state)
    }

    /// Connects, catches up and then follows the folder until shutdown.
    /// Returns `Ok` when stopped by shutdown.
    pub fn run(&mut self) -> Result<(), MailError> {
        let result = self.start().and_then(|_| self.watch());

        self.link.set_state(WatchState::Stopped);
        if let Some(mut store) = self.link.connection().store.take() {
            store.logout();
        }
        info!("Stopped watching {}", self.connector.describe());

        match result {
            Err(MailError::Shutdown) => Ok(()),
            other => other,
        }
    }

    fn start(&mut self) -> Result<(), MailError> {
        self.sink.connect()?;
        let store = connect_with_retry(self.connector.as_ref(), self.settings.reconnect_delay, &self.shutdown)?;
        {
            let mut connection = self.link.connection();
            connection.store = Some(store);
            connection.opened_at = Instant::now();
        }
        self.catch_up()
    }

    fn watch(&mut self) -> Result<(), MailError> {
        let (requests_tx, requests) = mpsc::channel();
        let stop = Shutdown::new();
        let monitor = {
            let link = Arc::clone(&self.link);
            let settings = self.settings.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("keepalive".to_string())
                .spawn(move || keep_alive(&link, &settings, &stop, &requests_tx))?
        };

        self.link.set_state(WatchState::Listening);
        info!("Watching {} for new messages", self.connector.describe());
        let result = self.listen(&requests);

        stop.trigger();
        if monitor.join().is_err() {
            error!("Keep-alive monitor panicked");
        }
        result
    }

    fn listen(&mut self, requests: &Receiver<ReconnectRequest>) -> Result<(), MailError> {
        loop {
            if self.shutdown.is_triggered() {
                return Err(MailError::Shutdown);
            }
            self.link.wait_for_probe(&self.shutdown);

            while let Ok(request) = requests.try_recv() {
                self.recover(request.epoch, request.reason)?;
            }

            let (epoch, outcome) = {
                let mut connection = self.link.connection();
                let epoch = connection.epoch;
                let outcome = match connection.store.as_mut() {
                    Some(store) => store.idle(self.settings.idle_timeout),
                    None => Err(MailError::Disconnected),
                };
                (epoch, outcome)
            };

            match outcome {
                Ok(IdleEvent::TimedOut) => {}
                Ok(IdleEvent::NewMail) => {
                    debug!("Server reported a change");
                    self.catch_up()?;
                }
                Err(e) => {
                    warn!("Listening on {} failed: {}", self.connector.describe(), e);
                    self.recover(epoch, e.to_string())?;
                }
            }
        }
    }

    /// Runs the sync engine on the current connection.
    fn sync(&mut self) -> Result<SyncReport, MailError> {
        let mut connection = self.link.connection();
        let store = connection.store.as_mut().ok_or(MailError::Disconnected)?;
        let high_water = store.high_water()?;
        self.engine.run_incremental(store.as_mut(), self.sink.as_mut(), high_water)
    }

    fn catch_up(&mut self) -> Result<(), MailError> {
        let epoch = self.epoch();
        match self.sync() {
            Ok(report) => {
                log_report(&report);
                Ok(())
            }
            Err(e) if e.is_transient() => self.recover(epoch, e.to_string()),
            Err(e) => sync_failed(e),
        }
    }

    /// Replaces the connection observed at `epoch` and replays the sync,
    /// repeating every `reconnect_delay` until a replay succeeds.
    fn recover(&mut self, epoch: u64, reason: String) -> Result<(), MailError> {
        let mut epoch = epoch;
        let mut reason = reason;
        loop {
            if !self.reconnect(epoch, &reason)? {
                return Ok(());
            }
            match self.sync() {
                Ok(report) => {
                    log_report(&report);
                    self.link.set_state(WatchState::Listening);
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "Replaying sync failed: {}, retrying in {}s",
                        e,
                        self.settings.reconnect_delay.as_secs()
                    );
                    if self.shutdown.sleep(self.settings.reconnect_delay) {
                        return Err(MailError::Shutdown);
                    }
                    epoch = self.epoch();
                    reason = e.to_string();
                }
                Err(e) => {
                    self.link.set_state(WatchState::Listening);
                    return sync_failed(e);
                }
            }
        }
    }

    /// Returns `false` without doing anything when the connection seen at
    /// `observed` has already been replaced.
    fn reconnect(&mut self, observed: u64, reason: &str) -> Result<bool, MailError> {
        let mut connection = self.link.connection();
        if connection.epoch != observed {
            debug!(
                "Ignoring reconnect request for epoch {} (now {}): {}",
                observed, connection.epoch, reason
            );
            return Ok(false);
        }

        self.link.set_state(WatchState::Reconnecting);
        warn!("Reconnecting to {}: {}", self.connector.describe(), reason);
        if let Some(mut old) = connection.store.take() {
            old.logout();
        }

        let store = connect_with_retry(self.connector.as_ref(), self.settings.reconnect_delay, &self.shutdown)?;
        connection.store = Some(store);
        connection.epoch += 1;
        connection.opened_at = Instant::now();
        info!("Reconnected to {} (epoch {})", self.connector.describe(), connection.epoch);
        Ok(true)
    }
}

fn log_report(report: &SyncReport) {
    if report.delivered + report.failed + report.removed > 0 {
        info!(
            "Sync done: {} delivered, {} skipped, {} failed, {} removed, checkpoint {}",
            report.delivered, report.skipped, report.failed, report.removed, report.checkpoint
        );
    } else {
        debug!("Sync done: nothing new, checkpoint {}", report.checkpoint);
    }
}

/// Non-connectivity sync errors leave the checkpoint where it was; the next
/// notification retries.
fn sync_failed(e: MailError) -> Result<(), MailError> {
    match e {
        MailError::Shutdown => Err(MailError::Shutdown),
        e => {
            error!("Sync failed: {}", e);
            Ok(())
        }
    }
}

fn keep_alive(link: &Link, settings: &WatchSettings, stop: &Shutdown, requests: &Sender<ReconnectRequest>) {
    while !stop.sleep(settings.keepalive) {
        // Sent while the probe is still pending so the listener sees the
        // request before it idles again.
        let delivered = link.probe(|connection| {
            check_connection(connection, settings.max_connection_age).map(|request| requests.send(request).is_ok())
        });
        if delivered == Some(false) {
            break;
        }
    }
    debug!("Keep-alive monitor stopped");
}

fn check_connection(connection: &mut Connection, max_age: Duration) -> Option<ReconnectRequest> {
    let epoch = connection.epoch;
    let age = connection.opened_at.elapsed();
    let store = connection.store.as_mut()?;

    if age > max_age {
        info!("Connection is {}s old, replacing it", age.as_secs());
        return Some(ReconnectRequest {
            epoch,
            reason: format!("connection older than {}s", max_age.as_secs()),
        });
    }

    match store.noop() {
        Ok(()) => {
            debug!("Keep-alive NOOP ok");
            None
        }
        Err(e) => {
            warn!("Keep-alive NOOP failed: {}", e);
            Some(ReconnectRequest {
                epoch,
                reason: e.to_string(),
            })
        }
    }
}
