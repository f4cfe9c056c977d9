use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use thiserror::Error;

use crate::autoresponder::AutoResponderSink;
use crate::checkpoint::{CheckpointStore, FileCheckpoint, MemoryCheckpoint};
use crate::config::{Config, ConfigError, LocalEndpoint, Options, RemoteEndpoint, SourceEndpoint, SyncMode, TargetEndpoint};
use crate::credentials::CredentialManager;
use crate::email::MailError;
use crate::filter::FilterRule;
use crate::imap_store::{FolderAccess, ImapConnector};
use crate::local::{LocalSink, LocalSource};
use crate::remote::RemoteSink;
use crate::shutdown::Shutdown;
use crate::store::{connect_with_retry, Connector, MailStore, MessageSink, MessageSource};
use crate::sync::{SyncEngine, SyncReport};
use crate::watch::{WatchSettings, WatchSupervisor};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Mail error: {0}")]
    MailError(#[from] MailError),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Credential error: {0}")]
    CredentialError(#[from] anyhow::Error),
}

pub type AppResult<T> = std::result::Result<T, AppError>;

/// A validated mirror job: where to read, where to write and how.
pub struct App {
    source: SourceEndpoint,
    target: TargetEndpoint,
    rules: Vec<FilterRule>,
    options: Options,
    credentials: CredentialManager,
    shutdown: Shutdown,
}

impl App {
    pub fn new(config: &Config, shutdown: Shutdown) -> AppResult<Self> {
        Ok(Self {
            source: config.source_endpoint()?,
            target: config.target_endpoint()?,
            rules: config.rules()?,
            options: config.options.clone(),
            credentials: CredentialManager::new(),
            shutdown,
        })
    }

    /// Overrides `options.watch`.
    pub fn set_watch(&mut self, watch: bool) {
        self.options.watch = watch;
    }

    pub fn run(&self) -> AppResult<()> {
        let sink = self.build_sink()?;
        let result = match &self.source {
            SourceEndpoint::Remote(endpoint) => self.run_remote(endpoint, sink),
            SourceEndpoint::Local(endpoint) => self.run_local(endpoint, sink).map(|_| ()),
        };

        match result {
            Err(AppError::MailError(MailError::Shutdown)) => {
                info!("Shutting down");
                Ok(())
            }
            other => other,
        }
    }

    fn build_sink(&self) -> AppResult<Box<dyn MessageSink>> {
        Ok(match &self.target {
            TargetEndpoint::Remote(endpoint) => {
                let password = self.credentials.resolve_password(endpoint)?;
                let connector = ImapConnector::new(endpoint.clone(), password, FolderAccess::None);
                Box::new(RemoteSink::new(
                    Arc::new(connector),
                    endpoint.folder.clone(),
                    endpoint.user.clone(),
                    self.options.reconnect_delay(),
                    self.shutdown.clone(),
                )
                .with_rules(self.rules.clone()))
            }
            TargetEndpoint::Local(endpoint) => Box::new(LocalSink::new(endpoint)),
            TargetEndpoint::AutoResponder(config) => Box::new(AutoResponderSink::new(config.clone())?),
        })
    }

    fn engine(&self, checkpoint: Box<dyn CheckpointStore>) -> SyncEngine {
        SyncEngine::new(checkpoint, self.rules.clone(), self.options.move_messages)
    }

    fn run_remote(&self, endpoint: &RemoteEndpoint, mut sink: Box<dyn MessageSink>) -> AppResult<()> {
        let password = self.credentials.resolve_password(endpoint)?;
        let mut checkpoint = FileCheckpoint::new(&endpoint.uidfile);
        checkpoint.reset(self.options.syncmode)?;
        let engine = self.engine(Box::new(checkpoint));

        let access = if self.options.move_messages {
            FolderAccess::ReadWrite
        } else {
            FolderAccess::ReadOnly
        };
        let connector: Arc<dyn Connector> = Arc::new(ImapConnector::new(endpoint.clone(), password, access));

        if self.options.watch {
            let settings = WatchSettings::from(&self.options);
            let mut supervisor = WatchSupervisor::new(connector, engine, sink, settings, self.shutdown.clone());
            supervisor.run()?;
        } else {
            let mut engine = engine;
            sync_once(
                connector.as_ref(),
                &mut engine,
                sink.as_mut(),
                self.options.reconnect_delay(),
                &self.shutdown,
            )?;
        }
        Ok(())
    }

    fn run_local(&self, endpoint: &LocalEndpoint, mut sink: Box<dyn MessageSink>) -> AppResult<SyncReport> {
        if self.options.watch {
            warn!("Watching is not supported for local folders, running a single pass");
        }

        let checkpoint: Box<dyn CheckpointStore> = match &endpoint.uidfile {
            Some(path) => {
                let mut checkpoint = FileCheckpoint::new(path);
                checkpoint.reset(self.options.syncmode)?;
                Box::new(checkpoint)
            }
            None => Box::new(MemoryCheckpoint::new(Some(0))),
        };
        let mut engine = self.engine(checkpoint);

        sink.connect()?;
        let mut source = LocalSource::new(endpoint);
        info!("Reading emails from \"{}\"", source.dir().display());
        let high_water = source.high_water()?;
        Ok(engine.run_incremental(&mut source, sink.as_mut(), high_water)?)
    }
}

/// One catch-up pass against a remote source. Connectivity faults reconnect
/// and resume from the checkpoint.
pub fn sync_once(
    connector: &dyn Connector,
    engine: &mut SyncEngine,
    sink: &mut dyn MessageSink,
    retry_delay: Duration,
    shutdown: &Shutdown,
) -> Result<SyncReport, MailError> {
    sink.connect()?;
    loop {
        let mut store = connect_with_retry(connector, retry_delay, shutdown)?;
        let result = store
            .high_water()
            .and_then(|high_water| engine.run_incremental(store.as_mut(), &mut *sink, high_water));
        store.logout();

        match result {
            Err(e) if e.is_transient() => {
                warn!("Sync from {} interrupted: {}", connector.describe(), e);
                if shutdown.sleep(retry_delay) {
                    return Err(MailError::Shutdown);
                }
            }
            other => return other,
        }
    }
}

/// Applies a sync mode to the source checkpoint without connecting anywhere.
pub fn reset_checkpoint(config: &Config, mode: SyncMode) -> AppResult<()> {
    let uidfile = match config.source_endpoint()? {
        SourceEndpoint::Remote(endpoint) => endpoint.uidfile,
        SourceEndpoint::Local(LocalEndpoint { uidfile: Some(uidfile), .. }) => uidfile,
        SourceEndpoint::Local(_) => {
            warn!("The local source has no uidfile, nothing to reset");
            return Ok(());
        }
    };
    FileCheckpoint::new(&uidfile).reset(mode)?;
    info!("Checkpoint {} reset for sync mode '{}'", uidfile.display(), mode);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::*;
    use crate::testing::{message, FakeServer, RecordingSink};

    fn local_config(dir: &Path, extra_source: &str) -> Config {
        let yaml = format!(
            "source:\n  path: in\n  folder: INBOX\n{}target:\n  path: out\n  folder: Backup\noptions:\n  syncmode: all\nfilter:\n  - folder: Invoices\n    subject: \"Invoice.*\"\n",
            extra_source
        );
        let mut config = Config::from_yaml(&yaml).unwrap();
        config.base_dir = dir.to_path_buf();
        config
    }

    fn write_source(dir: &Path, uid: u32, subject: &str) {
        let inbox = dir.join("in/INBOX");
        fs::create_dir_all(&inbox).unwrap();
        fs::write(inbox.join(format!("{}.eml", uid)), message(subject, "a@x.com")).unwrap();
    }

    #[test]
    fn test_local_mirror_routes_files() {
        let dir = tempfile::tempdir().unwrap();
        write_source(dir.path(), 1, "Hello");
        write_source(dir.path(), 2, "Invoice 42");
        let app = App::new(&local_config(dir.path(), ""), Shutdown::new()).unwrap();

        app.run().unwrap();

        assert!(dir.path().join("out/Backup/1.eml").is_file());
        assert!(dir.path().join("out/Invoices/2.eml").is_file());
    }

    #[test]
    fn test_corrupt_file_does_not_stop_the_pass() {
        let dir = tempfile::tempdir().unwrap();
        write_source(dir.path(), 1, "First");
        fs::write(dir.path().join("in/INBOX/2.eml.gz"), b"not gzip").unwrap();
        write_source(dir.path(), 3, "Third");
        let app = App::new(&local_config(dir.path(), ""), Shutdown::new()).unwrap();

        app.run().unwrap();

        assert!(dir.path().join("out/Backup/1.eml").is_file());
        assert!(!dir.path().join("out/Backup/2.eml").exists());
        assert!(dir.path().join("out/Backup/3.eml").is_file());
    }

    #[test]
    fn test_local_source_with_uidfile_resumes() {
        let dir = tempfile::tempdir().unwrap();
        write_source(dir.path(), 1, "First");
        let mut config = local_config(dir.path(), "  uidfile: state/uid.txt\n");
        config.options.syncmode = SyncMode::SinceLastSync;
        fs::create_dir_all(dir.path().join("state")).unwrap();
        fs::write(dir.path().join("state/uid.txt"), "1").unwrap();
        write_source(dir.path(), 2, "Second");

        App::new(&config, Shutdown::new()).unwrap().run().unwrap();

        assert!(!dir.path().join("out/Backup/1.eml").exists());
        assert!(dir.path().join("out/Backup/2.eml").is_file());
        assert_eq!(fs::read_to_string(dir.path().join("state/uid.txt")).unwrap(), "2");
    }

    #[test]
    fn test_sync_once_resumes_after_connection_loss() {
        let server = FakeServer::new();
        for subject in ["One", "Two", "Three"] {
            server.add_message(message(subject, "a@x.com"));
        }
        server.fail_next_connects(2);
        let mut engine = SyncEngine::new(Box::new(MemoryCheckpoint::new(Some(0))), Vec::new(), false);
        let mut sink = RecordingSink::new();

        let report = sync_once(
            &server.connector(),
            &mut engine,
            &mut sink,
            Duration::from_millis(1),
            &Shutdown::new(),
        )
        .unwrap();

        assert_eq!(report.delivered, 3);
        assert_eq!(sink.uids(), vec![1, 2, 3]);
        assert_eq!(server.connect_attempts(), 3);
    }

    #[test]
    fn test_sync_once_skips_unreadable_message() {
        let server = FakeServer::new();
        for subject in ["One", "Two", "Three"] {
            server.add_message(message(subject, "a@x.com"));
        }
        server.break_message(2);
        let mut engine = SyncEngine::new(Box::new(MemoryCheckpoint::new(Some(0))), Vec::new(), false);
        let mut sink = RecordingSink::new();

        let report = sync_once(
            &server.connector(),
            &mut engine,
            &mut sink,
            Duration::from_secs(5),
            &Shutdown::new(),
        )
        .unwrap();

        assert_eq!(sink.uids(), vec![1, 3]);
        assert_eq!(report.failed, 1);
        assert_eq!(server.connect_attempts(), 1);
    }

    #[test]
    fn test_reset_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path(), "  uidfile: uid.txt\n");
        fs::write(dir.path().join("uid.txt"), "17").unwrap();

        reset_checkpoint(&config, SyncMode::All).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("uid.txt")).unwrap(), "0");

        reset_checkpoint(&config, SyncMode::New).unwrap();
        assert!(!dir.path().join("uid.txt").exists());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = Config::from_yaml("source:\n  server: imap.example.com\n  folder: INBOX\ntarget:\n  path: out\n  folder: INBOX\n").unwrap();

        assert!(matches!(
            App::new(&config, Shutdown::new()),
            Err(AppError::ConfigError(ConfigError::MissingField { field: "user", .. }))
        ));
    }
}
