use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::config::SyncMode;
use crate::email::{MailError, Uid};

/// Persisted "highest identifier fully processed" of one source mailbox.
pub trait CheckpointStore: Send {
    fn read(&self) -> Result<Option<Uid>, MailError>;

    fn write(&mut self, uid: Uid) -> Result<(), MailError>;

    /// Prepares the store for a run in the given mode.
    fn reset(&mut self, mode: SyncMode) -> Result<(), MailError>;
}

/// A checkpoint kept as a single decimal number in a text file.
#[derive(Debug, Clone)]
pub struct FileCheckpoint {
    path: PathBuf,
}

impl FileCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl CheckpointStore for FileCheckpoint {
    fn read(&self) -> Result<Option<Uid>, MailError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        content.trim().parse::<Uid>().map(Some).map_err(|e| {
            MailError::Parse(format!("invalid checkpoint in {}: {}", self.path.display(), e))
        })
    }

    fn write(&mut self, uid: Uid) -> Result<(), MailError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        // Replace atomically so a crash never leaves a truncated value behind.
        let temp = self.temp_path();
        let mut file = fs::File::create(&temp)?;
        write!(file, "{}", uid)?;
        file.sync_all()?;
        fs::rename(&temp, &self.path)?;

        debug!("Checkpoint {} advanced to UID {}", self.path.display(), uid);
        Ok(())
    }

    fn reset(&mut self, mode: SyncMode) -> Result<(), MailError> {
        match mode {
            SyncMode::SinceLastSync => Ok(()),
            SyncMode::New => {
                info!("Sync mode 'new': discarding checkpoint {}", self.path.display());
                match fs::remove_file(&self.path) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            SyncMode::All => {
                info!("Sync mode 'all': resetting checkpoint {} to 0", self.path.display());
                self.write(0)
            }
        }
    }
}

/// A checkpoint that lives only as long as the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpoint {
    value: Option<Uid>,
}

impl MemoryCheckpoint {
    pub fn new(value: Option<Uid>) -> Self {
        Self { value }
    }
}

impl CheckpointStore for MemoryCheckpoint {
    fn read(&self) -> Result<Option<Uid>, MailError> {
        Ok(self.value)
    }

    fn write(&mut self, uid: Uid) -> Result<(), MailError> {
        self.value = Some(uid);
        Ok(())
    }

    fn reset(&mut self, mode: SyncMode) -> Result<(), MailError> {
        match mode {
            SyncMode::SinceLastSync => {}
            SyncMode::New => self.value = None,
            SyncMode::All => self.value = Some(0),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> FileCheckpoint {
        FileCheckpoint::new(dir.path().join("imap_uid.txt"))
    }

    #[test]
    fn test_missing_file_reads_as_uninitialized() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(store_in(&dir).read().unwrap(), None);
    }

    #[test]
    fn test_write_overwrites_single_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);

        store.write(41).unwrap();
        store.write(42).unwrap();

        assert_eq!(store.read().unwrap(), Some(42));
        assert_eq!(fs::read_to_string(store.path()).unwrap(), "42");
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_reads_value_with_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "17\n").unwrap();

        assert_eq!(store.read().unwrap(), Some(17));
    }

    #[test]
    fn test_garbage_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "seventeen").unwrap();

        assert!(matches!(store.read(), Err(MailError::Parse(_))));
    }

    #[test]
    fn test_reset_modes() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.write(99).unwrap();

        store.reset(SyncMode::SinceLastSync).unwrap();
        assert_eq!(store.read().unwrap(), Some(99));

        store.reset(SyncMode::All).unwrap();
        assert_eq!(store.read().unwrap(), Some(0));

        store.reset(SyncMode::New).unwrap();
        assert_eq!(store.read().unwrap(), None);

        // Resetting an absent checkpoint to "new" is fine too.
        store.reset(SyncMode::New).unwrap();
        assert_eq!(store.read().unwrap(), None);
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileCheckpoint::new(dir.path().join("state/deep/uid.txt"));
        store.write(3).unwrap();
        assert_eq!(store.read().unwrap(), Some(3));
    }

    #[test]
    fn test_memory_checkpoint_reset() {
        let mut store = MemoryCheckpoint::new(Some(5));
        store.reset(SyncMode::All).unwrap();
        assert_eq!(store.read().unwrap(), Some(0));
        store.reset(SyncMode::New).unwrap();
        assert_eq!(store.read().unwrap(), None);
    }
}
