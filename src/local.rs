//! Message files on disk: one `<uid>.eml` or `<uid>.eml.gz` per message.

use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, info};

use crate::config::LocalEndpoint;
use crate::email::{Envelope, MailError, MessageHeaders, Uid};
use crate::store::{MessageSink, MessageSource};

const PLAIN_EXT: &str = ".eml";
const GZIP_EXT: &str = ".eml.gz";

/// Parses the identifier out of a message file name.
fn uid_from_file_name(name: &str) -> Option<Uid> {
    let stem = name
        .strip_suffix(GZIP_EXT)
        .or_else(|| name.strip_suffix(PLAIN_EXT))?;
    stem.parse().ok()
}

/// Reads messages from `<path>/<folder>`. Cannot be watched.
pub struct LocalSource {
    dir: PathBuf,
}

impl LocalSource {
    pub fn new(endpoint: &LocalEndpoint) -> Self {
        Self {
            dir: endpoint.path.join(&endpoint.folder),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn list(&self) -> Result<Vec<Uid>, MailError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut uids = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            match name.to_str().and_then(uid_from_file_name) {
                Some(uid) => uids.push(uid),
                None => debug!("Ignoring {}", entry.path().display()),
            }
        }
        uids.sort_unstable();
        uids.dedup();
        Ok(uids)
    }

    fn file_for(&self, uid: Uid) -> Option<PathBuf> {
        [PLAIN_EXT, GZIP_EXT]
            .iter()
            .map(|ext| self.dir.join(format!("{}{}", uid, ext)))
            .find(|path| path.is_file())
    }
}

impl MessageSource for LocalSource {
    fn high_water(&mut self) -> Result<Uid, MailError> {
        Ok(self.list()?.last().copied().unwrap_or(0))
    }

    fn uids_in(&mut self, after: Uid, upto: Uid) -> Result<Vec<Uid>, MailError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|uid| *uid > after && *uid <= upto)
            .collect())
    }

    fn fetch(&mut self, uid: Uid) -> Result<Option<Envelope>, MailError> {
        let Some(path) = self.file_for(uid) else {
            return Ok(None);
        };
        info!("Reading file {}", path.display());
        // A file that cannot be read or decompressed is a fault of that one
        // message, not of the source.
        let raw = read_message_file(&path).map_err(|e| MailError::Parse(format!("{}: {}", path.display(), e)))?;
        Ok(Some(Envelope::new(uid, raw)))
    }

    fn remove(&mut self, uid: Uid) -> Result<(), MailError> {
        if let Some(path) = self.file_for(uid) {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

/// Reads a message file, decompressing `.gz` files.
pub fn read_message_file(path: &Path) -> Result<Vec<u8>, MailError> {
    let bytes = fs::read(path)?;
    if path.extension().map_or(false, |ext| ext == "gz") {
        let mut raw = Vec::new();
        GzDecoder::new(bytes.as_slice()).read_to_end(&mut raw)?;
        Ok(raw)
    } else {
        Ok(bytes)
    }
}

/// Writes messages below `<path>/<folder>`, one file per UID.
pub struct LocalSink {
    root: PathBuf,
    folder: String,
    compress: bool,
}

impl LocalSink {
    pub fn new(endpoint: &LocalEndpoint) -> Self {
        Self {
            root: endpoint.path.clone(),
            folder: endpoint.folder.clone(),
            compress: endpoint.compress,
        }
    }

    /// Writes through a temporary name so a redelivered UID replaces the old
    /// file in one step.
    fn write_file(&self, path: &Path, raw: &[u8]) -> Result<(), MailError> {
        let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
        temp_name.push(".part");
        let temp = path.with_file_name(temp_name);

        let file = fs::File::create(&temp)?;
        if self.compress {
            let mut encoder = GzEncoder::new(file, Compression::default());
            encoder.write_all(raw)?;
            encoder.finish()?.sync_all()?;
        } else {
            let mut file = file;
            file.write_all(raw)?;
            file.sync_all()?;
        }
        fs::rename(&temp, path)?;
        Ok(())
    }
}

impl MessageSink for LocalSink {
    fn default_folder(&self) -> &str {
        &self.folder
    }

    fn connect(&mut self) -> Result<(), MailError> {
        fs::create_dir_all(&self.root)?;
        info!("Writing emails into folder \"{}\"", self.root.join(&self.folder).display());
        Ok(())
    }

    fn deliver(&mut self, folder: &str, message: &Envelope, headers: &MessageHeaders) -> Result<(), MailError> {
        let dir = self.root.join(folder);
        fs::create_dir_all(&dir)?;

        let ext = if self.compress { GZIP_EXT } else { PLAIN_EXT };
        let path = dir.join(format!("{}{}", message.uid, ext));
        self.write_file(&path, &message.raw)?;

        info!("Writing \"{}\" into file \"{}\"", headers.subject, path.display());
        Ok(())
    }
}
