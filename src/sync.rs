use log::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::email::{MailError, Uid};
use crate::filter::{resolve_folder, FilterRule};
use crate::store::{MessageSink, MessageSource};

/// Counters for one incremental run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub delivered: usize,
    pub skipped: usize,
    pub failed: usize,
    pub removed: usize,
    /// Checkpoint value when the run finished.
    pub checkpoint: Uid,
}

impl SyncReport {
    fn starting_at(checkpoint: Uid) -> Self {
        Self { checkpoint, ..Self::default() }
    }
}

/// Copies everything above the checkpoint from a source to a sink, one
/// identifier at a time and in ascending order.
pub struct SyncEngine {
    checkpoint: Box<dyn CheckpointStore>,
    rules: Vec<FilterRule>,
    remove_source: bool,
}

impl SyncEngine {
    pub fn new(checkpoint: Box<dyn CheckpointStore>, rules: Vec<FilterRule>, remove_source: bool) -> Self {
        Self {
            checkpoint,
            rules,
            remove_source,
        }
    }

    pub fn checkpoint(&self) -> Result<Option<Uid>, MailError> {
        self.checkpoint.read()
    }

    /// Delivers every message in `(checkpoint, high_water]`.
    ///
    /// Without a stored checkpoint nothing is delivered; the checkpoint is
    /// seeded with `high_water` so only later arrivals are mirrored.
    ///
    /// A message the sink refuses, or one the source cannot read, is logged
    /// and skipped. Transient source faults abort the run before the checkpoint passes the failing
    /// identifier, so a replay after reconnecting picks up where this left
    /// off.
    pub fn run_incremental<S>(
        &mut self,
        source: &mut S,
        sink: &mut dyn MessageSink,
        high_water: Uid,
    ) -> Result<SyncReport, MailError>
    where
        S: MessageSource + ?Sized,
    {
        let last = match self.checkpoint.read()? {
            Some(last) => last,
            None => {
                info!("No checkpoint yet, mirroring messages after UID {}", high_water);
                self.checkpoint.write(high_water)?;
                return Ok(SyncReport::starting_at(high_water));
            }
        };

        let mut report = SyncReport::starting_at(last);
        if high_water <= last {
            debug!("Nothing to sync (checkpoint {}, high water {})", last, high_water);
            return Ok(report);
        }

        let uids = source.uids_in(last, high_water)?;
        info!("Syncing {} message(s) in UID range {}:{}", uids.len(), last + 1, high_water);

        for uid in uids {
            if uid <= report.checkpoint || uid > high_water {
                continue;
            }
            self.process(source, sink, uid, &mut report)?;
            self.advance(uid, &mut report)?;
        }

        if report.checkpoint < high_water {
            self.advance(high_water, &mut report)?;
        }

        info!(
            "Sync finished at UID {}: {} delivered, {} skipped, {} failed",
            report.checkpoint, report.delivered, report.skipped, report.failed
        );
        Ok(report)
    }

    fn process<S>(
        &mut self,
        source: &mut S,
        sink: &mut dyn MessageSink,
        uid: Uid,
        report: &mut SyncReport,
    ) -> Result<(), MailError>
    where
        S: MessageSource + ?Sized,
    {
        let envelope = match source.fetch(uid) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                debug!("UID {} disappeared before it could be fetched", uid);
                report.skipped += 1;
                return Ok(());
            }
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                warn!("Skipping UID {}: {}", uid, e);
                report.failed += 1;
                return Ok(());
            }
        };

        if envelope.deleted {
            debug!("UID {} is flagged deleted, skipping", uid);
            report.skipped += 1;
            return Ok(());
        }

        let headers = envelope.headers();
        let folder = resolve_folder(sink.default_folder(), &self.rules, &headers).to_string();

        match sink.deliver(&folder, &envelope, &headers) {
            Ok(()) => report.delivered += 1,
            Err(MailError::Shutdown) => return Err(MailError::Shutdown),
            Err(e) => {
                error!("Failed to copy UID {} (\"{}\") into \"{}\": {}", uid, headers.subject, folder, e);
                report.failed += 1;
                return Ok(());
            }
        }

        if self.remove_source {
            info!("Deleting message \"{}\" from source", headers.subject);
            match source.remove(uid) {
                Ok(()) => report.removed += 1,
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => warn!("Could not delete UID {} from source: {}", uid, e),
            }
        }

        Ok(())
    }

    fn advance(&mut self, uid: Uid, report: &mut SyncReport) -> Result<(), MailError> {
        self.checkpoint.write(uid)?;
        report.checkpoint = uid;
        Ok(())
    }
}
