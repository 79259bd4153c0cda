//! Notifications published by an archive.

use crate::error::ArchiveError;
use crate::format::point::PointRecord;
use crate::format::{HistorianId, TimeTag};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::path::PathBuf;
use tracing::debug;

/// Something the host may want to know about.
///
/// Events are delivered over a bounded channel. When the host stops
/// draining it, new events are dropped.
#[derive(Debug, Clone)]
pub enum ArchiveEvent {
    /// No block could be allocated in the active file.
    FileFull {
        /// Path of the full file.
        path: PathBuf,
    },
    /// A rollover closed the write gate.
    RolloverStarted,
    /// A rollover retired the active file.
    RolloverCompleted {
        /// New path of the retired file.
        historic_path: PathBuf,
        /// End of the retired file and start of the new active file.
        boundary: TimeTag,
    },
    /// A rollover failed; writers stay blocked until `rollover` succeeds.
    RolloverFailed {
        /// Description of the failure.
        error: String,
    },
    /// Standby preparation began.
    RolloverPreparationStarted,
    /// A standby file is ready.
    RolloverPreparationCompleted {
        /// Path of the standby file.
        path: PathBuf,
    },
    /// Standby preparation failed.
    RolloverPreparationFailed {
        /// Description of the failure.
        error: String,
    },
    /// An offload pass began.
    OffloadStarted {
        /// Files selected for offload.
        total: usize,
    },
    /// One file was processed by an offload pass.
    OffloadProgress {
        /// Files processed so far.
        completed: usize,
        /// Files selected for offload.
        total: usize,
    },
    /// An offload pass finished.
    OffloadCompleted {
        /// Files moved or deleted.
        completed: usize,
    },
    /// A file could not be offloaded.
    OffloadFailed {
        /// File that stayed in place.
        path: PathBuf,
        /// Description of the failure.
        error: String,
    },
    /// The historic file index build began.
    HistoricFileListBuildStarted,
    /// The historic file index is ready.
    HistoricFileListBuildCompleted {
        /// Number of historic files found.
        count: usize,
    },
    /// The historic file index build failed.
    HistoricFileListBuildFailed {
        /// Description of the failure.
        error: String,
    },
    /// The historic file index changed after it was built.
    HistoricFileListUpdated,
    /// A sample arrived for a missing or disabled series.
    OrphanData(PointRecord),
    /// A sample was timestamped beyond the lead time tolerance.
    FutureData(PointRecord),
    /// An archived sample predates the active file and went to the
    /// historic writer.
    HistoricData(PointRecord),
    /// A sample was not newer than the last received sample.
    OutOfSequenceData {
        /// The sample.
        point: PointRecord,
        /// True if it was discarded rather than queued.
        discarded: bool,
    },
    /// A read across a file failed; the remaining files are still read.
    DataReadFailed {
        /// File that failed.
        path: PathBuf,
        /// Description of the failure.
        error: String,
    },
    /// Historic samples could not be written.
    DataWriteFailed {
        /// Number of samples lost.
        points: usize,
        /// Description of the failure.
        error: String,
    },
    /// An alarm quality persisted past its delay.
    AlarmNotification(PointRecord),
    /// A metadata record was written through the archive.
    MetadataUpdated {
        /// Series whose record changed.
        historian_id: HistorianId,
    },
}

/// Publishing side of the event channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: Sender<ArchiveEvent>,
}

impl EventSink {
    /// Creates a bounded channel holding `capacity` events.
    pub fn bounded(capacity: usize) -> (Self, Receiver<ArchiveEvent>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        (Self { sender }, receiver)
    }

    /// Publishes `event` without blocking.
    pub fn publish(&self, event: ArchiveEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!("Event channel full, dropping {:?}", event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Publishes a failure event built from `err`.
    pub fn publish_error(&self, err: &ArchiveError, make: impl FnOnce(String) -> ArchiveEvent) {
        self.publish(make(err.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_channel_drops_events() {
        let (sink, events) = EventSink::bounded(2);
        sink.publish(ArchiveEvent::RolloverStarted);
        sink.publish(ArchiveEvent::HistoricFileListUpdated);
        sink.publish(ArchiveEvent::RolloverPreparationStarted);

        assert!(matches!(events.try_recv(), Ok(ArchiveEvent::RolloverStarted)));
        assert!(matches!(
            events.try_recv(),
            Ok(ArchiveEvent::HistoricFileListUpdated)
        ));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_publish_after_receiver_dropped() {
        let (sink, events) = EventSink::bounded(1);
        drop(events);
        sink.publish_error(&ArchiveError::NotOpen, |error| {
            ArchiveEvent::RolloverFailed { error }
        });
    }
}
