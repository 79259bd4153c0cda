//! The archive orchestrator.
//!
//! An [`ArchiveFile`] owns the active archive file and routes every sample
//! through compression into a per-series data block:
//!
//! ```text
//!  write(point)
//!      │
//!      ▼
//!  ┌────────────┐  orphan / future   ┌────────────────┐
//!  │  validate  │───────────────────▶│  ArchiveEvent  │
//!  └─────┬──────┘                    └────────────────┘
//!        ▼                                   ▲
//!  ┌────────────┐  duplicate / out-of-sequence
//!  │  sequence  │────────────────────────────┘
//!  └─────┬──────┘
//!        ▼
//!  ┌────────────┐  t < file start   ┌──────────────────┐
//!  │  compress  │──────────────────▶│ historic writer  │
//!  └─────┬──────┘                   └──────────────────┘
//!        ▼
//!  ┌────────────┐  file full        ┌──────────────────┐
//!  │   append   │──────────────────▶│     rollover     │
//!  └────────────┘                   └──────────────────┘
//! ```
//!
//! Rollover retires the active file under a historic name and promotes the
//! standby file. Readers merge historic files and the active file in time
//! order.

pub mod config;
pub mod events;
pub mod gate;
pub mod reader;
mod rollover;
pub mod stats;
mod workers;

pub use config::ArchiveConfig;
pub use events::{ArchiveEvent, EventSink};
pub use gate::RolloverGate;
pub use reader::ArchiveReader;
pub use stats::ArchiveStatistics;

use crate::compression::state::{CompressionState, Sequence};
use crate::compression::{classify_quality, CompressionEngine};
use crate::error::{ArchiveError, Result};
use crate::format::handle::ArchiveFileHandle;
use crate::format::point::PointRecord;
use crate::format::{DataBlock, HistorianId, Quality, TimeTag};
use crate::lifecycle::historic::{HistoricFileInfo, HistoricIndex};
use crate::lifecycle::naming::ArchiveLayout;
use crate::store::{CoordinationStore, MetadataRecord, MetadataStore, StateStore};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use stats::WriteSpeedMeter;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// What happened to a written sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A sample was archived: the given one, or the one received before it.
    Archived,
    /// Compression kept nothing.
    Compressed,
    /// Identical to the last received sample and dropped.
    Duplicate,
    /// Older than the last received sample and queued.
    OutOfSequenceQueued,
    /// Older than the last received sample and dropped.
    OutOfSequenceDiscarded,
    /// The series is unknown or disabled.
    Orphan,
    /// Timestamped too far in the future.
    FutureData,
    /// The archived sample predates the active file and was handed to the
    /// historic writer.
    Historic,
}

/// State guarded by the write lock.
#[derive(Debug)]
pub(crate) struct WriteContext {
    blocks: HashMap<HistorianId, DataBlock>,
    engine: CompressionEngine,
    /// Historic path and boundary of a rollover whose retire step finished
    /// but whose new active file could not be opened.
    retired: Option<(PathBuf, TimeTag)>,
}

pub(crate) struct ArchiveInner {
    config: ArchiveConfig,
    layout: ArchiveLayout,
    metadata: Arc<dyn MetadataStore>,
    states: Arc<dyn StateStore>,
    coordination: Arc<dyn CoordinationStore>,
    active: RwLock<Option<Arc<ArchiveFileHandle>>>,
    generation: AtomicU64,
    writer: Mutex<WriteContext>,
    gate: RolloverGate,
    historic: HistoricIndex,
    events: EventSink,
    event_receiver: Receiver<ArchiveEvent>,
    speed: WriteSpeedMeter,
    preparing: AtomicBool,
    historic_sender: Mutex<Option<Sender<PointRecord>>>,
    shutdown_sender: Mutex<Option<Sender<()>>>,
    out_of_sequence: Mutex<Vec<PointRecord>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// A rolling archive of time series samples.
///
/// All methods take `&self`; share the archive between threads with an
/// `Arc`.
///
/// # Example
///
/// ```rust,ignore
/// use alopex_archive::{ArchiveConfig, ArchiveFile, PointRecord, Quality, TimeTag};
/// use alopex_archive::store::{InMemoryCoordinationStore, InMemoryMetadataStore, InMemoryStateStore, MetadataRecord};
/// use std::sync::Arc;
///
/// let archive = ArchiveFile::new(
///     ArchiveConfig::new("/data/plant.d"),
///     Arc::new(InMemoryMetadataStore::with_records([MetadataRecord::new(1, "flow")])),
///     Arc::new(InMemoryStateStore::new()),
///     Arc::new(InMemoryCoordinationStore::new()),
/// )?;
/// archive.open()?;
/// archive.write(PointRecord::new(1, TimeTag::now(), 4.2, Quality::NotSet))?;
/// for point in archive.read(1, TimeTag::MIN, TimeTag::MAX)? {
///     println!("{} {}", point.time, point.value);
/// }
/// archive.close()?;
/// ```
pub struct ArchiveFile {
    inner: Arc<ArchiveInner>,
}

impl std::fmt::Debug for ArchiveFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveFile")
            .field("path", &self.inner.layout.active_path())
            .field("open", &self.is_open())
            .finish()
    }
}

impl ArchiveFile {
    /// Creates a closed archive over the given collaborators.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::InvalidInput` if the configuration is invalid.
    pub fn new(
        config: ArchiveConfig,
        metadata: Arc<dyn MetadataStore>,
        states: Arc<dyn StateStore>,
        coordination: Arc<dyn CoordinationStore>,
    ) -> Result<Self> {
        config.validate()?;
        let layout = ArchiveLayout::new(&config.file_path)?;
        let (events, event_receiver) = EventSink::bounded(config.event_capacity);
        let engine = CompressionEngine::new(config.compress_data);

        Ok(Self {
            inner: Arc::new(ArchiveInner {
                config,
                layout,
                metadata,
                states,
                coordination,
                active: RwLock::new(None),
                generation: AtomicU64::new(0),
                writer: Mutex::new(WriteContext {
                    blocks: HashMap::new(),
                    engine,
                    retired: None,
                }),
                gate: RolloverGate::new(),
                historic: HistoricIndex::new(),
                events,
                event_receiver,
                speed: WriteSpeedMeter::default(),
                preparing: AtomicBool::new(false),
                historic_sender: Mutex::new(None),
                shutdown_sender: Mutex::new(None),
                out_of_sequence: Mutex::new(Vec::new()),
                workers: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Opens or creates the active file and starts background work.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::AlreadyOpen` if the archive is open, or an
    /// error if the active file cannot be opened or created.
    pub fn open(&self) -> Result<()> {
        let inner = &self.inner;
        let mut active = inner.active.write();
        if active.is_some() {
            return Err(ArchiveError::AlreadyOpen);
        }

        let path = inner.layout.active_path();
        let handle = if path.exists() {
            ArchiveFileHandle::open(path, inner.config.sync_mode)?
        } else {
            ArchiveFileHandle::create(
                path,
                inner.config.block_size,
                inner.config.block_count(),
                inner.config.sync_mode,
            )?
        };

        let mut record = inner.coordination.read()?;
        record.blocks_used = handle.with_fat(|fat| fat.blocks_used());
        record.rollover_in_progress = false;
        inner.coordination.write(record)?;

        *active = Some(Arc::new(handle));
        drop(active);

        inner.writer.lock().retired = None;
        inner.historic.reset();
        inner.gate.reset();
        workers::start(inner)?;
        info!("Opened archive {:?}", path);
        Ok(())
    }

    /// Saves everything, stops background work and releases the active
    /// file. Closing a closed archive does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocation table or states cannot be saved.
    /// Background work is stopped either way.
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        inner.gate.shutdown();
        let handle = {
            let mut ctx = inner.writer.lock();
            ctx.blocks.clear();
            inner.active.write().take()
        };

        let was_open = handle.is_some();
        let result = match &handle {
            Some(handle) => handle.save().and_then(|()| inner.states.save()),
            None => Ok(()),
        };
        drop(handle);

        inner.historic_sender.lock().take();
        inner.shutdown_sender.lock().take();
        let workers = std::mem::take(&mut *inner.workers.lock());
        for worker in workers {
            let name = worker.thread().name().map(str::to_string);
            if worker.join().is_err() {
                warn!("Archive worker {:?} panicked", name);
            }
        }
        // Nothing may stay parked on the index of a closed archive.
        inner.historic.reset();
        inner.historic.mark_ready();
        if was_open {
            info!("Closed archive {:?}", inner.layout.active_path());
        }
        result
    }

    /// Returns true while the active file is open.
    pub fn is_open(&self) -> bool {
        self.inner.active.read().is_some()
    }

    /// Path of the active file.
    pub fn path(&self) -> &Path {
        self.inner.layout.active_path()
    }

    /// The configuration the archive was created with.
    pub fn config(&self) -> &ArchiveConfig {
        &self.inner.config
    }

    /// Persists the allocation table and the compression states.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::NotOpen` if the archive is closed, or an error
    /// if saving fails.
    pub fn save(&self) -> Result<()> {
        self.inner.active_handle()?.save()?;
        self.inner.states.save()
    }

    /// Writes one sample.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::InvalidInput` for a non-positive historian ID,
    /// `ArchiveError::FileFull` when the file is full and rollover on full is
    /// disabled, `ArchiveError::Closed` if the archive closes while waiting
    /// for a rollover, or an error from storage.
    pub fn write(&self, point: PointRecord) -> Result<WriteOutcome> {
        self.inner.write_point(point)
    }

    /// Writes samples in order, returning one outcome per sample.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first error.
    pub fn write_all(&self, points: impl IntoIterator<Item = PointRecord>) -> Result<Vec<WriteOutcome>> {
        points
            .into_iter()
            .map(|point| self.inner.write_point(point))
            .collect()
    }

    /// Returns the archived samples of `historian_id` in `[start, end]`, in
    /// time order.
    ///
    /// Blocks until the historic file index is built.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::InvalidInput` if `start > end`,
    /// `ArchiveError::NotOpen` if the archive is closed.
    pub fn read(&self, historian_id: HistorianId, start: TimeTag, end: TimeTag) -> Result<ArchiveReader> {
        if start > end {
            return Err(ArchiveError::InvalidInput(format!(
                "read range starts at {start} after its end {end}"
            )));
        }
        self.inner.active_handle()?;
        ArchiveReader::new(Arc::clone(&self.inner), historian_id, start, end)
    }

    /// Returns the archived samples of `historian_id` from `start` on.
    ///
    /// # Errors
    ///
    /// See [`read`](Self::read).
    pub fn read_since(&self, historian_id: HistorianId, start: TimeTag) -> Result<ArchiveReader> {
        self.read(historian_id, start, TimeTag::MAX)
    }

    /// Returns every archived sample of `historian_id`.
    ///
    /// # Errors
    ///
    /// See [`read`](Self::read).
    pub fn read_all(&self, historian_id: HistorianId) -> Result<ArchiveReader> {
        self.read(historian_id, TimeTag::MIN, TimeTag::MAX)
    }

    /// Retires the active file and activates the next one. Returns the path
    /// of the retired file.
    ///
    /// After a failed rollover writers stay blocked; calling `rollover`
    /// again resumes from the failed step.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the rollover.
    pub fn rollover(&self) -> Result<PathBuf> {
        let mut ctx = self.inner.writer.lock();
        if !self.is_open() && ctx.retired.is_none() {
            return Err(ArchiveError::NotOpen);
        }
        self.inner.rollover_locked(&mut ctx)
    }

    /// Returns a usage and throughput snapshot of the active file.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::NotOpen` if the archive is closed.
    pub fn statistics(&self) -> Result<ArchiveStatistics> {
        let handle = self.inner.active_handle()?;
        let (received, archived, used, count) = handle.with_fat(|fat| {
            (
                fat.points_received(),
                fat.points_archived(),
                fat.blocks_used(),
                fat.block_count(),
            )
        });
        Ok(ArchiveStatistics::from_counters(
            received,
            archived,
            used,
            count,
            self.inner.speed.current(),
        ))
    }

    /// Returns a receiver of archive events.
    ///
    /// All receivers share one bounded queue; each event is delivered to
    /// one of them.
    pub fn events(&self) -> Receiver<ArchiveEvent> {
        self.inner.event_receiver.clone()
    }

    /// Removes and returns the queued out-of-sequence samples.
    pub fn drain_out_of_sequence(&self) -> Vec<PointRecord> {
        std::mem::take(&mut *self.inner.out_of_sequence.lock())
    }

    /// Reads the metadata record of `historian_id`.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub fn read_metadata(&self, historian_id: HistorianId) -> Result<Option<MetadataRecord>> {
        self.inner.metadata.read(historian_id)
    }

    /// Writes a metadata record and publishes `MetadataUpdated`.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub fn write_metadata(&self, record: MetadataRecord) -> Result<()> {
        let historian_id = record.historian_id;
        self.inner.metadata.write(record)?;
        self.inner
            .events
            .publish(ArchiveEvent::MetadataUpdated { historian_id });
        Ok(())
    }

    /// Reads the compression state of `historian_id`.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub fn read_state(&self, historian_id: HistorianId) -> Result<Option<CompressionState>> {
        self.inner.states.read(historian_id)
    }

    /// Writes a compression state.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub fn write_state(&self, state: CompressionState) -> Result<()> {
        let _ctx = self.inner.writer.lock();
        self.inner.states.write(state)
    }

    /// Returns the known historic files, oldest first.
    pub fn historic_files(&self) -> Vec<HistoricFileInfo> {
        self.inner.historic.files()
    }

    /// Blocks until the historic file index is built.
    pub fn wait_for_historic_index(&self) {
        self.inner.historic.wait_ready();
    }

    /// Adds a historic file created outside the archive to the index.
    /// Returns true if `path` is a historic file of this archive.
    pub fn notify_file_created(&self, path: &Path) -> bool {
        match HistoricFileInfo::load(&self.inner.layout, path) {
            Some(info) => {
                self.inner.historic.insert(info);
                self.inner.events.publish(ArchiveEvent::HistoricFileListUpdated);
                true
            }
            None => false,
        }
    }

    /// Drops a removed historic file from the index. Returns true if it was
    /// indexed.
    pub fn notify_file_removed(&self, path: &Path) -> bool {
        let removed = self.inner.historic.remove(path);
        if removed {
            self.inner.events.publish(ArchiveEvent::HistoricFileListUpdated);
        }
        removed
    }
}

impl Drop for ArchiveFile {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(err) = self.close() {
                warn!(
                    "Failed to close archive {:?}: {}",
                    self.inner.layout.active_path(),
                    err
                );
            }
        }
    }
}

impl ArchiveInner {
    pub(crate) fn active_handle(&self) -> Result<Arc<ArchiveFileHandle>> {
        self.active.read().clone().ok_or(ArchiveError::NotOpen)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn write_point(self: &Arc<Self>, mut point: PointRecord) -> Result<WriteOutcome> {
        let historian_id = point.historian_id;
        if historian_id <= 0 {
            return Err(ArchiveError::InvalidInput(format!(
                "historian ID {historian_id} must be positive"
            )));
        }

        let mut ctx = loop {
            self.gate.wait_open()?;
            let ctx = self.writer.lock();
            if self.gate.is_open() {
                break ctx;
            }
        };
        let handle = self.active_handle()?;

        let metadata = match self.metadata.read(historian_id)? {
            Some(metadata) if metadata.enabled => metadata,
            _ => {
                self.events.publish(ArchiveEvent::OrphanData(point));
                return Ok(WriteOutcome::Orphan);
            }
        };
        if point.time > TimeTag::now().saturating_add(self.config.lead_time_tolerance) {
            self.events.publish(ArchiveEvent::FutureData(point));
            return Ok(WriteOutcome::FutureData);
        }
        if point.quality == Quality::NotSet {
            point.quality = classify_quality(point.value, &metadata);
        }

        let mut record = self.coordination.read()?;
        if point.time >= record.latest_point_time {
            record.latest_point_id = Some(historian_id);
            record.latest_point_time = point.time;
            self.coordination.write(record)?;
        }

        let state = self
            .states
            .read(historian_id)?
            .unwrap_or_else(|| CompressionState::new(historian_id));
        match state.check_sequence(&point) {
            Sequence::InOrder => {}
            Sequence::Duplicate => return Ok(WriteOutcome::Duplicate),
            Sequence::OutOfSequence => {
                let discarded = self.config.discard_out_of_sequence;
                if !discarded {
                    self.out_of_sequence.lock().push(point);
                }
                self.events
                    .publish(ArchiveEvent::OutOfSequenceData { point, discarded });
                return Ok(if discarded {
                    WriteOutcome::OutOfSequenceDiscarded
                } else {
                    WriteOutcome::OutOfSequenceQueued
                });
            }
        }

        let mut next = state;
        let evaluation = ctx.engine.evaluate(&mut next, point, &metadata);
        self.speed.record(1);
        let file_start = handle.with_fat(|fat| fat.file_start_time());
        let historic = evaluation
            .archive
            .is_some_and(|sample| sample.time < file_start);
        // Samples handed to the historic writer are not counted here.
        if !historic {
            handle.with_fat_mut(|fat| fat.record_received());
        }
        drop(handle);

        let outcome = match evaluation.archive {
            None => WriteOutcome::Compressed,
            Some(sample) if historic => {
                self.send_historic(sample);
                WriteOutcome::Historic
            }
            Some(sample) => self.append(&mut ctx, &mut next, sample)?,
        };
        if evaluation.alarm {
            self.events.publish(ArchiveEvent::AlarmNotification(point));
        }

        self.states.write(next)?;
        Ok(outcome)
    }

    fn send_historic(&self, sample: PointRecord) {
        let sent = match &*self.historic_sender.lock() {
            Some(sender) => sender.send(sample).is_ok(),
            None => false,
        };
        if sent {
            self.events.publish(ArchiveEvent::HistoricData(sample));
        } else {
            warn!(
                "Historic writer unavailable, dropping sample of {} at {}",
                sample.historian_id, sample.time
            );
        }
    }

    /// Appends `sample` to the active file, rolling over once if the file is
    /// full and rollover on full is enabled.
    ///
    /// The new file starts at the rollover boundary, which other series may
    /// have pushed past `sample`. Such a sample goes to the historic writer.
    fn append(
        self: &Arc<Self>,
        ctx: &mut WriteContext,
        state: &mut CompressionState,
        sample: PointRecord,
    ) -> Result<WriteOutcome> {
        let mut rolled_over = false;
        loop {
            let handle = self.active_handle()?;
            if rolled_over && sample.time < handle.with_fat(|fat| fat.file_start_time()) {
                drop(handle);
                self.send_historic(sample);
                return Ok(WriteOutcome::Historic);
            }
            if self.append_to(&handle, ctx, state, &sample)? {
                return Ok(WriteOutcome::Archived);
            }

            let path = handle.path().to_path_buf();
            drop(handle);
            self.events
                .publish(ArchiveEvent::FileFull { path: path.clone() });
            if !self.config.rollover_on_full || rolled_over {
                return Err(ArchiveError::FileFull { path });
            }
            self.rollover_locked(ctx)?;
            state.clear_active_block();
            rolled_over = true;
        }
    }

    /// Returns false when no block can take the sample.
    fn append_to(
        self: &Arc<Self>,
        handle: &ArchiveFileHandle,
        ctx: &mut WriteContext,
        state: &mut CompressionState,
        sample: &PointRecord,
    ) -> Result<bool> {
        let historian_id = sample.historian_id;
        let cached = ctx
            .blocks
            .remove(&historian_id)
            .filter(|block| !block.is_full());
        let allocated = cached.is_none();
        let block = match cached {
            Some(block) => Some(block),
            None => handle.request_block(historian_id, sample.time, state.active_block_index)?,
        };
        let Some(mut block) = block else {
            return Ok(false);
        };

        block.write(handle, sample)?;
        handle.with_fat_mut(|fat| fat.record_archived());
        state.active_block_index = Some(block.index());
        state.active_block_slot = block.slots_used() as i32;
        ctx.blocks.insert(historian_id, block);

        if allocated {
            let (blocks_used, usage) =
                handle.with_fat(|fat| (fat.blocks_used(), fat.usage_percent()));
            let mut record = self.coordination.read()?;
            if record.blocks_used != blocks_used {
                record.blocks_used = blocks_used;
                self.coordination.write(record)?;
            }
            if usage >= self.config.rollover_preparation_threshold {
                self.start_preparation();
            }
        }
        Ok(true)
    }

    /// Drops cached blocks idle longer than the configured inactivity.
    fn release_idle_blocks(&self) {
        let mut ctx = self.writer.lock();
        let before = ctx.blocks.len();
        let inactivity = self.config.block_inactivity;
        ctx.blocks.retain(|_, block| block.idle_for() < inactivity);
        let released = before - ctx.blocks.len();
        if released > 0 {
            debug!("Released {} idle data blocks", released);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryCoordinationStore, InMemoryMetadataStore, InMemoryStateStore};
    use std::time::Duration;
    use tempfile::TempDir;

    fn archive_with(config: ArchiveConfig) -> ArchiveFile {
        ArchiveFile::new(
            config,
            Arc::new(InMemoryMetadataStore::with_records([MetadataRecord::new(1, "a")])),
            Arc::new(InMemoryStateStore::new()),
            Arc::new(InMemoryCoordinationStore::new()),
        )
        .unwrap()
    }

    fn archive(dir: &TempDir) -> ArchiveFile {
        archive_with(ArchiveConfig::new(dir.path().join("unit.d")).with_blocks(8, 100))
    }

    fn point(seconds: i64) -> PointRecord {
        PointRecord::new(1, TimeTag::from_millis(seconds * 1000).unwrap(), 1.0, Quality::Good)
    }

    #[test]
    fn test_open_close_lifecycle() {
        let dir = TempDir::new().unwrap();
        let archive = archive(&dir);
        assert!(!archive.is_open());
        assert!(matches!(archive.write(point(1)), Err(ArchiveError::NotOpen)));

        archive.open().unwrap();
        assert!(matches!(archive.open(), Err(ArchiveError::AlreadyOpen)));
        assert!(archive.path().exists());
        archive.close().unwrap();
        assert!(!archive.is_open());
        archive.close().unwrap();

        archive.open().unwrap();
        assert_eq!(archive.write(point(1)).unwrap(), WriteOutcome::Archived);
    }

    #[test]
    fn test_rejects_bad_input() {
        let dir = TempDir::new().unwrap();
        let archive = archive(&dir);
        archive.open().unwrap();

        let mut bad = point(1);
        bad.historian_id = 0;
        assert!(matches!(archive.write(bad), Err(ArchiveError::InvalidInput(_))));
        assert!(matches!(
            archive.read(1, TimeTag::MAX, TimeTag::MIN),
            Err(ArchiveError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_idle_blocks_are_released() {
        let dir = TempDir::new().unwrap();
        let kept = archive(&dir);
        kept.open().unwrap();
        kept.write(point(1)).unwrap();
        kept.inner.release_idle_blocks();
        assert_eq!(kept.inner.writer.lock().blocks.len(), 1);
        kept.close().unwrap();

        let other = TempDir::new().unwrap();
        let config = ArchiveConfig::new(other.path().join("unit.d"))
            .with_blocks(8, 100)
            .with_memory_conservation(false, Duration::from_secs(60), Duration::ZERO);
        let released = archive_with(config);
        released.open().unwrap();
        released.write(point(1)).unwrap();
        released.inner.release_idle_blocks();
        assert!(released.inner.writer.lock().blocks.is_empty());

        // The block is found again through the allocation table.
        released.write(point(2)).unwrap();
        let handle = released.inner.active_handle().unwrap();
        assert_eq!(handle.with_fat(|fat| fat.blocks_used()), 1);
    }
}
