//! Rollover protocol and standby preparation.
//!
//! ```text
//!  close gate ─▶ mark coordination ─▶ compute boundary ─▶ retire active
//!                                                            │
//!        open gate ◀── start = boundary ◀── promote standby ◀┘
//! ```
//!
//! A failure while retiring keeps the active file. A failure after the
//! active file was retired leaves the gate closed until `rollover` is
//! called again, which resumes by activating the next file.

use super::{ArchiveEvent, ArchiveInner, WriteContext};
use crate::error::{ArchiveError, Result};
use crate::format::handle::ArchiveFileHandle;
use crate::format::TimeTag;
use crate::lifecycle::historic::HistoricFileInfo;
use crate::lifecycle::offload::{self, OffloadReport};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Pause between attempts to lock a file or observe released readers.
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Extension of a standby file while it is being built.
const PARTIAL_STANDBY_EXTENSION: &str = "standby.partial";

impl ArchiveInner {
    /// Runs a rollover. The caller holds the write lock.
    pub(super) fn rollover_locked(&self, ctx: &mut WriteContext) -> Result<PathBuf> {
        self.gate.close();
        self.events.publish(ArchiveEvent::RolloverStarted);
        info!("Rolling over {:?}", self.layout.active_path());

        match self.perform_rollover(ctx) {
            Ok((historic_path, boundary)) => {
                self.gate.open();
                info!(
                    "Rolled over to {:?} at boundary {}",
                    historic_path, boundary
                );
                self.events.publish(ArchiveEvent::RolloverCompleted {
                    historic_path: historic_path.clone(),
                    boundary,
                });
                Ok(historic_path)
            }
            Err(err) => {
                error!("Rollover of {:?} failed: {}", self.layout.active_path(), err);
                self.events
                    .publish_error(&err, |error| ArchiveEvent::RolloverFailed { error });
                Err(err)
            }
        }
    }

    fn perform_rollover(&self, ctx: &mut WriteContext) -> Result<(PathBuf, TimeTag)> {
        let (historic_path, boundary) = match ctx.retired.take() {
            Some(retired) => retired,
            None => self.retire_active(ctx)?,
        };

        let handle = match self.activate_next_file(boundary) {
            Ok(handle) => handle,
            Err(err) => {
                ctx.retired = Some((historic_path, boundary));
                return Err(err);
            }
        };
        let blocks_used = handle.with_fat(|fat| fat.blocks_used());
        *self.active.write() = Some(Arc::new(handle));
        self.generation.fetch_add(1, Ordering::AcqRel);

        let mut record = self.coordination.read()?;
        record.rollover_in_progress = false;
        record.blocks_used = blocks_used;
        self.coordination.write(record)?;
        Ok((historic_path, boundary))
    }

    /// Marks coordination, fixes the boundary and renames the
    /// active file to its historic name.
    fn retire_active(&self, ctx: &mut WriteContext) -> Result<(PathBuf, TimeTag)> {
        let coordination = self.coordination.read()?;
        let mut record = coordination;
        record.rollover_in_progress = true;
        record.blocks_used = 0;
        record.latest_point_id = None;
        record.latest_point_time = TimeTag::MIN;
        self.coordination.write(record)?;

        let handle = self.active_handle()?;
        let (start, mut boundary) = handle.with_fat(|fat| {
            let start = fat.file_start_time();
            (start, fat.file_end_time().max(start))
        });
        for historian_id in self.states.ids()? {
            let Some(mut state) = self.states.read(historian_id)? else {
                continue;
            };
            if !state.archived.is_empty() {
                boundary = boundary.max(state.archived.time);
            }
            if state.active_block_index.is_some() {
                state.clear_active_block();
                self.states.write(state)?;
            }
        }

        handle.with_fat_mut(|fat| fat.set_file_end_time(boundary));
        handle.save()?;
        self.states.save()?;
        ctx.blocks.clear();

        let active_path = self.layout.active_path().to_path_buf();
        let historic_path = self.layout.historic_path(start, boundary);
        self.active.write().take();
        self.wait_for_readers(&handle);

        if let Err(err) = self.rename_when_unlocked(&active_path, &historic_path) {
            warn!("Keeping {:?} active after failed rename: {}", active_path, err);
            *self.active.write() = Some(handle);
            self.coordination.write(coordination)?;
            self.gate.open();
            return Err(err);
        }
        // Readers may still hold the handle while the historic writer
        // grows the file.
        handle.detach();

        self.historic
            .insert(HistoricFileInfo::new(historic_path.clone(), start, boundary));
        self.events.publish(ArchiveEvent::HistoricFileListUpdated);
        Ok((historic_path, boundary))
    }

    /// Gives readers holding `handle` a bounded time to let go of it.
    fn wait_for_readers(&self, handle: &Arc<ArchiveFileHandle>) {
        let deadline = Instant::now() + self.config.reader_drain_timeout;
        while Arc::strong_count(handle) > 1 && Instant::now() < deadline {
            thread::sleep(RETRY_INTERVAL);
        }
        if Arc::strong_count(handle) > 1 {
            debug!(
                "Retiring {:?} while {} readers still hold it",
                handle.path(),
                Arc::strong_count(handle) - 1
            );
        }
    }

    fn rename_when_unlocked(&self, from: &Path, to: &Path) -> Result<()> {
        wait_for_exclusive(from, self.config.rename_lock_timeout)?;
        if to.exists() {
            return Err(ArchiveError::InvalidInput(format!(
                "historic file {to:?} already exists"
            )));
        }
        fs::rename(from, to)?;
        Ok(())
    }

    /// Promotes or creates the next active file and starts
    /// it at `boundary`. A partially created file is deleted on failure.
    fn activate_next_file(&self, boundary: TimeTag) -> Result<ArchiveFileHandle> {
        let active_path = self.layout.active_path();
        let result = self.open_next_file(boundary);
        if result.is_err() && active_path.exists() {
            if let Err(err) = fs::remove_file(active_path) {
                warn!("Failed to delete partial file {:?}: {}", active_path, err);
            }
        }
        result
    }

    fn open_next_file(&self, boundary: TimeTag) -> Result<ArchiveFileHandle> {
        let active_path = self.layout.active_path();
        let standby_path = self.layout.standby_path();
        let handle = if standby_path.exists() {
            fs::rename(&standby_path, active_path)?;
            debug!("Promoted standby file {:?}", standby_path);
            ArchiveFileHandle::open(active_path, self.config.sync_mode)?
        } else {
            ArchiveFileHandle::create(
                active_path,
                self.config.block_size,
                self.config.block_count(),
                self.config.sync_mode,
            )?
        };
        handle.with_fat_mut(|fat| {
            fat.set_file_start_time(boundary);
            fat.set_file_end_time(TimeTag::MIN);
        });
        handle.save()?;
        Ok(handle)
    }

    /// Starts standby preparation unless it is running or a standby file
    /// already exists.
    pub(super) fn start_preparation(self: &Arc<Self>) {
        if self.layout.standby_path().exists() || self.preparing.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("archive-prepare".to_string())
            .spawn(move || {
                let result = inner.prepare_rollover();
                inner.preparing.store(false, Ordering::Release);
                inner.report_preparation(result);
            });
        match spawned {
            Ok(worker) => self.workers.lock().push(worker),
            Err(err) => {
                self.preparing.store(false, Ordering::Release);
                error!("Failed to start rollover preparation: {}", err);
            }
        }
    }

    fn prepare_rollover(&self) -> Result<PathBuf> {
        self.events.publish(ArchiveEvent::RolloverPreparationStarted);
        self.historic.wait_ready();
        self.offload_historic_files();
        self.create_standby()
    }

    fn report_preparation(&self, result: Result<PathBuf>) {
        match result {
            Ok(path) => {
                info!("Standby file {:?} is ready", path);
                self.events
                    .publish(ArchiveEvent::RolloverPreparationCompleted { path });
            }
            Err(err) => {
                error!("Rollover preparation failed: {}", err);
                self.events.publish_error(&err, |error| {
                    ArchiveEvent::RolloverPreparationFailed { error }
                });
            }
        }
    }

    /// Builds a standby file shaped like the active file.
    ///
    /// The file is created under a partial name and renamed into place, so
    /// a rollover never promotes a half-written standby.
    fn create_standby(&self) -> Result<PathBuf> {
        let path = self.layout.standby_path();
        if path.exists() {
            warn!("Standby file {:?} already exists", path);
            return Ok(path);
        }
        let partial = path.with_extension(PARTIAL_STANDBY_EXTENSION);
        if partial.exists() {
            fs::remove_file(&partial)?;
        }
        let (block_size, block_count) = match self.active_handle() {
            Ok(handle) => handle.with_fat(|fat| (fat.block_size(), fat.block_count())),
            Err(_) => (self.config.block_size, self.config.block_count()),
        };
        let created =
            ArchiveFileHandle::create(&partial, block_size, block_count, self.config.sync_mode)
                .and_then(|handle| {
                    handle.save()?;
                    drop(handle);
                    fs::rename(&partial, &path)?;
                    Ok(())
                });
        if let Err(err) = created {
            if partial.exists() {
                if let Err(remove) = fs::remove_file(&partial) {
                    warn!("Failed to delete partial standby {:?}: {}", partial, remove);
                }
            }
            return Err(err);
        }
        Ok(path)
    }

    /// Applies age, space and count limits to historic files.
    pub(super) fn offload_historic_files(&self) {
        let location = &self.config.offload_location;
        let primary = self.layout.directory();

        if location.is_enabled() {
            if let Some(max_age) = self.config.offload_max_age {
                let files = offload::expired_files(&self.historic, primary, max_age, TimeTag::now());
                self.run_offload(&files);
            }
            match offload::needs_space(primary, self.config.offload_threshold) {
                Ok(true) => {
                    let files =
                        offload::oldest_files(&self.historic, primary, self.config.offload_count);
                    self.run_offload(&files);
                }
                Ok(false) => {}
                Err(err) => {
                    error!("Failed to query free space of {:?}: {}", primary, err);
                    self.events.publish_error(&err, |error| ArchiveEvent::OffloadFailed {
                        path: primary.to_path_buf(),
                        error,
                    });
                }
            }
        }

        if let Some(max_files) = self.config.max_historic_files {
            let surplus = offload::surplus_files(&self.historic, max_files);
            if !surplus.is_empty() {
                let report = offload::delete_files(&self.historic, &surplus);
                self.report_offload(report);
            }
        }
    }

    fn run_offload(&self, files: &[HistoricFileInfo]) {
        if files.is_empty() {
            return;
        }
        self.events
            .publish(ArchiveEvent::OffloadStarted { total: files.len() });
        let report = offload::offload_files(
            &self.historic,
            files,
            &self.config.offload_location,
            |completed, total, _| {
                self.events
                    .publish(ArchiveEvent::OffloadProgress { completed, total });
            },
        );
        self.report_offload(report);
    }

    fn report_offload(&self, report: OffloadReport) {
        for (path, err) in &report.failures {
            self.events.publish(ArchiveEvent::OffloadFailed {
                path: path.clone(),
                error: err.to_string(),
            });
        }
        self.events.publish(ArchiveEvent::OffloadCompleted {
            completed: report.completed,
        });
        if report.completed > 0 {
            self.events.publish(ArchiveEvent::HistoricFileListUpdated);
        }
    }
}

/// Waits up to `timeout` until an exclusive lock on `path` can be taken.
fn wait_for_exclusive(path: &Path, timeout: Duration) -> Result<()> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let deadline = Instant::now() + timeout;
    loop {
        match fs3::FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                fs3::FileExt::unlock(&file)?;
                return Ok(());
            }
            Err(_) if Instant::now() < deadline => thread::sleep(RETRY_INTERVAL),
            Err(_) => {
                return Err(ArchiveError::LockTimeout {
                    path: path.to_path_buf(),
                    timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_wait_for_exclusive_times_out_on_held_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locked.d");
        fs::write(&path, b"data").unwrap();

        wait_for_exclusive(&path, Duration::from_millis(50)).unwrap();

        let holder = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        fs3::FileExt::lock_exclusive(&holder).unwrap();
        assert!(matches!(
            wait_for_exclusive(&path, Duration::from_millis(50)),
            Err(ArchiveError::LockTimeout { .. })
        ));
        fs3::FileExt::unlock(&holder).unwrap();
        wait_for_exclusive(&path, Duration::from_millis(50)).unwrap();
    }
}
