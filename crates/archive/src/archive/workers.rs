//! Background threads started when an archive opens.
//!
//! - `archive-historic-index` builds the historic file index once.
//! - `archive-historic-writer` writes samples older than the active file
//!   into the historic files covering them.
//! - `archive-block-timer` releases idle cached data blocks.
//!
//! The writer and the timer stop when their channel senders are dropped by
//! `close`.

use super::{ArchiveEvent, ArchiveInner};
use crate::error::{ArchiveError, Result};
use crate::format::handle::{ArchiveFileHandle, SyncMode};
use crate::format::point::PointRecord;
use crate::format::DataBlock;
use crate::lifecycle::historic::HistoricFileInfo;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

pub(super) fn start(inner: &Arc<ArchiveInner>) -> Result<()> {
    let mut workers = inner.workers.lock();

    let builder = Arc::clone(inner);
    workers.push(spawn("archive-historic-index", move || {
        build_historic_index(&builder)
    })?);

    let (sender, receiver) = crossbeam_channel::unbounded();
    *inner.historic_sender.lock() = Some(sender);
    let writer = Arc::clone(inner);
    workers.push(spawn("archive-historic-writer", move || {
        run_historic_writer(&writer, &receiver)
    })?);

    if inner.config.conserve_memory {
        let (sender, receiver) = crossbeam_channel::bounded::<()>(1);
        *inner.shutdown_sender.lock() = Some(sender);
        let timer = Arc::clone(inner);
        workers.push(spawn("archive-block-timer", move || {
            run_block_timer(&timer, &receiver)
        })?);
    }
    Ok(())
}

fn spawn(name: &str, f: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    Ok(thread::Builder::new().name(name.to_string()).spawn(f)?)
}

fn build_historic_index(inner: &ArchiveInner) {
    inner
        .events
        .publish(ArchiveEvent::HistoricFileListBuildStarted);

    let primary = inner.layout.directory().to_path_buf();
    let mut directories = vec![primary.clone()];
    if let Some(offload) = inner.config.offload_location.directory() {
        if offload != primary {
            directories.push(offload.to_path_buf());
        }
    }

    match inner.historic.build(&inner.layout, &directories) {
        Ok(count) => {
            info!("Indexed {} historic files of {:?}", count, inner.layout.active_path());
            inner
                .events
                .publish(ArchiveEvent::HistoricFileListBuildCompleted { count });
        }
        Err(err) => {
            error!("Historic file index build failed: {}", err);
            inner.events.publish_error(&err, |error| {
                ArchiveEvent::HistoricFileListBuildFailed { error }
            });
        }
    }
}

fn run_historic_writer(inner: &ArchiveInner, receiver: &Receiver<PointRecord>) {
    while let Ok(first) = receiver.recv() {
        let mut batch = vec![first];
        batch.extend(receiver.try_iter());
        write_historic_batch(inner, batch);
    }
}

fn write_historic_batch(inner: &ArchiveInner, batch: Vec<PointRecord>) {
    inner.historic.wait_ready();

    let mut targets: Vec<(HistoricFileInfo, Vec<PointRecord>)> = Vec::new();
    let mut uncovered = 0usize;
    for point in batch {
        let Some(info) = inner.historic.find_for_time(point.time) else {
            uncovered += 1;
            continue;
        };
        match targets.iter_mut().find(|(target, _)| target.path == info.path) {
            Some((_, points)) => points.push(point),
            None => targets.push((info, vec![point])),
        }
    }
    if uncovered > 0 {
        warn!("Dropped {} historic samples with no covering file", uncovered);
    }

    for (info, points) in targets {
        let count = points.len();
        match write_historic_file(&info.path, points, inner.config.sync_mode) {
            Ok(()) => debug!("Wrote {} historic samples to {:?}", count, info.path),
            Err(err) => {
                error!(
                    "Failed to write {} historic samples to {:?}: {}",
                    count, info.path, err
                );
                inner.events.publish_error(&err, |error| {
                    ArchiveEvent::DataWriteFailed {
                        points: count,
                        error,
                    }
                });
            }
        }
    }
}

/// Writes `points` into the historic file at `path`.
///
/// Each series continues in its last block while it has free slots. The file
/// grows when its free blocks cannot hold the rest.
pub(crate) fn write_historic_file(
    path: &Path,
    mut points: Vec<PointRecord>,
    sync_mode: SyncMode,
) -> Result<()> {
    points.sort();
    let handle = ArchiveFileHandle::open(path, sync_mode)?;

    let capacity = handle.with_fat(|fat| fat.block_capacity());
    let mut needed = 0usize;
    for run in points.chunk_by(|a, b| a.historian_id == b.historian_id) {
        let historian_id = run[0].historian_id;
        let spare = match handle.with_fat(|fat| fat.find_last_block(historian_id)) {
            Some(index) => DataBlock::open(&handle, index, historian_id)?.slots_available(),
            None => 0,
        };
        needed += run.len().saturating_sub(spare).div_ceil(capacity);
    }
    let free = handle.with_fat(|fat| fat.blocks_free());
    if needed > free {
        handle.extend(needed - free)?;
    }

    for run in points.chunk_by(|a, b| a.historian_id == b.historian_id) {
        let mut block: Option<DataBlock> = None;
        for point in run {
            if block.as_ref().map_or(true, DataBlock::is_full) {
                let hint = block.as_ref().map(DataBlock::index);
                let next = handle
                    .request_block(point.historian_id, point.time, hint)?
                    .ok_or_else(|| ArchiveError::FileFull {
                        path: path.to_path_buf(),
                    })?;
                block = Some(next);
            }
            if let Some(target) = block.as_mut() {
                target.write(&handle, point)?;
                handle.with_fat_mut(|fat| fat.record_archived());
            }
        }
    }
    handle.save()
}

fn run_block_timer(inner: &ArchiveInner, shutdown: &Receiver<()>) {
    loop {
        match shutdown.recv_timeout(inner.config.block_check_interval) {
            Err(RecvTimeoutError::Timeout) => inner.release_idle_blocks(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Quality, TimeTag};
    use tempfile::TempDir;

    fn point(id: i32, seconds: i64) -> PointRecord {
        PointRecord::new(
            id,
            TimeTag::from_millis(seconds * 1000).unwrap(),
            seconds as f32,
            Quality::Good,
        )
    }

    #[test]
    fn test_historic_file_grows_to_fit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("old.d");
        {
            // Two blocks of three records, one taken by series 1.
            let handle = ArchiveFileHandle::create(&path, 30, 2, SyncMode::None).unwrap();
            let mut block = handle.request_block(1, point(1, 5).time, None).unwrap().unwrap();
            block.write(&handle, &point(1, 5)).unwrap();
        }

        let points = vec![
            point(1, 10),
            point(2, 12),
            point(1, 11),
            point(1, 13),
            point(1, 14),
            point(2, 15),
        ];
        write_historic_file(&path, points, SyncMode::None).unwrap();

        let handle = ArchiveFileHandle::open_read_only(&path).unwrap();
        let (count, used, archived) =
            handle.with_fat(|fat| (fat.block_count(), fat.blocks_used(), fat.points_archived()));
        // Series 1 fills its block and needs one more, series 2 needs one.
        assert_eq!(count, 3);
        assert_eq!(used, 3);
        assert_eq!(archived, 6);

        let series_one = handle.with_fat(|fat| fat.find_blocks(1, TimeTag::MIN, TimeTag::MAX));
        assert_eq!(series_one.len(), 2);
        let mut first = DataBlock::open(&handle, series_one[0], 1).unwrap();
        let times: Vec<i64> = first
            .read(&handle)
            .unwrap()
            .map(|p| p.time.as_millis() / 1000)
            .collect();
        assert_eq!(times, vec![5, 10, 11]);

        let series_two = handle.with_fat(|fat| fat.find_blocks(2, TimeTag::MIN, TimeTag::MAX));
        assert_eq!(series_two.len(), 1);
        let mut block = DataBlock::open(&handle, series_two[0], 2).unwrap();
        let times: Vec<i64> = block
            .read(&handle)
            .unwrap()
            .map(|p| p.time.as_millis() / 1000)
            .collect();
        assert_eq!(times, vec![12, 15]);
    }

    #[test]
    fn test_single_samples_share_a_block() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("old.d");
        {
            let handle = ArchiveFileHandle::create(&path, 100, 2, SyncMode::None).unwrap();
            let mut block = handle.request_block(1, point(1, 1).time, None).unwrap().unwrap();
            block.write(&handle, &point(1, 1)).unwrap();
        }

        for second in 2..=10 {
            write_historic_file(&path, vec![point(1, second)], SyncMode::None).unwrap();
        }

        let handle = ArchiveFileHandle::open_read_only(&path).unwrap();
        assert_eq!(handle.with_fat(|fat| (fat.block_count(), fat.blocks_used())), (2, 1));
        let mut block = DataBlock::open(&handle, 0, 1).unwrap();
        assert_eq!(block.read(&handle).unwrap().count(), 10);
    }
}
