//! Time-ordered reads across historic files and the active file.

use super::{ArchiveEvent, ArchiveInner};
use crate::error::Result;
use crate::format::block::BlockScan;
use crate::format::handle::ArchiveFileHandle;
use crate::format::point::PointRecord;
use crate::format::{DataBlock, HistorianId, TimeTag};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// A file selected for a read.
#[derive(Debug)]
enum PlannedFile {
    Historic(PathBuf),
    Active(Arc<ArchiveFileHandle>),
}

/// Lower bound of the samples still to yield.
#[derive(Debug, Clone, Copy)]
enum LowerBound {
    From(TimeTag),
    After(TimeTag),
}

impl LowerBound {
    fn admits(self, time: TimeTag) -> bool {
        match self {
            Self::From(start) => time >= start,
            Self::After(last) => time > last,
        }
    }

    fn time(self) -> TimeTag {
        match self {
            Self::From(time) | Self::After(time) => time,
        }
    }
}

/// Samples of one file still to yield.
#[derive(Debug)]
enum FileCursor {
    /// Blocks whose start times follow block order, scanned lazily.
    Streaming {
        handle: Arc<ArchiveFileHandle>,
        blocks: VecDeque<usize>,
        scan: Option<BlockScan>,
    },
    /// Samples of a file whose blocks are out of time order, pre-sorted.
    Buffered(VecDeque<PointRecord>),
}

/// Lazy iterator over the samples of one series in a time range.
///
/// Files are visited oldest first and their blocks are loaded one at a
/// time. When the archive rolls over during the read, the remaining range
/// is planned again so that no sample is skipped or yielded twice. A file
/// that cannot be read is skipped and reported as `DataReadFailed`.
pub struct ArchiveReader {
    inner: Arc<ArchiveInner>,
    historian_id: HistorianId,
    end: TimeTag,
    lower: LowerBound,
    generation: u64,
    pending: VecDeque<PlannedFile>,
    current: Option<(PathBuf, FileCursor)>,
    finished: bool,
}

impl std::fmt::Debug for ArchiveReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveReader")
            .field("historian_id", &self.historian_id)
            .field("lower", &self.lower)
            .field("end", &self.end)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl ArchiveReader {
    pub(super) fn new(
        inner: Arc<ArchiveInner>,
        historian_id: HistorianId,
        start: TimeTag,
        end: TimeTag,
    ) -> Result<Self> {
        inner.historic.wait_ready();
        inner.gate.wait_open()?;
        let mut reader = Self {
            inner,
            historian_id,
            end,
            lower: LowerBound::From(start),
            generation: 0,
            pending: VecDeque::new(),
            current: None,
            finished: false,
        };
        reader.plan();
        Ok(reader)
    }

    /// Historian ID being read.
    pub fn historian_id(&self) -> HistorianId {
        self.historian_id
    }

    fn plan(&mut self) {
        self.generation = self.inner.generation();
        let start = self.lower.time();
        self.pending = self
            .inner
            .historic
            .intersecting(start, self.end)
            .into_iter()
            .map(|info| PlannedFile::Historic(info.path))
            .collect();
        if let Ok(active) = self.inner.active_handle() {
            let active_start = active.with_fat(|fat| fat.file_start_time());
            if self.end >= active_start {
                self.pending.push_back(PlannedFile::Active(active));
            }
        }
        debug!(
            "Planned read of {} over {} files from {}",
            self.historian_id,
            self.pending.len(),
            start
        );
    }

    fn open_cursor(&self, file: PlannedFile) -> Result<(PathBuf, FileCursor)> {
        let handle = match file {
            PlannedFile::Historic(path) => Arc::new(ArchiveFileHandle::open_read_only(&path)?),
            PlannedFile::Active(handle) => handle,
        };
        let path = handle.path().to_path_buf();
        let id = self.historian_id;
        let start = self.lower.time();

        let (mut blocks, ordered) = handle.with_fat(|fat| {
            let owned: Vec<TimeTag> = fat
                .pointers()
                .iter()
                .filter(|p| p.is_allocated() && p.historian_id == id)
                .map(|p| p.start_time)
                .collect();
            let ordered = owned.windows(2).all(|pair| pair[0] <= pair[1]);

            let mut blocks: VecDeque<usize> = fat.find_blocks(id, start, self.end).into();
            if let Some(&first) = blocks.front() {
                if let Some(previous) = fat.previous_block(id, first) {
                    blocks.push_front(previous);
                }
            }
            (blocks, ordered)
        });

        if ordered {
            return Ok((
                path,
                FileCursor::Streaming {
                    handle,
                    blocks,
                    scan: None,
                },
            ));
        }

        // Blocks appended for late samples break block order; merge them.
        blocks = handle
            .with_fat(|fat| {
                fat.pointers()
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.is_allocated() && p.historian_id == id)
                    .filter(|(_, p)| p.start_time <= self.end)
                    .map(|(index, _)| index)
                    .collect::<Vec<_>>()
            })
            .into();
        let mut points = Vec::new();
        for index in blocks {
            let mut block = DataBlock::open(&handle, index, id)?;
            points.extend(
                block
                    .read(&handle)?
                    .filter(|p| self.lower.admits(p.time) && p.time <= self.end),
            );
        }
        points.sort_by_key(|p| p.time);
        Ok((path, FileCursor::Buffered(points.into())))
    }

    fn report_failure(&self, path: PathBuf, error: &str) {
        warn!("Skipping {:?} while reading {}: {}", path, self.historian_id, error);
        self.inner.events.publish(ArchiveEvent::DataReadFailed {
            path,
            error: error.to_string(),
        });
    }

    /// Next sample of the current file, or `None` when it is exhausted.
    fn next_in_file(&mut self) -> Result<Option<PointRecord>> {
        let Some((_, cursor)) = self.current.as_mut() else {
            return Ok(None);
        };
        match cursor {
            FileCursor::Buffered(points) => Ok(points.pop_front()),
            FileCursor::Streaming {
                handle,
                blocks,
                scan,
            } => loop {
                if let Some(point) = scan.as_mut().and_then(Iterator::next) {
                    if point.time > self.end {
                        return Ok(None);
                    }
                    if self.lower.admits(point.time) {
                        return Ok(Some(point));
                    }
                    continue;
                }
                let Some(index) = blocks.pop_front() else {
                    return Ok(None);
                };
                let mut block = DataBlock::open(handle, index, self.historian_id)?;
                *scan = Some(block.read(handle)?);
            },
        }
    }
}

impl Iterator for ArchiveReader {
    type Item = PointRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }

            if self.current.is_some() {
                match self.next_in_file() {
                    Ok(Some(point)) => {
                        self.lower = LowerBound::After(point.time);
                        return Some(point);
                    }
                    Ok(None) => self.current = None,
                    Err(err) => {
                        if let Some((path, _)) = self.current.take() {
                            self.report_failure(path, &err.to_string());
                        }
                    }
                }
                continue;
            }

            if self.inner.gate.wait_open().is_err() {
                self.finished = true;
                continue;
            }
            if self.inner.generation() != self.generation {
                self.plan();
            }
            match self.pending.pop_front() {
                Some(file) => {
                    let path = match &file {
                        PlannedFile::Historic(path) => path.clone(),
                        PlannedFile::Active(handle) => handle.path().to_path_buf(),
                    };
                    match self.open_cursor(file) {
                        Ok(cursor) => self.current = Some(cursor),
                        Err(err) => self.report_failure(path, &err.to_string()),
                    }
                }
                None => self.finished = true,
            }
        }
    }
}
