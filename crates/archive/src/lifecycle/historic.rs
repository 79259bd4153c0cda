//! Index of historic archive files.

use crate::error::Result;
use crate::format::handle::ArchiveFileHandle;
use crate::format::TimeTag;
use crate::lifecycle::naming::ArchiveLayout;
use parking_lot::{Condvar, Mutex, RwLock};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Location and time span of one historic file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoricFileInfo {
    /// Full file path.
    pub path: PathBuf,
    /// Start of the file's time span.
    pub start_time: TimeTag,
    /// End of the file's time span.
    pub end_time: TimeTag,
}

impl HistoricFileInfo {
    /// Creates a new info record.
    pub fn new(path: PathBuf, start_time: TimeTag, end_time: TimeTag) -> Self {
        Self {
            path,
            start_time,
            end_time,
        }
    }

    /// Reads the time span of `path` from its allocation table, or from its
    /// file name when the file cannot be opened.
    ///
    /// Returns `None` for names that are not historic file names of
    /// `layout`.
    pub fn load(layout: &ArchiveLayout, path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let parsed = layout.parse_historic_name(name)?;

        match ArchiveFileHandle::open_read_only(path) {
            Ok(handle) => {
                let (start, end) =
                    handle.with_fat(|fat| (fat.file_start_time(), fat.file_end_time()));
                Some(Self::new(path.to_path_buf(), start, end))
            }
            Err(err) => {
                debug!("Using file name span for {:?}: {}", path, err);
                Some(Self::new(path.to_path_buf(), parsed.0, parsed.1))
            }
        }
    }

    /// Returns true if the span intersects `[start, end]`.
    pub fn intersects(&self, start: TimeTag, end: TimeTag) -> bool {
        start <= self.end_time && end >= self.start_time
    }

    /// Returns true if `time` lies within the span.
    pub fn contains(&self, time: TimeTag) -> bool {
        self.start_time <= time && time <= self.end_time
    }

    /// Returns true if the file lives directly in `directory`.
    pub fn is_in(&self, directory: &Path) -> bool {
        self.path.parent() == Some(directory)
    }
}

/// Historic files known to an archive, ordered by start time.
///
/// The index is filled by a background build. Callers that need a complete
/// index block in [`wait_ready`](Self::wait_ready) until the build marks it
/// ready.
#[derive(Debug, Default)]
pub struct HistoricIndex {
    files: RwLock<Vec<HistoricFileInfo>>,
    ready: Mutex<bool>,
    ready_changed: Condvar,
}

impl HistoricIndex {
    /// Creates an empty index that is not ready.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the index from the historic files of `layout` in
    /// `directories` and marks it ready. Returns the number of files found.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be listed. The index is marked
    /// ready either way so that waiters are released.
    pub fn build(&self, layout: &ArchiveLayout, directories: &[PathBuf]) -> Result<usize> {
        let result = Self::scan(layout, directories);
        let count = match &result {
            Ok(files) => {
                let count = files.len();
                *self.files.write() = files.clone();
                count
            }
            Err(err) => {
                warn!("Historic file scan failed: {}", err);
                0
            }
        };
        self.mark_ready();
        result.map(|_| count)
    }

    fn scan(layout: &ArchiveLayout, directories: &[PathBuf]) -> Result<Vec<HistoricFileInfo>> {
        let mut files = Vec::new();
        for directory in directories {
            for path in layout.list_historic_files(directory)? {
                if let Some(info) = HistoricFileInfo::load(layout, &path) {
                    files.push(info);
                }
            }
        }
        files.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.path.cmp(&b.path)));
        files.dedup_by(|a, b| a.path == b.path);
        Ok(files)
    }

    /// Releases everything blocked in `wait_ready`.
    pub fn mark_ready(&self) {
        *self.ready.lock() = true;
        self.ready_changed.notify_all();
    }

    /// Clears the ready flag and all entries.
    pub fn reset(&self) {
        *self.ready.lock() = false;
        self.files.write().clear();
    }

    /// Returns true once a build has finished.
    pub fn is_ready(&self) -> bool {
        *self.ready.lock()
    }

    /// Blocks until a build has finished.
    pub fn wait_ready(&self) {
        let mut ready = self.ready.lock();
        while !*ready {
            self.ready_changed.wait(&mut ready);
        }
    }

    /// Adds or replaces the entry for `info.path`.
    pub fn insert(&self, info: HistoricFileInfo) {
        let mut files = self.files.write();
        files.retain(|existing| existing.path != info.path);
        let position = files.partition_point(|existing| existing.start_time <= info.start_time);
        files.insert(position, info);
    }

    /// Removes the entry for `path`. Returns true if it was present.
    pub fn remove(&self, path: &Path) -> bool {
        let mut files = self.files.write();
        let before = files.len();
        files.retain(|existing| existing.path != path);
        files.len() != before
    }

    /// Returns all entries, oldest first.
    pub fn files(&self) -> Vec<HistoricFileInfo> {
        self.files.read().clone()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    /// Returns true when no historic file is known.
    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }

    /// Returns the files intersecting `[start, end]`, oldest first.
    pub fn intersecting(&self, start: TimeTag, end: TimeTag) -> Vec<HistoricFileInfo> {
        self.files
            .read()
            .iter()
            .filter(|info| info.intersects(start, end))
            .cloned()
            .collect()
    }

    /// Returns the first file whose span contains `time`.
    pub fn find_for_time(&self, time: TimeTag) -> Option<HistoricFileInfo> {
        self.files
            .read()
            .iter()
            .find(|info| info.contains(time))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::handle::SyncMode;
    use std::fs;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn t(seconds: i64) -> TimeTag {
        TimeTag::from_millis(seconds * 1000).unwrap()
    }

    fn write_historic(layout: &ArchiveLayout, start: i64, end: i64) -> PathBuf {
        let path = layout.historic_path(t(start), t(end));
        let handle = ArchiveFileHandle::create(&path, 100, 2, SyncMode::None).unwrap();
        handle.with_fat_mut(|fat| {
            fat.set_file_start_time(t(start));
            fat.set_file_end_time(t(end));
        });
        handle.save().unwrap();
        path
    }

    #[test]
    fn test_load_prefers_allocation_table() {
        let dir = TempDir::new().unwrap();
        let layout = ArchiveLayout::new(&dir.path().join("archive.d")).unwrap();

        // The name claims [100, 200] but the table says [100, 250].
        let path = layout.historic_path(t(100), t(200));
        {
            let handle = ArchiveFileHandle::create(&path, 100, 2, SyncMode::None).unwrap();
            handle.with_fat_mut(|fat| {
                fat.set_file_start_time(t(100));
                fat.set_file_end_time(t(250));
            });
        }
        let info = HistoricFileInfo::load(&layout, &path).unwrap();
        assert_eq!(info.end_time, t(250));

        // An unreadable file falls back to its name.
        fs::write(&path, b"not an archive").unwrap();
        let info = HistoricFileInfo::load(&layout, &path).unwrap();
        assert_eq!((info.start_time, info.end_time), (t(100), t(200)));

        assert!(HistoricFileInfo::load(&layout, layout.active_path()).is_none());
    }

    #[test]
    fn test_build_and_query() {
        let dir = TempDir::new().unwrap();
        let offload = TempDir::new().unwrap();
        let layout = ArchiveLayout::new(&dir.path().join("archive.d")).unwrap();
        let offload_layout = ArchiveLayout::new(&offload.path().join("archive.d")).unwrap();

        let newest = write_historic(&layout, 200, 300);
        let oldest = write_historic(&offload_layout, 0, 100);
        let middle = write_historic(&layout, 100, 200);

        let index = HistoricIndex::new();
        assert!(!index.is_ready());
        let count = index
            .build(&layout, &[dir.path().to_path_buf(), offload.path().to_path_buf()])
            .unwrap();
        assert_eq!(count, 3);
        assert!(index.is_ready());

        let paths: Vec<PathBuf> = index.files().into_iter().map(|info| info.path).collect();
        assert_eq!(paths, vec![oldest.clone(), middle.clone(), newest.clone()]);

        let hits: Vec<PathBuf> = index
            .intersecting(t(150), t(250))
            .into_iter()
            .map(|info| info.path)
            .collect();
        assert_eq!(hits, vec![middle.clone(), newest.clone()]);
        assert_eq!(index.find_for_time(t(50)).unwrap().path, oldest);
        assert!(index.find_for_time(t(301)).is_none());

        assert!(index.files()[0].is_in(offload.path()));
        assert!(index.remove(&oldest));
        assert!(!index.remove(&oldest));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_insert_keeps_order() {
        let index = HistoricIndex::new();
        index.insert(HistoricFileInfo::new(PathBuf::from("b"), t(20), t(30)));
        index.insert(HistoricFileInfo::new(PathBuf::from("a"), t(0), t(10)));
        index.insert(HistoricFileInfo::new(PathBuf::from("b"), t(20), t(40)));

        let files = index.files();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, PathBuf::from("a"));
        assert_eq!(files[1].end_time, t(40));
    }

    #[test]
    fn test_wait_ready_blocks_until_marked() {
        let index = Arc::new(HistoricIndex::new());
        let waiter = {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                index.wait_ready();
                index.len()
            })
        };
        index.insert(HistoricFileInfo::new(PathBuf::from("a"), t(0), t(10)));
        index.mark_ready();
        assert_eq!(waiter.join().unwrap(), 1);
    }
}
