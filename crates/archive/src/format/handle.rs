//! Shared handle over one archive file and its allocation table.

use crate::error::{ArchiveError, Result};
use crate::format::block::DataBlock;
use crate::format::fat::{AllocationTable, FatTrailer, TRAILER_SIZE};
use crate::format::pointer::POINTER_SIZE;
use crate::format::{HistorianId, TimeTag};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Durability applied after each write to an archive file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fsync after each write (highest durability).
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// Leave flushing to the operating system.
    #[default]
    None,
}

struct HandleInner {
    file: File,
    fat: AllocationTable,
}

impl HandleInner {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<()> {
        let mut buf = Vec::with_capacity(TRAILER_SIZE);
        self.fat.trailer().write_to(&mut buf)?;
        let offset = self.fat.trailer_offset();
        self.write_at(offset, &buf)
    }

    fn write_pointer(&mut self, index: usize) -> Result<()> {
        let Some(pointer) = self.fat.pointer(index).copied() else {
            return Err(ArchiveError::InvalidInput(format!(
                "block index {index} out of range"
            )));
        };
        let offset = self.fat.pointer_offset(index);
        self.write_at(offset, &pointer.to_bytes())
    }

    fn write_table(&mut self) -> Result<()> {
        let pointers = self.fat.encode_pointers();
        let offset = self.fat.data_len();
        self.write_at(offset, &pointers)?;
        self.write_trailer()
    }

    fn sync(&mut self, mode: SyncMode) -> Result<()> {
        match mode {
            SyncMode::Fsync => self.file.sync_all()?,
            SyncMode::Fdatasync => self.file.sync_data()?,
            SyncMode::None => {}
        }
        Ok(())
    }
}

/// Owns the open file and the allocation table of one archive file.
///
/// All positioned reads and writes are serialized by one lock. Data blocks
/// are addressed by `(handle, block index)` and borrow the handle for each
/// I/O call.
pub struct ArchiveFileHandle {
    path: PathBuf,
    sync_mode: SyncMode,
    writable: bool,
    /// Cleared by [`detach`](ArchiveFileHandle::detach).
    persist: AtomicBool,
    inner: Mutex<HandleInner>,
}

impl std::fmt::Debug for ArchiveFileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveFileHandle")
            .field("path", &self.path)
            .field("sync_mode", &self.sync_mode)
            .field("writable", &self.writable)
            .field("persist", &self.persist.load(Ordering::Relaxed))
            .finish()
    }
}

impl ArchiveFileHandle {
    /// Creates a new archive file of `block_count` blocks of `block_size`
    /// bytes. The data region is sparse and reads as empty sentinels.
    ///
    /// # Errors
    ///
    /// Returns an error if the file already exists or cannot be written.
    pub fn create(
        path: &Path,
        block_size: u32,
        block_count: usize,
        sync_mode: SyncMode,
    ) -> Result<Self> {
        let fat = AllocationTable::new(block_size, block_count)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(fat.file_len())?;

        let mut inner = HandleInner { file, fat };
        inner.write_table()?;
        inner.file.sync_all()?;
        debug!(
            "Created archive file {:?} ({} blocks of {} bytes)",
            path, block_count, block_size
        );

        Ok(Self {
            path: path.to_path_buf(),
            sync_mode,
            writable: true,
            persist: AtomicBool::new(true),
            inner: Mutex::new(inner),
        })
    }

    /// Opens an existing archive file for reading and writing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or its allocation table
    /// does not validate.
    pub fn open(path: &Path, sync_mode: SyncMode) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::from_file(path, file, sync_mode, true)
    }

    /// Opens an existing archive file for reading only.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or its allocation table
    /// does not validate.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_file(path, file, SyncMode::None, false)
    }

    fn from_file(path: &Path, mut file: File, sync_mode: SyncMode, writable: bool) -> Result<Self> {
        let len = file.metadata()?.len();
        if len < TRAILER_SIZE as u64 {
            return Err(ArchiveError::Corrupt(format!(
                "{path:?} is too short to hold an allocation table"
            )));
        }

        file.seek(SeekFrom::Start(len - TRAILER_SIZE as u64))?;
        let trailer = FatTrailer::read_from(&mut file)?;

        let block_count = trailer.block_count as usize;
        let table_len = (block_count * POINTER_SIZE) as u64;
        let expected_len =
            block_count as u64 * trailer.block_size as u64 + table_len + TRAILER_SIZE as u64;
        if expected_len != len {
            return Err(ArchiveError::Corrupt(format!(
                "{path:?} is {len} bytes, allocation table expects {expected_len}"
            )));
        }

        let mut buf = vec![0u8; block_count * POINTER_SIZE];
        file.seek(SeekFrom::Start(len - TRAILER_SIZE as u64 - table_len))?;
        file.read_exact(&mut buf)?;
        let pointers = AllocationTable::decode_pointers(&buf, block_count)?;
        let fat = AllocationTable::from_parts(trailer, pointers)?;

        Ok(Self {
            path: path.to_path_buf(),
            sync_mode,
            writable,
            persist: AtomicBool::new(writable),
            inner: Mutex::new(HandleInner { file, fat }),
        })
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true when the file was opened for writing.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Stops this handle from writing its allocation table, on
    /// [`save`](Self::save) or on drop.
    ///
    /// Once a file is retired other handles may grow it, and the table held
    /// here no longer matches the file.
    pub fn detach(&self) {
        self.persist.store(false, Ordering::Release);
    }

    /// Runs `f` with shared access to the allocation table.
    pub fn with_fat<R>(&self, f: impl FnOnce(&AllocationTable) -> R) -> R {
        f(&self.inner.lock().fat)
    }

    /// Runs `f` with exclusive access to the allocation table. Changes are
    /// persisted by the next [`save`](Self::save).
    pub fn with_fat_mut<R>(&self, f: impl FnOnce(&mut AllocationTable) -> R) -> R {
        f(&mut self.inner.lock().fat)
    }

    /// Reads `len` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.inner.lock().read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Writes `buf` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.write_at(offset, buf)?;
        inner.sync(self.sync_mode)
    }

    /// Returns a writable block for `historian_id`, allocating one if needed.
    ///
    /// `hint` is reused while it belongs to `historian_id` and has free
    /// slots; otherwise the last block of the ID is tried before a free block
    /// is bound at `time`. A free block holding stale records is reset
    /// before use. Returns `None` when the file is full.
    ///
    /// # Errors
    ///
    /// Returns an error if block I/O or persisting the pointer fails.
    pub fn request_block(
        &self,
        historian_id: HistorianId,
        time: TimeTag,
        hint: Option<usize>,
    ) -> Result<Option<DataBlock>> {
        let candidate = match hint {
            Some(index) if self.has_free_slots(index, historian_id)? => Some(index),
            _ => match self.with_fat(|fat| fat.find_last_block(historian_id)) {
                Some(index) if self.has_free_slots(index, historian_id)? => Some(index),
                _ => None,
            },
        };
        self.bind_block(historian_id, time, candidate)
    }

    fn bind_block(
        &self,
        historian_id: HistorianId,
        time: TimeTag,
        candidate: Option<usize>,
    ) -> Result<Option<DataBlock>> {
        let bound = {
            let mut inner = self.inner.lock();
            let Some(index) = inner.fat.request_block(historian_id, time, candidate) else {
                return Ok(None);
            };
            if Some(index) != candidate {
                inner.write_pointer(index)?;
                inner.write_trailer()?;
                inner.sync(self.sync_mode)?;
            }
            index
        };

        let mut block = DataBlock::open(self, bound, historian_id)?;
        if Some(bound) != candidate && block.slots_used() > 0 {
            debug!("Resetting stale block {} in {:?}", bound, self.path);
            block.reset(self)?;
        }
        Ok(Some(block))
    }

    fn has_free_slots(&self, index: usize, historian_id: HistorianId) -> Result<bool> {
        let owned = self.with_fat(|fat| {
            fat.pointer(index)
                .is_some_and(|p| p.is_allocated() && p.historian_id == historian_id)
        });
        if !owned {
            return Ok(false);
        }
        Ok(!DataBlock::open(self, index, historian_id)?.is_full())
    }

    /// Grows the file by `count` free blocks, moving the pointer table and
    /// trailer behind the new data region.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be grown.
    pub fn extend(&self, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let old_data_len = inner.fat.data_len();
        inner.fat.extend(count)?;
        let new_data_len = inner.fat.data_len();

        // Old table bytes now lie inside the new blocks.
        let zeros = vec![0u8; inner.fat.block_size() as usize];
        let mut offset = old_data_len;
        while offset < new_data_len {
            inner.write_at(offset, &zeros)?;
            offset += zeros.len() as u64;
        }
        let file_len = inner.fat.file_len();
        inner.file.set_len(file_len)?;
        inner.write_table()?;
        inner.sync(self.sync_mode)?;
        debug!("Extended {:?} by {} blocks", self.path, count);
        Ok(())
    }

    /// Persists the whole allocation table.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be written.
    pub fn save(&self) -> Result<()> {
        if !self.persist.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        inner.write_table()?;
        inner.file.flush()?;
        inner.sync(self.sync_mode)
    }

    /// Flushes file data and metadata to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if syncing fails.
    pub fn sync_all(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }
}

impl Drop for ArchiveFileHandle {
    fn drop(&mut self) {
        if !*self.persist.get_mut() {
            return;
        }
        let inner = self.inner.get_mut();
        let result = inner
            .write_table()
            .and_then(|()| inner.file.sync_all().map_err(ArchiveError::from));
        if let Err(err) = result {
            warn!("Failed to persist allocation table of {:?}: {}", self.path, err);
        }
    }
}
