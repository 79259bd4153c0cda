//! Append-only data blocks.

use crate::error::{ArchiveError, Result};
use crate::format::handle::ArchiveFileHandle;
use crate::format::point::{PointRecord, RECORD_SIZE};
use crate::format::HistorianId;
use std::time::{Duration, Instant};

/// Idle time after which a cached block counts as inactive.
pub const DEFAULT_INACTIVITY_WINDOW: Duration = Duration::from_secs(300);

/// One data block of an archive file, addressed by index.
///
/// A block does not own the file; every I/O call takes the
/// [`ArchiveFileHandle`] that holds it. The write cursor is discovered on open
/// by scanning to the first empty sentinel record.
#[derive(Debug, Clone)]
pub struct DataBlock {
    index: usize,
    historian_id: HistorianId,
    block_size: u32,
    slots_used: usize,
    last_activity: Instant,
}

impl DataBlock {
    /// Opens block `index` of `handle` for `historian_id` and locates its
    /// write cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the block cannot be read.
    pub fn open(handle: &ArchiveFileHandle, index: usize, historian_id: HistorianId) -> Result<Self> {
        let block_size = handle.with_fat(|fat| fat.block_size());
        let mut block = Self {
            index,
            historian_id,
            block_size,
            slots_used: 0,
            last_activity: Instant::now(),
        };
        let data = handle.read_at(block.location(), block.capacity() * RECORD_SIZE)?;
        block.slots_used = BlockScan::new(historian_id, data).count();
        Ok(block)
    }

    /// Index of the block within its file.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Historian ID the block was opened for.
    pub fn historian_id(&self) -> HistorianId {
        self.historian_id
    }

    /// Byte offset of the block within its file.
    pub fn location(&self) -> u64 {
        self.index as u64 * self.block_size as u64
    }

    /// Number of records the block can hold.
    pub fn capacity(&self) -> usize {
        self.block_size as usize / RECORD_SIZE
    }

    /// Number of records written.
    pub fn slots_used(&self) -> usize {
        self.slots_used
    }

    /// Number of records that can still be appended.
    pub fn slots_available(&self) -> usize {
        self.capacity() - self.slots_used
    }

    /// Returns true when no record can be appended.
    pub fn is_full(&self) -> bool {
        self.slots_used >= self.capacity()
    }

    /// Time since the block was last opened, written or read.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Returns true unless the block has been idle longer than the default
    /// inactivity window. Only used to evict cached blocks.
    pub fn is_active(&self) -> bool {
        self.idle_for() < DEFAULT_INACTIVITY_WINDOW
    }

    /// Returns a scan over the records written to the block.
    ///
    /// # Errors
    ///
    /// Returns an error if the block cannot be read.
    pub fn read(&mut self, handle: &ArchiveFileHandle) -> Result<BlockScan> {
        let data = handle.read_at(self.location(), self.capacity() * RECORD_SIZE)?;
        self.last_activity = Instant::now();
        Ok(BlockScan::new(self.historian_id, data))
    }

    /// Appends a record at the write cursor.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::BlockFull` if no slot remains.
    pub fn write(&mut self, handle: &ArchiveFileHandle, point: &PointRecord) -> Result<()> {
        if self.is_full() {
            return Err(ArchiveError::BlockFull { index: self.index });
        }
        let offset = self.location() + (self.slots_used * RECORD_SIZE) as u64;
        handle.write_at(offset, &point.to_bytes())?;
        self.slots_used += 1;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Overwrites the whole capacity with empty sentinels.
    ///
    /// # Errors
    ///
    /// Returns an error if the block cannot be written.
    pub fn reset(&mut self, handle: &ArchiveFileHandle) -> Result<()> {
        let zeros = vec![0u8; self.capacity() * RECORD_SIZE];
        handle.write_at(self.location(), &zeros)?;
        self.slots_used = 0;
        self.last_activity = Instant::now();
        Ok(())
    }
}

/// Lazy scan over the records of one block.
///
/// The scan stops at the first empty sentinel or at block capacity and can
/// be restarted from the first record.
#[derive(Debug, Clone)]
pub struct BlockScan {
    historian_id: HistorianId,
    data: Vec<u8>,
    position: usize,
    finished: bool,
}

impl BlockScan {
    fn new(historian_id: HistorianId, data: Vec<u8>) -> Self {
        Self {
            historian_id,
            data,
            position: 0,
            finished: false,
        }
    }

    /// Rewinds the scan to the first record.
    pub fn restart(&mut self) {
        self.position = 0;
        self.finished = false;
    }
}

impl Iterator for BlockScan {
    type Item = PointRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let record = self
            .data
            .get(self.position..)
            .and_then(|rest| PointRecord::decode(self.historian_id, rest));
        match record {
            Some(point) if !point.is_empty() => {
                self.position += RECORD_SIZE;
                Some(point)
            }
            _ => {
                self.finished = true;
                None
            }
        }
    }
}
