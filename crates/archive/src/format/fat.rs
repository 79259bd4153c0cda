//! File allocation table.
//!
//! The allocation table maps data block slots to historian IDs and carries
//! the per-file counters. It is persisted after the data region as the
//! pointer table followed by a fixed trailer:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Pointer table: block_count * 12 bytes                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Trailer (48 bytes)                                           │
//! │  - Magic: "AFAT" (4 bytes)                                    │
//! │  - Version: u16 (2 bytes)                                     │
//! │  - Reserved: 2 bytes                                          │
//! │  - File start time: f64 seconds (8 bytes)                     │
//! │  - File end time: f64 seconds (8 bytes)                       │
//! │  - Points received: i32 (4 bytes)                             │
//! │  - Points archived: i32 (4 bytes)                             │
//! │  - Block size: i32 (4 bytes)                                  │
//! │  - Block count: i32 (4 bytes)                                 │
//! │  - Blocks used: i32 (4 bytes)                                 │
//! │  - CRC32 of the preceding 44 bytes (4 bytes)                  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use crate::error::{ArchiveError, Result};
use crate::format::point::RECORD_SIZE;
use crate::format::pointer::{BlockPointer, POINTER_SIZE};
use crate::format::{le_f64, le_i32, le_u16, le_u32, HistorianId, TimeTag};
use std::io::{Read, Write};
use tracing::debug;

/// Magic bytes of the allocation table trailer: "AFAT"
pub const FAT_MAGIC: [u8; 4] = *b"AFAT";

/// Current allocation table format version.
pub const FAT_VERSION: u16 = 1;

/// Trailer size in bytes.
pub const TRAILER_SIZE: usize = 48;

/// Fixed part of the allocation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatTrailer {
    /// Start of the file's valid time span.
    pub file_start_time: TimeTag,
    /// End of the file's valid time span.
    pub file_end_time: TimeTag,
    /// Samples accepted by the write pipeline for this file.
    pub points_received: u32,
    /// Samples written to data blocks of this file.
    pub points_archived: u32,
    /// Data block size in bytes.
    pub block_size: u32,
    /// Number of data blocks.
    pub block_count: u32,
    /// Number of allocated blocks at the last save.
    pub blocks_used: u32,
}

impl FatTrailer {
    /// Writes the trailer using little-endian byte order.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut buf = [0u8; TRAILER_SIZE];
        // Magic (4 bytes)
        buf[0..4].copy_from_slice(&FAT_MAGIC);
        // Version (2 bytes) + reserved (2 bytes)
        buf[4..6].copy_from_slice(&FAT_VERSION.to_le_bytes());
        // File span (16 bytes)
        buf[8..16].copy_from_slice(&self.file_start_time.as_seconds().to_le_bytes());
        buf[16..24].copy_from_slice(&self.file_end_time.as_seconds().to_le_bytes());
        // Counters (20 bytes)
        buf[24..28].copy_from_slice(&(self.points_received as i32).to_le_bytes());
        buf[28..32].copy_from_slice(&(self.points_archived as i32).to_le_bytes());
        buf[32..36].copy_from_slice(&(self.block_size as i32).to_le_bytes());
        buf[36..40].copy_from_slice(&(self.block_count as i32).to_le_bytes());
        buf[40..44].copy_from_slice(&(self.blocks_used as i32).to_le_bytes());
        // CRC32 (4 bytes)
        let crc = crc32fast::hash(&buf[0..44]);
        buf[44..48].copy_from_slice(&crc.to_le_bytes());

        writer.write_all(&buf)?;
        Ok(())
    }

    /// Reads a trailer using little-endian byte order.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::InvalidMagic`, `UnsupportedVersion` or
    /// `ChecksumMismatch` when the trailer does not validate.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; TRAILER_SIZE];
        reader.read_exact(&mut buf)?;

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);
        if magic != FAT_MAGIC {
            return Err(ArchiveError::InvalidMagic(magic));
        }

        let version = le_u16(&buf[4..6]);
        if version != FAT_VERSION {
            return Err(ArchiveError::UnsupportedVersion(version));
        }

        let expected = le_u32(&buf[44..48]);
        let actual = crc32fast::hash(&buf[0..44]);
        if expected != actual {
            return Err(ArchiveError::ChecksumMismatch { expected, actual });
        }

        let time = |bytes: &[u8]| {
            let seconds = le_f64(bytes);
            TimeTag::from_seconds(seconds)
                .map_err(|_| ArchiveError::Corrupt(format!("file time {seconds} out of range")))
        };
        let count = |bytes: &[u8], field: &str| {
            u32::try_from(le_i32(bytes))
                .map_err(|_| ArchiveError::Corrupt(format!("negative {field} in trailer")))
        };

        Ok(Self {
            file_start_time: time(&buf[8..16])?,
            file_end_time: time(&buf[16..24])?,
            points_received: count(&buf[24..28], "points received")?,
            points_archived: count(&buf[28..32], "points archived")?,
            block_size: count(&buf[32..36], "block size")?,
            block_count: count(&buf[36..40], "block count")?,
            blocks_used: count(&buf[40..44], "blocks used")?,
        })
    }
}

/// In-memory allocation table of one archive file.
///
/// The table is the single writer of block allocation: a block index is
/// bound to at most one historian ID at a time.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationTable {
    block_size: u32,
    pointers: Vec<BlockPointer>,
    blocks_used: usize,
    points_received: u32,
    points_archived: u32,
    file_start_time: TimeTag,
    file_end_time: TimeTag,
}

impl AllocationTable {
    /// Creates an empty table of `block_count` free blocks.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::InvalidInput` if a block cannot hold a single
    /// record or `block_count` is zero.
    pub fn new(block_size: u32, block_count: usize) -> Result<Self> {
        if (block_size as usize) < RECORD_SIZE {
            return Err(ArchiveError::InvalidInput(format!(
                "block size {block_size} is smaller than one record"
            )));
        }
        if block_count == 0 || block_count > i32::MAX as usize {
            return Err(ArchiveError::InvalidInput(format!(
                "block count {block_count} is out of range"
            )));
        }
        Ok(Self {
            block_size,
            pointers: vec![BlockPointer::free(); block_count],
            blocks_used: 0,
            points_received: 0,
            points_archived: 0,
            file_start_time: TimeTag::MIN,
            file_end_time: TimeTag::MIN,
        })
    }

    /// Rebuilds a table from its persisted parts.
    ///
    /// `blocks_used` is recomputed from the pointer table.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::Corrupt` if the trailer disagrees with the
    /// pointer table.
    pub fn from_parts(trailer: FatTrailer, pointers: Vec<BlockPointer>) -> Result<Self> {
        if pointers.len() != trailer.block_count as usize {
            return Err(ArchiveError::Corrupt(format!(
                "trailer declares {} blocks, pointer table holds {}",
                trailer.block_count,
                pointers.len()
            )));
        }
        if trailer.points_archived > trailer.points_received {
            return Err(ArchiveError::Corrupt(format!(
                "{} points archived but only {} received",
                trailer.points_archived, trailer.points_received
            )));
        }
        let mut table = Self::new(trailer.block_size, pointers.len())
            .map_err(|err| ArchiveError::Corrupt(err.to_string()))?;
        table.blocks_used = pointers.iter().filter(|p| p.is_allocated()).count();
        if table.blocks_used != trailer.blocks_used as usize {
            debug!(
                "Trailer blocks used {} differs from pointer table {}",
                trailer.blocks_used, table.blocks_used
            );
        }
        table.pointers = pointers;
        table.points_received = trailer.points_received;
        table.points_archived = trailer.points_archived;
        table.file_start_time = trailer.file_start_time;
        table.file_end_time = trailer.file_end_time;
        Ok(table)
    }

    /// Returns the persisted fixed part of the table.
    pub fn trailer(&self) -> FatTrailer {
        FatTrailer {
            file_start_time: self.file_start_time,
            file_end_time: self.file_end_time,
            points_received: self.points_received,
            points_archived: self.points_archived,
            block_size: self.block_size,
            block_count: self.pointers.len() as u32,
            blocks_used: self.blocks_used as u32,
        }
    }

    /// Data block size in bytes.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Number of data blocks.
    pub fn block_count(&self) -> usize {
        self.pointers.len()
    }

    /// Number of allocated blocks.
    pub fn blocks_used(&self) -> usize {
        self.blocks_used
    }

    /// Number of free blocks.
    pub fn blocks_free(&self) -> usize {
        self.pointers.len() - self.blocks_used
    }

    /// Records that fit into one data block.
    pub fn block_capacity(&self) -> usize {
        self.block_size as usize / RECORD_SIZE
    }

    /// Allocated share of the file in percent.
    pub fn usage_percent(&self) -> f64 {
        self.blocks_used as f64 / self.pointers.len() as f64 * 100.0
    }

    /// Length of the data region, which is also the pointer table offset.
    pub fn data_len(&self) -> u64 {
        self.pointers.len() as u64 * self.block_size as u64
    }

    /// Offset of pointer `index` within the file.
    pub fn pointer_offset(&self, index: usize) -> u64 {
        self.data_len() + (index * POINTER_SIZE) as u64
    }

    /// Offset of the trailer within the file.
    pub fn trailer_offset(&self) -> u64 {
        self.pointer_offset(self.pointers.len())
    }

    /// Total file length.
    pub fn file_len(&self) -> u64 {
        self.trailer_offset() + TRAILER_SIZE as u64
    }

    /// Returns the pointer at `index`.
    pub fn pointer(&self, index: usize) -> Option<&BlockPointer> {
        self.pointers.get(index)
    }

    /// Returns the whole pointer table.
    pub fn pointers(&self) -> &[BlockPointer] {
        &self.pointers
    }

    /// Samples accepted for this file.
    pub fn points_received(&self) -> u32 {
        self.points_received
    }

    /// Samples written to this file.
    pub fn points_archived(&self) -> u32 {
        self.points_archived
    }

    /// Counts a received sample.
    pub fn record_received(&mut self) {
        self.points_received = self.points_received.saturating_add(1);
    }

    /// Counts an archived sample. A sample archived without being received
    /// here (historic writes) counts as received too.
    pub fn record_archived(&mut self) {
        self.points_archived = self.points_archived.saturating_add(1);
        if self.points_archived > self.points_received {
            self.points_received = self.points_archived;
        }
    }

    /// Start of the file's valid time span.
    pub fn file_start_time(&self) -> TimeTag {
        self.file_start_time
    }

    /// End of the file's valid time span.
    pub fn file_end_time(&self) -> TimeTag {
        self.file_end_time
    }

    /// Sets the start of the file's time span.
    pub fn set_file_start_time(&mut self, time: TimeTag) {
        self.file_start_time = time;
    }

    /// Sets the end of the file's time span.
    pub fn set_file_end_time(&mut self, time: TimeTag) {
        self.file_end_time = time;
    }

    /// Requests a block for `historian_id`, starting at `time`.
    ///
    /// Reuses `hint` when it names a block already owned by `historian_id`.
    /// Otherwise binds the first free block at or after the number of blocks
    /// in use. Returns `None` once the file is full.
    pub fn request_block(
        &mut self,
        historian_id: HistorianId,
        time: TimeTag,
        hint: Option<usize>,
    ) -> Option<usize> {
        if let Some(index) = hint {
            if let Some(pointer) = self.pointers.get(index) {
                if pointer.is_allocated() && pointer.historian_id == historian_id {
                    return Some(index);
                }
            }
        }

        let start = self.blocks_used.min(self.pointers.len());
        let index = (start..self.pointers.len())
            .chain(0..start)
            .find(|&i| !self.pointers[i].is_allocated())?;

        self.pointers[index] = BlockPointer::new(historian_id, time);
        self.blocks_used = (self.blocks_used + 1).min(self.pointers.len());
        if self.file_start_time.is_min() {
            self.file_start_time = time;
        }
        debug!(
            "Bound block {} to historian {} at {}",
            index, historian_id, time
        );
        Some(index)
    }

    /// Returns the most recently allocated block owned by `historian_id`.
    pub fn find_last_block(&self, historian_id: HistorianId) -> Option<usize> {
        self.pointers
            .iter()
            .rposition(|p| p.is_allocated() && p.historian_id == historian_id)
    }

    /// Returns the last block owned by `historian_id` before `index`.
    pub fn previous_block(&self, historian_id: HistorianId, index: usize) -> Option<usize> {
        self.pointers[..index.min(self.pointers.len())]
            .iter()
            .rposition(|p| p.is_allocated() && p.historian_id == historian_id)
    }

    /// Returns the blocks of `historian_id` whose coverage intersects
    /// `[start, end]`, in block-index order.
    ///
    /// A block covers `[its start time, start time of the next block of the
    /// same ID)`; the last block of an ID is open-ended.
    pub fn find_blocks(&self, historian_id: HistorianId, start: TimeTag, end: TimeTag) -> Vec<usize> {
        let owned: Vec<usize> = self
            .pointers
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_allocated() && p.historian_id == historian_id)
            .map(|(index, _)| index)
            .collect();

        owned
            .iter()
            .enumerate()
            .filter(|(position, &index)| {
                let block_start = self.pointers[index].start_time;
                let next_start = owned
                    .get(position + 1)
                    .map(|&next| self.pointers[next].start_time);
                block_start <= end && next_start.map_or(true, |next| next > start)
            })
            .map(|(_, &index)| index)
            .collect()
    }

    /// Appends `count` free blocks.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::InvalidInput` if the block count would exceed
    /// the on-disk range.
    pub fn extend(&mut self, count: usize) -> Result<()> {
        let total = self.pointers.len() + count;
        if total > i32::MAX as usize {
            return Err(ArchiveError::InvalidInput(format!(
                "cannot extend to {total} blocks"
            )));
        }
        self.pointers.resize(total, BlockPointer::free());
        Ok(())
    }

    /// Encodes the pointer table.
    pub fn encode_pointers(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.pointers.len() * POINTER_SIZE);
        for pointer in &self.pointers {
            buf.extend_from_slice(&pointer.to_bytes());
        }
        buf
    }

    /// Decodes a pointer table of `block_count` entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is short or a pointer is corrupt.
    pub fn decode_pointers(buf: &[u8], block_count: usize) -> Result<Vec<BlockPointer>> {
        if buf.len() < block_count * POINTER_SIZE {
            return Err(ArchiveError::Corrupt(format!(
                "pointer table holds {} bytes, expected {}",
                buf.len(),
                block_count * POINTER_SIZE
            )));
        }
        buf.chunks_exact(POINTER_SIZE)
            .take(block_count)
            .map(|chunk| {
                let mut bytes = [0u8; POINTER_SIZE];
                bytes.copy_from_slice(chunk);
                BlockPointer::from_bytes(&bytes)
            })
            .collect()
    }
}
