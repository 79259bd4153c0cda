//! Block pointer table entries.

use crate::error::{ArchiveError, Result};
use crate::format::{le_f64, le_i32, HistorianId, TimeTag, FREE_HISTORIAN_ID};
use std::cmp::Ordering;
use std::io::{Read, Write};

/// Encoded size of a [`BlockPointer`] in bytes.
pub const POINTER_SIZE: usize = 12;

/// Maps one data block slot to the series that owns it.
///
/// Layout: historian ID `i32` (-1 when free) followed by the block start time
/// as `f64` seconds since the archive epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPointer {
    /// Owning historian ID, or -1 when free.
    pub historian_id: HistorianId,
    /// Time of the first sample written to the block.
    pub start_time: TimeTag,
}

impl Default for BlockPointer {
    fn default() -> Self {
        Self::free()
    }
}

impl BlockPointer {
    /// Creates a pointer bound to `historian_id`.
    pub fn new(historian_id: HistorianId, start_time: TimeTag) -> Self {
        Self {
            historian_id,
            start_time,
        }
    }

    /// Creates a free pointer.
    pub fn free() -> Self {
        Self::new(FREE_HISTORIAN_ID, TimeTag::MIN)
    }

    /// Marks the pointer free.
    pub fn reset(&mut self) {
        *self = Self::free();
    }

    /// Returns true when the pointer is bound to a series.
    ///
    /// A pointer bound exactly at the archive epoch reads as free.
    pub fn is_allocated(&self) -> bool {
        self.historian_id != FREE_HISTORIAN_ID && !self.start_time.is_min()
    }

    /// Encodes the pointer into its 12-byte form.
    pub fn to_bytes(&self) -> [u8; POINTER_SIZE] {
        let mut buf = [0u8; POINTER_SIZE];
        buf[0..4].copy_from_slice(&self.historian_id.to_le_bytes());
        buf[4..12].copy_from_slice(&self.start_time.as_seconds().to_le_bytes());
        buf
    }

    /// Decodes a pointer from exactly [`POINTER_SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::Corrupt` if the start time is not a valid
    /// archive time.
    pub fn from_bytes(buf: &[u8; POINTER_SIZE]) -> Result<Self> {
        let historian_id = le_i32(&buf[0..4]);
        let seconds = le_f64(&buf[4..12]);
        let start_time = TimeTag::from_seconds(seconds).map_err(|_| {
            ArchiveError::Corrupt(format!("block pointer start time {seconds} out of range"))
        })?;
        Ok(Self {
            historian_id,
            start_time,
        })
    }

    /// Writes the pointer using little-endian byte order.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }

    /// Reads a pointer using little-endian byte order.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the pointer is corrupt.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; POINTER_SIZE];
        reader.read_exact(&mut buf)?;
        Self::from_bytes(&buf)
    }
}

impl PartialOrd for BlockPointer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BlockPointer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.historian_id
            .cmp(&other.historian_id)
            .then(self.start_time.cmp(&other.start_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_free_pointer() {
        let mut pointer = BlockPointer::new(5, TimeTag::from_millis(10_000).unwrap());
        assert!(pointer.is_allocated());

        pointer.reset();
        assert!(!pointer.is_allocated());
        assert_eq!(pointer.historian_id, -1);
        assert!(pointer.start_time.is_min());
    }

    #[test]
    fn test_pointer_at_epoch_reads_as_free() {
        let pointer = BlockPointer::new(5, TimeTag::MIN);
        assert!(!pointer.is_allocated());
    }

    #[test]
    fn test_corrupt_start_time() {
        let mut buf = [0u8; POINTER_SIZE];
        buf[0..4].copy_from_slice(&3i32.to_le_bytes());
        buf[4..12].copy_from_slice(&f64::NAN.to_le_bytes());
        assert!(matches!(
            BlockPointer::from_bytes(&buf),
            Err(ArchiveError::Corrupt(_))
        ));
    }

    #[test]
    fn test_ordering() {
        let early = TimeTag::from_millis(1_000).unwrap();
        let late = TimeTag::from_millis(2_000).unwrap();
        assert!(BlockPointer::new(1, late) < BlockPointer::new(2, early));
        assert!(BlockPointer::new(1, early) < BlockPointer::new(1, late));
    }

    proptest! {
        #[test]
        fn prop_block_pointer_roundtrip(
            id in -1i32..=i32::MAX,
            millis in 0i64..=TimeTag::MAX.as_millis(),
        ) {
            let pointer = BlockPointer::new(id, TimeTag::from_millis(millis).unwrap());
            let mut buf = Vec::new();
            pointer.write_to(&mut buf).unwrap();
            prop_assert_eq!(buf.len(), POINTER_SIZE);

            let decoded = BlockPointer::read_from(&mut buf.as_slice()).unwrap();
            prop_assert_eq!(decoded, pointer);
        }
    }
}
