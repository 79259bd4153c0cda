//! Per-series compression state.

use crate::error::{ArchiveError, Result};
use crate::format::point::{PointRecord, RECORD_SIZE};
use crate::format::{le_f64, le_i32, HistorianId};
use std::io::{Read, Write};

/// Encoded size of a [`CompressionState`] in bytes.
pub const STATE_SIZE: usize = 4 + 3 * RECORD_SIZE + 4 + 4 + 8 + 8;

/// Outcome of comparing a sample with the last received one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequence {
    /// The sample is newer than anything received.
    InOrder,
    /// Same time, value and quality as the last received sample.
    Duplicate,
    /// The sample is not newer than the last received one.
    OutOfSequence,
}

/// Compression state of one historian ID.
///
/// Holds the last archived sample, the two most recent received samples, the
/// corridor slopes and the block the series is currently writing to.
///
/// Binary layout (little-endian, 58 bytes): historian ID `i32`, archived,
/// previous and current samples as 10-byte point records, active block
/// index `i32` (-1 = none), active block slot `i32`, slope1 `f64`,
/// slope2 `f64`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionState {
    /// Series the state belongs to.
    pub historian_id: HistorianId,
    /// Last archived sample.
    pub archived: PointRecord,
    /// Sample received before `current`.
    pub previous: PointRecord,
    /// Most recently received sample.
    pub current: PointRecord,
    /// Block the series appends to in the active file.
    pub active_block_index: Option<usize>,
    /// Records written to the active block.
    pub active_block_slot: i32,
    /// Lower corridor slope.
    pub slope1: f64,
    /// Upper corridor slope.
    pub slope2: f64,
}

impl CompressionState {
    /// Creates the empty state of `historian_id`.
    pub fn new(historian_id: HistorianId) -> Self {
        Self {
            historian_id,
            archived: PointRecord::empty(historian_id),
            previous: PointRecord::empty(historian_id),
            current: PointRecord::empty(historian_id),
            active_block_index: None,
            active_block_slot: 0,
            slope1: 0.0,
            slope2: 0.0,
        }
    }

    /// Returns the most recently received sample, if any.
    pub fn last_received(&self) -> Option<&PointRecord> {
        if !self.previous.is_empty() {
            Some(&self.previous)
        } else if !self.archived.is_empty() {
            Some(&self.archived)
        } else {
            None
        }
    }

    /// Classifies `point` against the last received sample.
    pub fn check_sequence(&self, point: &PointRecord) -> Sequence {
        let Some(last) = self.last_received() else {
            return Sequence::InOrder;
        };
        if point.time > last.time {
            Sequence::InOrder
        } else if point.time == last.time
            && point.value == last.value
            && point.quality == last.quality
        {
            Sequence::Duplicate
        } else {
            Sequence::OutOfSequence
        }
    }

    /// Forgets the active block, as after a rollover.
    pub fn clear_active_block(&mut self) {
        self.active_block_index = None;
        self.active_block_slot = 0;
    }

    /// Encodes the state into its 58-byte form.
    pub fn to_bytes(&self) -> [u8; STATE_SIZE] {
        let mut buf = [0u8; STATE_SIZE];
        let index = self
            .active_block_index
            .and_then(|index| i32::try_from(index).ok())
            .unwrap_or(-1);

        buf[0..4].copy_from_slice(&self.historian_id.to_le_bytes());
        self.archived.encode_into(&mut buf[4..14]);
        self.previous.encode_into(&mut buf[14..24]);
        self.current.encode_into(&mut buf[24..34]);
        buf[34..38].copy_from_slice(&index.to_le_bytes());
        buf[38..42].copy_from_slice(&self.active_block_slot.to_le_bytes());
        buf[42..50].copy_from_slice(&self.slope1.to_le_bytes());
        buf[50..58].copy_from_slice(&self.slope2.to_le_bytes());
        buf
    }

    /// Decodes a state from its 58-byte form.
    pub fn from_bytes(buf: &[u8; STATE_SIZE]) -> Self {
        let historian_id = le_i32(&buf[0..4]);
        let record = |range: std::ops::Range<usize>| {
            PointRecord::decode(historian_id, &buf[range])
                .unwrap_or_else(|| PointRecord::empty(historian_id))
        };
        let index = le_i32(&buf[34..38]);
        Self {
            historian_id,
            archived: record(4..14),
            previous: record(14..24),
            current: record(24..34),
            active_block_index: usize::try_from(index).ok(),
            active_block_slot: le_i32(&buf[38..42]),
            slope1: le_f64(&buf[42..50]),
            slope2: le_f64(&buf[50..58]),
        }
    }

    /// Writes the state using little-endian byte order.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }

    /// Reads a state using little-endian byte order.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the historian ID is not positive.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; STATE_SIZE];
        reader.read_exact(&mut buf)?;
        let state = Self::from_bytes(&buf);
        if state.historian_id <= 0 {
            return Err(ArchiveError::Corrupt(format!(
                "state record for historian {}",
                state.historian_id
            )));
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Quality, TimeTag};
    use proptest::prelude::*;

    fn point(seconds: i64, value: f32) -> PointRecord {
        PointRecord::new(3, TimeTag::from_millis(seconds * 1000).unwrap(), value, Quality::Good)
    }

    #[test]
    fn test_sequence_against_last_received() {
        let mut state = CompressionState::new(3);
        assert_eq!(state.check_sequence(&point(10, 1.0)), Sequence::InOrder);

        // Only the archived sample is known after the first write.
        state.archived = point(10, 1.0);
        assert_eq!(state.check_sequence(&point(10, 1.0)), Sequence::Duplicate);
        assert_eq!(state.check_sequence(&point(10, 2.0)), Sequence::OutOfSequence);
        assert_eq!(state.check_sequence(&point(5, 1.0)), Sequence::OutOfSequence);

        state.previous = point(20, 4.0);
        assert_eq!(state.check_sequence(&point(15, 4.0)), Sequence::OutOfSequence);
        assert_eq!(state.check_sequence(&point(21, 4.0)), Sequence::InOrder);
    }

    #[test]
    fn test_empty_state_layout() {
        let state = CompressionState::new(9);
        let bytes = state.to_bytes();
        assert_eq!(STATE_SIZE, 58);
        assert_eq!(&bytes[0..4], &9i32.to_le_bytes());
        assert_eq!(&bytes[34..38], &(-1i32).to_le_bytes());
        assert_eq!(CompressionState::from_bytes(&bytes), state);
    }

    #[test]
    fn test_rejects_invalid_id() {
        let bytes = CompressionState::new(0).to_bytes();
        assert!(CompressionState::read_from(&mut bytes.as_slice()).is_err());
    }

    proptest! {
        #[test]
        fn prop_state_roundtrip(
            archived in 1i64..1_000_000,
            gap in 1i64..1_000,
            index in proptest::option::of(0usize..100_000),
            slot in 0i32..1_000,
            slope1 in -1.0e6f64..1.0e6,
            slope2 in -1.0e6f64..1.0e6,
        ) {
            let mut state = CompressionState::new(3);
            state.archived = point(archived, 1.0);
            state.previous = point(archived + gap, 2.0);
            state.current = point(archived + 2 * gap, 3.0);
            state.active_block_index = index;
            state.active_block_slot = slot;
            state.slope1 = slope1;
            state.slope2 = slope2;

            let mut buf = Vec::new();
            state.write_to(&mut buf).unwrap();
            let decoded = CompressionState::read_from(&mut buf.as_slice()).unwrap();
            prop_assert_eq!(decoded, state);
            prop_assert_eq!(decoded.current.value, 3.0);
        }
    }
}
