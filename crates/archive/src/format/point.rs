//! Fixed 10-byte sample record.

use crate::format::{le_f32, le_i16, le_i32, HistorianId, Quality, TimeTag};
use std::cmp::Ordering;

/// Encoded size of a [`PointRecord`] in bytes.
pub const RECORD_SIZE: usize = 10;

/// Bit offset of the milliseconds within the record flags.
const MILLIS_SHIFT: u16 = 5;

/// One archived sample.
///
/// Binary layout (little-endian, 10 bytes):
///
/// ```text
/// ┌──────────────────┬────────────────────────────┬──────────────┐
/// │ seconds: i32 (4) │ flags: i16 (2)             │ value: f32(4)│
/// │                  │ bits 0-4 quality           │              │
/// │                  │ bits 5-15 milliseconds     │              │
/// └──────────────────┴────────────────────────────┴──────────────┘
/// ```
///
/// The historian ID is not stored; it is implied by the owning data block.
/// Records compare and order by `(historian_id, time)` only.
#[derive(Debug, Clone, Copy)]
pub struct PointRecord {
    /// Historian ID of the series the sample belongs to.
    pub historian_id: HistorianId,
    /// Sample time.
    pub time: TimeTag,
    /// Sample value.
    pub value: f32,
    /// Sample quality.
    pub quality: Quality,
}

impl PointRecord {
    /// Creates a new record.
    pub fn new(historian_id: HistorianId, time: TimeTag, value: f32, quality: Quality) -> Self {
        Self {
            historian_id,
            time,
            value,
            quality,
        }
    }

    /// Returns the empty sentinel for `historian_id`: zero time, zero value,
    /// `Quality::Unknown`.
    pub fn empty(historian_id: HistorianId) -> Self {
        Self::new(historian_id, TimeTag::MIN, 0.0, Quality::Unknown)
    }

    /// Returns true if the record matches the empty sentinel.
    ///
    /// A genuine sample taken at the archive epoch with value zero and unknown
    /// quality matches too; block scans treat it as end-of-data.
    pub fn is_empty(&self) -> bool {
        self.time.is_min() && self.value == 0.0 && self.quality == Quality::Unknown
    }

    /// Encodes the record into its 10-byte form.
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encodes the record into the first 10 bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`RECORD_SIZE`].
    pub fn encode_into(&self, buf: &mut [u8]) {
        let flags = (self.time.subsec_millis() << MILLIS_SHIFT) | self.quality.bits() as u16;
        // Seconds (4 bytes)
        buf[0..4].copy_from_slice(&self.time.whole_seconds().to_le_bytes());
        // Flags (2 bytes)
        buf[4..6].copy_from_slice(&(flags as i16).to_le_bytes());
        // Value (4 bytes)
        buf[6..10].copy_from_slice(&self.value.to_le_bytes());
    }

    /// Decodes a record from the start of `buf`.
    ///
    /// Returns `None` when `buf` holds fewer than [`RECORD_SIZE`] bytes; no
    /// input is consumed in that case.
    pub fn decode(historian_id: HistorianId, buf: &[u8]) -> Option<Self> {
        if buf.len() < RECORD_SIZE {
            return None;
        }
        let seconds = le_i32(&buf[0..4]) as i64;
        let flags = le_i16(&buf[4..6]) as u16;
        let value = le_f32(&buf[6..10]);

        let millis = ((flags >> MILLIS_SHIFT) as i64).min(999);
        let quality = Quality::from_bits((flags & Quality::MASK) as u8);
        Some(Self {
            historian_id,
            time: TimeTag::from_millis_saturating(seconds * 1000 + millis),
            value,
            quality,
        })
    }
}

impl PartialEq for PointRecord {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PointRecord {}

impl PartialOrd for PointRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PointRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.historian_id
            .cmp(&other.historian_id)
            .then(self.time.cmp(&other.time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn quality_strategy() -> impl Strategy<Value = Quality> {
        (0u8..32)
            .prop_filter("undefined quality", |bits| *bits != 30)
            .prop_map(Quality::from_bits)
    }

    #[test]
    fn test_empty_sentinel_is_all_zero() {
        let empty = PointRecord::empty(7);
        assert!(empty.is_empty());
        assert_eq!(empty.to_bytes(), [0u8; RECORD_SIZE]);

        let decoded = PointRecord::decode(7, &[0u8; RECORD_SIZE]).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_layout() {
        let time = TimeTag::from_millis(3_000_123).unwrap();
        let record = PointRecord::new(1, time, 1.5, Quality::Good);
        let bytes = record.to_bytes();

        assert_eq!(&bytes[0..4], &3000i32.to_le_bytes());
        let flags = u16::from_le_bytes([bytes[4], bytes[5]]);
        assert_eq!(flags & 0x1F, Quality::Good.bits() as u16);
        assert_eq!(flags >> 5, 123);
        assert_eq!(&bytes[6..10], &1.5f32.to_le_bytes());
    }

    #[test]
    fn test_decode_short_input() {
        assert!(PointRecord::decode(1, &[0u8; RECORD_SIZE - 1]).is_none());
        assert!(PointRecord::decode(1, &[]).is_none());
    }

    #[test]
    fn test_ordering_ignores_value() {
        let t1 = TimeTag::from_millis(1_000).unwrap();
        let t2 = TimeTag::from_millis(2_000).unwrap();
        let a = PointRecord::new(1, t1, 1.0, Quality::Good);
        let b = PointRecord::new(1, t1, 9.0, Quality::Old);
        let c = PointRecord::new(1, t2, 0.0, Quality::Good);
        let d = PointRecord::new(2, t1, 0.0, Quality::Good);

        assert_eq!(a, b);
        assert!(a < c);
        assert!(c < d);
    }

    proptest! {
        #[test]
        fn prop_point_record_roundtrip(
            millis in 0i64..=TimeTag::MAX.as_millis(),
            value in any::<f32>(),
            quality in quality_strategy(),
        ) {
            let time = TimeTag::from_millis(millis).unwrap();
            let record = PointRecord::new(42, time, value, quality);
            let decoded = PointRecord::decode(42, &record.to_bytes()).unwrap();

            prop_assert_eq!(decoded.historian_id, 42);
            prop_assert_eq!(decoded.time, time);
            prop_assert_eq!(decoded.value.to_bits(), value.to_bits());
            prop_assert_eq!(decoded.quality, quality);
        }
    }
}
