//! On-disk format of archive files.
//!
//! An archive file is a fixed-size region of equally sized data blocks,
//! followed by the block pointer table and a fixed trailer. Each data block
//! belongs to a single historian ID and holds its samples in append order.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Data Blocks (block_count * block_size bytes)                 │
//! │  - block i starts at i * block_size                           │
//! │  - 10-byte PointRecords, terminated by the empty sentinel     │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Block Pointer Table (block_count * 12 bytes)                 │
//! │  - historian ID: i32 (-1 = free)                              │
//! │  - block start time: f64 seconds                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │  FAT Trailer (48 bytes)                                       │
//! │  - Magic "AFAT", version, file span, counters, CRC32          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The trailer is found from the end of the file, so block locations need
//! no header offset.

pub mod block;
pub mod fat;
pub mod handle;
pub mod point;
pub mod pointer;

pub use block::{BlockScan, DataBlock};
pub use fat::AllocationTable;
pub use handle::ArchiveFileHandle;
pub use point::PointRecord;
pub use pointer::BlockPointer;

use crate::error::{ArchiveError, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::time::Duration;

/// Stable integer identifying one time series channel.
pub type HistorianId = i32;

/// Historian ID stored in free block pointers.
pub const FREE_HISTORIAN_ID: HistorianId = -1;

/// Unix timestamp (seconds) of the archive epoch, 1995-01-01T00:00:00Z.
pub const EPOCH_UNIX_SECONDS: i64 = 788_918_400;

const MILLIS_PER_SECOND: i64 = 1000;

/// Fixed-point archive timestamp.
///
/// Stored as milliseconds since 1995-01-01T00:00:00Z. The representable
/// range ends at the last millisecond whose whole-second part still fits an
/// `i32`, which falls on 2063-01-19.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimeTag(i64);

impl TimeTag {
    /// The archive epoch. Free block pointers carry this time.
    pub const MIN: TimeTag = TimeTag(0);

    /// Last representable instant.
    pub const MAX: TimeTag = TimeTag(i32::MAX as i64 * MILLIS_PER_SECOND + 999);

    /// Creates a time tag from milliseconds since the archive epoch.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::TimeOutOfRange` if `millis` is outside
    /// `[MIN, MAX]`.
    pub fn from_millis(millis: i64) -> Result<Self> {
        if !(Self::MIN.0..=Self::MAX.0).contains(&millis) {
            return Err(ArchiveError::TimeOutOfRange(
                millis as f64 / MILLIS_PER_SECOND as f64,
            ));
        }
        Ok(Self(millis))
    }

    /// Creates a time tag from milliseconds, clamping into range.
    pub fn from_millis_saturating(millis: i64) -> Self {
        Self(millis.clamp(Self::MIN.0, Self::MAX.0))
    }

    /// Creates a time tag from fractional seconds since the archive epoch,
    /// rounded to the nearest millisecond.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::TimeOutOfRange` for non-finite or out of range
    /// values.
    pub fn from_seconds(seconds: f64) -> Result<Self> {
        if !seconds.is_finite() {
            return Err(ArchiveError::TimeOutOfRange(seconds));
        }
        let millis = (seconds * MILLIS_PER_SECOND as f64).round();
        if millis < Self::MIN.0 as f64 || millis > Self::MAX.0 as f64 {
            return Err(ArchiveError::TimeOutOfRange(seconds));
        }
        Ok(Self(millis as i64))
    }

    /// Creates a time tag from a UTC date time.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::TimeOutOfRange` if the instant predates 1995 or
    /// follows 2063-01-19.
    pub fn from_datetime(datetime: DateTime<Utc>) -> Result<Self> {
        let millis = datetime.timestamp_millis() - EPOCH_UNIX_SECONDS * MILLIS_PER_SECOND;
        Self::from_millis(millis)
    }

    /// Returns the current wall clock time, clamped into range.
    pub fn now() -> Self {
        let millis = Utc::now().timestamp_millis() - EPOCH_UNIX_SECONDS * MILLIS_PER_SECOND;
        Self::from_millis_saturating(millis)
    }

    /// Milliseconds since the archive epoch.
    pub fn as_millis(self) -> i64 {
        self.0
    }

    /// Fractional seconds since the archive epoch.
    pub fn as_seconds(self) -> f64 {
        self.0 as f64 / MILLIS_PER_SECOND as f64
    }

    /// Whole seconds since the archive epoch.
    pub fn whole_seconds(self) -> i32 {
        (self.0 / MILLIS_PER_SECOND) as i32
    }

    /// Millisecond part of the time (0..=999).
    pub fn subsec_millis(self) -> u16 {
        (self.0 % MILLIS_PER_SECOND) as u16
    }

    /// Returns true for the archive epoch, the "unset" time.
    pub fn is_min(self) -> bool {
        self == Self::MIN
    }

    /// Adds a duration, saturating at `MAX`.
    pub fn saturating_add(self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self::from_millis_saturating(self.0.saturating_add(millis))
    }

    /// Subtracts a duration, saturating at `MIN`.
    pub fn saturating_sub(self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self::from_millis_saturating(self.0.saturating_sub(millis))
    }

    /// Converts to a UTC date time.
    pub fn to_datetime(self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(EPOCH_UNIX_SECONDS * MILLIS_PER_SECOND + self.0)
            .single()
            .unwrap_or_default()
    }
}

impl fmt::Display for TimeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

/// Quality of a sample, stored in the low 5 bits of the record flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Quality {
    /// Quality is not known.
    #[default]
    Unknown = 0,
    /// Point was deleted from processing.
    DeletedFromProcessing = 1,
    /// Calculated value could not be produced.
    CouldNotCalculate = 2,
    /// Front-end hardware reported an error.
    FrontEndHardwareError = 3,
    /// Sensor read failed.
    SensorReadError = 4,
    /// Thermocouple is open.
    OpenThermocouple = 5,
    /// Input counts are outside the sensor range.
    InputCountsOutOfSensorRange = 6,
    /// Value is above the reasonable range.
    UnreasonableHigh = 7,
    /// Value is below the reasonable range.
    UnreasonableLow = 8,
    /// Value is stale.
    Old = 9,
    /// Suspect value above the high-high limit.
    SuspectValueAboveHiHiLimit = 10,
    /// Suspect value below the low-low limit.
    SuspectValueBelowLoLoLimit = 11,
    /// Suspect value above the high limit.
    SuspectValueAboveHiLimit = 12,
    /// Suspect value below the low limit.
    SuspectValueBelowLoLimit = 13,
    /// Data is suspect.
    SuspectData = 14,
    /// Digital point in suspect alarm.
    DigitalSuspectAlarm = 15,
    /// Inserted value above the high-high limit.
    InsertedValueAboveHiHiLimit = 16,
    /// Inserted value below the low-low limit.
    InsertedValueBelowLoLoLimit = 17,
    /// Inserted value above the high limit.
    InsertedValueAboveHiLimit = 18,
    /// Inserted value below the low limit.
    InsertedValueBelowLoLimit = 19,
    /// Value was inserted manually.
    InsertedValue = 20,
    /// Inserted digital status is in alarm.
    DigitalInsertedStatusInAlarm = 21,
    /// Digital point is in its alarm state.
    LogicalAlarm = 22,
    /// Value above the high-high alarm.
    ValueAboveHiHiAlarm = 23,
    /// Value below the low-low alarm.
    ValueBelowLoLoAlarm = 24,
    /// Value above the high alarm.
    ValueAboveHiAlarm = 25,
    /// Value below the low alarm.
    ValueBelowLoAlarm = 26,
    /// Point was removed from alarm checks.
    DeletedFromAlarmChecks = 27,
    /// Alarm inhibited by a cutout point.
    InhibitedByCutoutPoint = 28,
    /// Value is good.
    Good = 29,
    /// No quality assigned; the write pipeline classifies it.
    NotSet = 31,
}

impl Quality {
    /// Bit mask of the quality field within the record flags.
    pub const MASK: u16 = 0x1F;

    /// Decodes the 5-bit quality field. The undefined value 30 maps to
    /// `Unknown`.
    pub fn from_bits(bits: u8) -> Self {
        match bits & Self::MASK as u8 {
            1 => Self::DeletedFromProcessing,
            2 => Self::CouldNotCalculate,
            3 => Self::FrontEndHardwareError,
            4 => Self::SensorReadError,
            5 => Self::OpenThermocouple,
            6 => Self::InputCountsOutOfSensorRange,
            7 => Self::UnreasonableHigh,
            8 => Self::UnreasonableLow,
            9 => Self::Old,
            10 => Self::SuspectValueAboveHiHiLimit,
            11 => Self::SuspectValueBelowLoLoLimit,
            12 => Self::SuspectValueAboveHiLimit,
            13 => Self::SuspectValueBelowLoLimit,
            14 => Self::SuspectData,
            15 => Self::DigitalSuspectAlarm,
            16 => Self::InsertedValueAboveHiHiLimit,
            17 => Self::InsertedValueBelowLoLoLimit,
            18 => Self::InsertedValueAboveHiLimit,
            19 => Self::InsertedValueBelowLoLimit,
            20 => Self::InsertedValue,
            21 => Self::DigitalInsertedStatusInAlarm,
            22 => Self::LogicalAlarm,
            23 => Self::ValueAboveHiHiAlarm,
            24 => Self::ValueBelowLoLoAlarm,
            25 => Self::ValueAboveHiAlarm,
            26 => Self::ValueBelowLoAlarm,
            27 => Self::DeletedFromAlarmChecks,
            28 => Self::InhibitedByCutoutPoint,
            29 => Self::Good,
            31 => Self::NotSet,
            _ => Self::Unknown,
        }
    }

    /// Returns the 5-bit encoding.
    pub fn bits(self) -> u8 {
        self as u8
    }

    /// Returns the bit used for this quality in an alarm-flag mask.
    pub fn alarm_flag(self) -> u32 {
        1u32 << self.bits()
    }
}

pub(crate) fn le_i32(bytes: &[u8]) -> i32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    i32::from_le_bytes(buf)
}

pub(crate) fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

pub(crate) fn le_i16(bytes: &[u8]) -> i16 {
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&bytes[..2]);
    i16::from_le_bytes(buf)
}

pub(crate) fn le_u16(bytes: &[u8]) -> u16 {
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&bytes[..2]);
    u16::from_le_bytes(buf)
}

pub(crate) fn le_f32(bytes: &[u8]) -> f32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    f32::from_le_bytes(buf)
}

pub(crate) fn le_f64(bytes: &[u8]) -> f64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    f64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_tag_bounds() {
        assert!(TimeTag::from_millis(-1).is_err());
        assert!(TimeTag::from_millis(TimeTag::MAX.as_millis() + 1).is_err());
        assert_eq!(TimeTag::MAX.whole_seconds(), i32::MAX);

        let last = TimeTag::MAX.to_datetime();
        assert_eq!(last.format("%Y-%m-%d").to_string(), "2063-01-19");
        assert_eq!(TimeTag::MIN.to_string(), "1995-01-01 00:00:00.000");
    }

    #[test]
    fn test_time_tag_seconds_roundtrip() {
        let tag = TimeTag::from_seconds(100.25).unwrap();
        assert_eq!(tag.as_millis(), 100_250);
        assert_eq!(tag.whole_seconds(), 100);
        assert_eq!(tag.subsec_millis(), 250);
        assert_eq!(tag.as_seconds(), 100.25);

        assert!(TimeTag::from_seconds(f64::NAN).is_err());
        assert!(TimeTag::from_seconds(-0.5).is_err());
    }

    #[test]
    fn test_time_tag_datetime_roundtrip() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 15).unwrap();
        let tag = TimeTag::from_datetime(dt).unwrap();
        assert_eq!(tag.to_datetime(), dt);

        let too_early = Utc.with_ymd_and_hms(1994, 12, 31, 23, 59, 59).unwrap();
        assert!(TimeTag::from_datetime(too_early).is_err());
    }

    #[test]
    fn test_quality_bits() {
        for bits in 0u8..32 {
            let quality = Quality::from_bits(bits);
            if bits == 30 {
                assert_eq!(quality, Quality::Unknown);
            } else {
                assert_eq!(quality.bits(), bits);
            }
        }
        assert_eq!(Quality::Good.bits(), 29);
        assert_eq!(Quality::NotSet.bits(), 31);
    }
}
