//! Collaborator stores consumed by the archive.
//!
//! The archive reads per-series configuration from a [`MetadataStore`],
//! keeps one [`CompressionState`] per series in a [`StateStore`], and shares
//! file-level counters with other processes through a [`CoordinationStore`].
//! In-memory implementations live in [`memory`]; [`StateFile`] keeps states
//! in a file of fixed-size records.

pub mod memory;
pub mod state_file;

pub use memory::{InMemoryCoordinationStore, InMemoryMetadataStore, InMemoryStateStore};
pub use state_file::StateFile;

use crate::compression::state::CompressionState;
use crate::error::Result;
use crate::format::{HistorianId, TimeTag};

/// Kind of values a series carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataType {
    /// Continuous values.
    #[default]
    Analog,
    /// Discrete states.
    Digital,
}

/// Range, alarm and warning thresholds of an analog series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalogLimits {
    /// Values at or above are unreasonable.
    pub high_range: f32,
    /// Values at or below are unreasonable.
    pub low_range: f32,
    /// High-high alarm threshold.
    pub high_alarm: f32,
    /// Low-low alarm threshold.
    pub low_alarm: f32,
    /// High alarm threshold.
    pub high_warning: f32,
    /// Low alarm threshold.
    pub low_warning: f32,
}

impl Default for AnalogLimits {
    fn default() -> Self {
        Self {
            high_range: f32::MAX,
            low_range: f32::MIN,
            high_alarm: f32::MAX,
            low_alarm: f32::MIN,
            high_warning: f32::MAX,
            low_warning: f32::MIN,
        }
    }
}

/// Per-series configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRecord {
    /// Series the record describes.
    pub historian_id: HistorianId,
    /// Display name.
    pub name: String,
    /// Disabled series are reported as orphan data.
    pub enabled: bool,
    /// Analog or digital.
    pub data_type: DataType,
    /// Compression corridor half-width for analog series.
    pub compression_limit: f32,
    /// Minimum seconds between archived samples (0 = none).
    pub compression_min_time: i32,
    /// Maximum seconds between archived samples (0 = none).
    pub compression_max_time: i32,
    /// Analog thresholds.
    pub analog: AnalogLimits,
    /// Digital value that signals an alarm.
    pub digital_alarm_state: i32,
    /// Enables quality-based alarm notification.
    pub alarm_enabled: bool,
    /// Qualities that raise an alarm, one bit per quality.
    pub alarm_flags: u32,
    /// Seconds an alarm quality must persist before notification.
    pub alarm_delay: f32,
}

impl MetadataRecord {
    /// Creates an enabled analog series with no compression limit.
    pub fn new(historian_id: HistorianId, name: impl Into<String>) -> Self {
        Self {
            historian_id,
            name: name.into(),
            enabled: true,
            data_type: DataType::Analog,
            compression_limit: 0.0,
            compression_min_time: 0,
            compression_max_time: 0,
            analog: AnalogLimits::default(),
            digital_alarm_state: 0,
            alarm_enabled: false,
            alarm_flags: 0,
            alarm_delay: 0.0,
        }
    }

    /// Sets the enabled flag.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the data type.
    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    /// Sets the compression corridor half-width.
    pub fn with_compression_limit(mut self, limit: f32) -> Self {
        self.compression_limit = limit;
        self
    }

    /// Sets the minimum and maximum seconds between archived samples.
    pub fn with_compression_times(mut self, min_time: i32, max_time: i32) -> Self {
        self.compression_min_time = min_time;
        self.compression_max_time = max_time;
        self
    }

    /// Sets the analog thresholds.
    pub fn with_analog_limits(mut self, limits: AnalogLimits) -> Self {
        self.analog = limits;
        self
    }

    /// Sets the digital alarm state.
    pub fn with_digital_alarm_state(mut self, state: i32) -> Self {
        self.digital_alarm_state = state;
        self
    }

    /// Enables alarm notification for the qualities in `flags` after
    /// `delay` seconds.
    pub fn with_alarms(mut self, flags: u32, delay: f32) -> Self {
        self.alarm_enabled = true;
        self.alarm_flags = flags;
        self.alarm_delay = delay;
        self
    }
}

/// Cross-process counters shared by everything writing the active file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoordinationRecord {
    /// Blocks allocated in the active file.
    pub blocks_used: usize,
    /// Set while a rollover is running.
    pub rollover_in_progress: bool,
    /// Series of the newest sample seen.
    pub latest_point_id: Option<HistorianId>,
    /// Time of the newest sample seen.
    pub latest_point_time: TimeTag,
}

/// Read-only source of per-series configuration.
pub trait MetadataStore: Send + Sync {
    /// Returns the record of `historian_id`.
    fn read(&self, historian_id: HistorianId) -> Result<Option<MetadataRecord>>;

    /// Stores `record`.
    fn write(&self, record: MetadataRecord) -> Result<()>;
}

/// Persistence of per-series compression state.
pub trait StateStore: Send + Sync {
    /// Returns the state of `historian_id`.
    fn read(&self, historian_id: HistorianId) -> Result<Option<CompressionState>>;

    /// Stores `state`.
    fn write(&self, state: CompressionState) -> Result<()>;

    /// Returns every historian ID with a stored state.
    fn ids(&self) -> Result<Vec<HistorianId>>;

    /// Flushes pending writes.
    fn save(&self) -> Result<()> {
        Ok(())
    }
}

/// Access to the shared coordination record.
pub trait CoordinationStore: Send + Sync {
    /// Returns the current record.
    fn read(&self) -> Result<CoordinationRecord>;

    /// Replaces the record.
    fn write(&self, record: CoordinationRecord) -> Result<()>;
}
