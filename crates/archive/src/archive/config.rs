//! Archive configuration.

use crate::error::{ArchiveError, Result};
use crate::format::handle::SyncMode;
use crate::format::point::RECORD_SIZE;
use crate::lifecycle::offload::OffloadLocation;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default size of the active file (1500 MiB).
pub const DEFAULT_FILE_SIZE: u64 = 1500 * 1024 * 1024;

/// Default data block size (8 KiB).
pub const DEFAULT_BLOCK_SIZE: u32 = 8 * 1024;

/// Default usage percentage that starts standby preparation.
pub const DEFAULT_ROLLOVER_PREPARATION_THRESHOLD: f64 = 75.0;

/// Default tolerance for samples timestamped in the future.
pub const DEFAULT_LEAD_TIME_TOLERANCE: Duration = Duration::from_secs(15 * 60);

/// Default number of historic files offloaded per pass.
pub const DEFAULT_OFFLOAD_COUNT: usize = 5;

/// Default disk usage percentage that triggers offload.
pub const DEFAULT_OFFLOAD_THRESHOLD: f64 = 90.0;

/// Default interval between idle block checks.
pub const DEFAULT_BLOCK_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Default idle time after which cached blocks are released.
pub const DEFAULT_BLOCK_INACTIVITY: Duration = Duration::from_secs(300);

/// Default wait for exclusive access before renaming the active file.
pub const DEFAULT_RENAME_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Default wait for readers to release a file being retired.
pub const DEFAULT_READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Configuration of an [`ArchiveFile`](super::ArchiveFile).
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Path of the active file. Must use the `.d` extension.
    pub file_path: PathBuf,
    /// Size of new archive files in bytes.
    pub file_size: u64,
    /// Size of one data block in bytes.
    pub block_size: u32,
    /// Usage percentage at which a standby file is prepared.
    pub rollover_preparation_threshold: f64,
    /// Roll over instead of failing when the active file is full.
    pub rollover_on_full: bool,
    /// Apply swinging-door compression.
    pub compress_data: bool,
    /// Drop out-of-sequence samples instead of queueing them.
    pub discard_out_of_sequence: bool,
    /// How far into the future a sample may be timestamped.
    pub lead_time_tolerance: Duration,
    /// Where offloaded historic files go.
    pub offload_location: OffloadLocation,
    /// Number of historic files offloaded when disk space runs low.
    pub offload_count: usize,
    /// Disk usage percentage of the primary volume that triggers offload.
    pub offload_threshold: f64,
    /// Historic files older than this are offloaded regardless of space.
    pub offload_max_age: Option<Duration>,
    /// Oldest historic files beyond this count are deleted.
    pub max_historic_files: Option<usize>,
    /// Release idle cached blocks periodically.
    pub conserve_memory: bool,
    /// Interval between idle block checks.
    pub block_check_interval: Duration,
    /// Idle time after which a cached block is released.
    pub block_inactivity: Duration,
    /// Wait for exclusive access before renaming the active file.
    pub rename_lock_timeout: Duration,
    /// Wait for readers to release a file being retired.
    pub reader_drain_timeout: Duration,
    /// Durability of file writes.
    pub sync_mode: SyncMode,
    /// Capacity of the event channel.
    pub event_capacity: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            file_path: PathBuf::new(),
            file_size: DEFAULT_FILE_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            rollover_preparation_threshold: DEFAULT_ROLLOVER_PREPARATION_THRESHOLD,
            rollover_on_full: true,
            compress_data: true,
            discard_out_of_sequence: true,
            lead_time_tolerance: DEFAULT_LEAD_TIME_TOLERANCE,
            offload_location: OffloadLocation::None,
            offload_count: DEFAULT_OFFLOAD_COUNT,
            offload_threshold: DEFAULT_OFFLOAD_THRESHOLD,
            offload_max_age: None,
            max_historic_files: None,
            conserve_memory: true,
            block_check_interval: DEFAULT_BLOCK_CHECK_INTERVAL,
            block_inactivity: DEFAULT_BLOCK_INACTIVITY,
            rename_lock_timeout: DEFAULT_RENAME_LOCK_TIMEOUT,
            reader_drain_timeout: DEFAULT_READER_DRAIN_TIMEOUT,
            sync_mode: SyncMode::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ArchiveConfig {
    /// Creates a default configuration for the active file at `file_path`.
    pub fn new(file_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: file_path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Sets the file and block sizes in bytes.
    pub fn with_sizes(mut self, file_size: u64, block_size: u32) -> Self {
        self.file_size = file_size;
        self.block_size = block_size;
        self
    }

    /// Sets the file size as a number of blocks of `block_size` bytes.
    pub fn with_blocks(self, block_count: u64, block_size: u32) -> Self {
        self.with_sizes(block_count * block_size as u64, block_size)
    }

    /// Sets the standby preparation threshold in percent.
    pub fn with_rollover_preparation_threshold(mut self, percent: f64) -> Self {
        self.rollover_preparation_threshold = percent;
        self
    }

    /// Sets whether a full file rolls over.
    pub fn with_rollover_on_full(mut self, enabled: bool) -> Self {
        self.rollover_on_full = enabled;
        self
    }

    /// Sets whether samples are compressed.
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compress_data = enabled;
        self
    }

    /// Sets whether out-of-sequence samples are discarded.
    pub fn with_discard_out_of_sequence(mut self, discard: bool) -> Self {
        self.discard_out_of_sequence = discard;
        self
    }

    /// Sets the tolerance for future timestamps.
    pub fn with_lead_time_tolerance(mut self, tolerance: Duration) -> Self {
        self.lead_time_tolerance = tolerance;
        self
    }

    /// Sets the offload target.
    pub fn with_offload(mut self, location: OffloadLocation, count: usize, threshold: f64) -> Self {
        self.offload_location = location;
        self.offload_count = count;
        self.offload_threshold = threshold;
        self
    }

    /// Offloads historic files older than `max_age`.
    pub fn with_offload_max_age(mut self, max_age: Duration) -> Self {
        self.offload_max_age = Some(max_age);
        self
    }

    /// Keeps at most `count` historic files.
    pub fn with_max_historic_files(mut self, count: usize) -> Self {
        self.max_historic_files = Some(count);
        self
    }

    /// Configures release of idle cached blocks.
    pub fn with_memory_conservation(
        mut self,
        enabled: bool,
        check_interval: Duration,
        inactivity: Duration,
    ) -> Self {
        self.conserve_memory = enabled;
        self.block_check_interval = check_interval;
        self.block_inactivity = inactivity;
        self
    }

    /// Sets the rename lock timeout.
    pub fn with_rename_lock_timeout(mut self, timeout: Duration) -> Self {
        self.rename_lock_timeout = timeout;
        self
    }

    /// Sets the sync mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Sets the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Number of data blocks in a new file.
    pub fn block_count(&self) -> usize {
        if self.block_size == 0 {
            return 0;
        }
        (self.file_size / self.block_size as u64) as usize
    }

    /// Checks the configuration for values that can never work.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::InvalidInput` describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.file_path.as_os_str().is_empty() {
            return Err(invalid("file_path must be set"));
        }
        if (self.block_size as usize) < RECORD_SIZE {
            return Err(invalid(format!(
                "block_size {} is smaller than one {RECORD_SIZE}-byte record",
                self.block_size
            )));
        }
        if self.file_size < self.block_size as u64 {
            return Err(invalid(format!(
                "file_size {} is smaller than one {}-byte block",
                self.file_size, self.block_size
            )));
        }
        if self.block_count() > i32::MAX as usize {
            return Err(invalid(format!(
                "file_size {} holds too many blocks",
                self.file_size
            )));
        }
        for (name, value) in [
            (
                "rollover_preparation_threshold",
                self.rollover_preparation_threshold,
            ),
            ("offload_threshold", self.offload_threshold),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(invalid(format!("{name} {value} must be in (0, 100]")));
            }
        }
        if self.event_capacity == 0 {
            return Err(invalid("event_capacity must be positive"));
        }
        if self.conserve_memory && self.block_check_interval.is_zero() {
            return Err(invalid("block_check_interval must be positive"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ArchiveError {
    ArchiveError::InvalidInput(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ArchiveConfig::new("/data/archive.d");
        assert_eq!(config.file_size, 1500 * 1024 * 1024);
        assert_eq!(config.block_size, 8192);
        assert_eq!(config.block_count(), 192_000);
        assert_eq!(config.rollover_preparation_threshold, 75.0);
        assert!(config.rollover_on_full);
        assert!(config.discard_out_of_sequence);
        assert_eq!(config.offload_location, OffloadLocation::None);
        assert_eq!(config.sync_mode, SyncMode::None);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ArchiveConfig::default().validate().is_err());

        let base = ArchiveConfig::new("archive.d");
        assert!(base.clone().with_sizes(100, 5).validate().is_err());
        assert!(base.clone().with_sizes(50, 100).validate().is_err());
        assert!(base
            .clone()
            .with_rollover_preparation_threshold(0.0)
            .validate()
            .is_err());
        assert!(base
            .clone()
            .with_offload(OffloadLocation::Delete, 1, 120.0)
            .validate()
            .is_err());
        assert!(base.clone().with_event_capacity(0).validate().is_err());
        base.with_blocks(4, 100).validate().unwrap();
    }
}
