//! Usage and throughput statistics.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Length of the window over which write speed is averaged.
pub const DEFAULT_AVERAGING_WINDOW: Duration = Duration::from_secs(60);

/// Snapshot returned by [`ArchiveFile::statistics`](super::ArchiveFile::statistics).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArchiveStatistics {
    /// Allocated blocks as a percentage of all blocks.
    pub file_usage: f64,
    /// Samples not archived as a percentage of samples received.
    pub compression_ratio: f64,
    /// Time covered by `average_write_speed`.
    pub averaging_window: Duration,
    /// Samples received per second over `averaging_window`.
    pub average_write_speed: f64,
    /// Samples received by the active file.
    pub points_received: u32,
    /// Samples archived in the active file.
    pub points_archived: u32,
    /// Allocated blocks in the active file.
    pub blocks_used: usize,
    /// Total blocks in the active file.
    pub block_count: usize,
}

impl ArchiveStatistics {
    /// Derives a snapshot from file counters and a measured write speed.
    pub fn from_counters(
        points_received: u32,
        points_archived: u32,
        blocks_used: usize,
        block_count: usize,
        (averaging_window, average_write_speed): (Duration, f64),
    ) -> Self {
        let file_usage = if block_count == 0 {
            0.0
        } else {
            blocks_used as f64 * 100.0 / block_count as f64
        };
        let compression_ratio = if points_received == 0 {
            0.0
        } else {
            (1.0 - points_archived as f64 / points_received as f64) * 100.0
        };
        Self {
            file_usage,
            compression_ratio,
            averaging_window,
            average_write_speed,
            points_received,
            points_archived,
            blocks_used,
            block_count,
        }
    }
}

#[derive(Debug)]
struct MeterWindow {
    started: Instant,
    points: u64,
    last: Option<(Duration, f64)>,
}

/// Write speed averaged over fixed windows.
///
/// While the first window fills, the speed so far is reported. Afterwards
/// the last completed window is reported.
#[derive(Debug)]
pub struct WriteSpeedMeter {
    window: Duration,
    state: Mutex<MeterWindow>,
}

impl Default for WriteSpeedMeter {
    fn default() -> Self {
        Self::new(DEFAULT_AVERAGING_WINDOW)
    }
}

impl WriteSpeedMeter {
    /// Creates a meter averaging over `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(MeterWindow {
                started: Instant::now(),
                points: 0,
                last: None,
            }),
        }
    }

    /// Counts `points` received samples.
    pub fn record(&self, points: u64) {
        let mut state = self.state.lock();
        self.roll(&mut state);
        state.points += points;
    }

    /// Returns the averaging window and the samples per second in it.
    pub fn current(&self) -> (Duration, f64) {
        let mut state = self.state.lock();
        self.roll(&mut state);
        if let Some(last) = state.last {
            return last;
        }
        let elapsed = state.started.elapsed();
        let seconds = elapsed.as_secs_f64();
        let speed = if seconds > 0.0 {
            state.points as f64 / seconds
        } else {
            0.0
        };
        (elapsed, speed)
    }

    fn roll(&self, state: &mut MeterWindow) {
        let elapsed = state.started.elapsed();
        if elapsed < self.window {
            return;
        }
        let speed = state.points as f64 / elapsed.as_secs_f64();
        state.last = Some((elapsed, speed));
        state.started = Instant::now();
        state.points = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_ratios() {
        let stats = ArchiveStatistics::from_counters(200, 50, 3, 12, (Duration::ZERO, 0.0));
        assert_eq!(stats.file_usage, 25.0);
        assert_eq!(stats.compression_ratio, 75.0);

        let empty = ArchiveStatistics::from_counters(0, 0, 0, 0, (Duration::ZERO, 0.0));
        assert_eq!(empty.file_usage, 0.0);
        assert_eq!(empty.compression_ratio, 0.0);
    }

    #[test]
    fn test_meter_reports_completed_window() {
        let meter = WriteSpeedMeter::new(Duration::from_millis(200));
        meter.record(10);
        assert!(meter.current().0 < Duration::from_millis(200));

        thread::sleep(Duration::from_millis(250));
        let (window, speed) = meter.current();
        assert!(window >= Duration::from_millis(200));
        assert!(speed > 0.0);

        // New samples land in the next window.
        meter.record(5);
        assert_eq!(meter.current().0, window);
    }
}
