//! Swinging-door compression of incoming samples.
//!
//! Each series moves through three phases:
//!
//! ```text
//! Empty ──first sample──▶ OneSample ──second sample──▶ SteadyState
//!  (archive it)            (seed corridor)              (test corridor)
//! ```
//!
//! In steady state the engine keeps two slopes from the last archived sample.
//! `slope1` only rises and `slope2` only falls; when the slope from the
//! archived sample to the newest sample leaves `(slope1, slope2)`, the sample
//! received just before it is archived and the corridor restarts from there.

pub mod state;

pub use state::{CompressionState, Sequence};

use crate::format::point::PointRecord;
use crate::format::{HistorianId, Quality, TimeTag};
use crate::store::{DataType, MetadataRecord};
use std::collections::HashMap;

/// Corridor half-width applied to digital series.
pub const DIGITAL_COMPRESSION_LIMIT: f64 = 0.000_000_001;

/// Classifies `value` against the thresholds in `metadata`.
///
/// Analog thresholds are tested from high to low: unreasonable-high,
/// alarm-high, warning-high, unreasonable-low, alarm-low, warning-low.
/// Digital values are in alarm when they equal the configured alarm state.
pub fn classify_quality(value: f32, metadata: &MetadataRecord) -> Quality {
    match metadata.data_type {
        DataType::Analog => {
            let limits = &metadata.analog;
            if value >= limits.high_range {
                Quality::UnreasonableHigh
            } else if value >= limits.high_alarm {
                Quality::ValueAboveHiHiAlarm
            } else if value >= limits.high_warning {
                Quality::ValueAboveHiAlarm
            } else if value <= limits.low_range {
                Quality::UnreasonableLow
            } else if value <= limits.low_alarm {
                Quality::ValueBelowLoLoAlarm
            } else if value <= limits.low_warning {
                Quality::ValueBelowLoAlarm
            } else {
                Quality::Good
            }
        }
        DataType::Digital => {
            if value as i32 == metadata.digital_alarm_state {
                Quality::LogicalAlarm
            } else {
                Quality::Good
            }
        }
    }
}

/// Corridor half-width of a series.
pub fn compression_limit(metadata: &MetadataRecord) -> f64 {
    match metadata.data_type {
        DataType::Analog => metadata.compression_limit as f64,
        DataType::Digital => DIGITAL_COMPRESSION_LIMIT,
    }
}

fn seconds_between(from: &PointRecord, to: &PointRecord) -> f64 {
    to.time.as_seconds() - from.time.as_seconds()
}

/// Tracks alarm qualities that must persist before notification.
#[derive(Debug, Default)]
pub struct AlarmTracker {
    pending: HashMap<HistorianId, TimeTag>,
}

impl AlarmTracker {
    /// Records `sample` and returns true when an alarm notification is due.
    ///
    /// An alarm quality with no delay notifies at once. With a delay, the
    /// first alarm sample starts a timer and a later alarm sample notifies
    /// once the delay has passed. Any non-alarm quality clears the timer.
    pub fn observe(&mut self, metadata: &MetadataRecord, sample: &PointRecord) -> bool {
        let id = sample.historian_id;
        if metadata.alarm_flags & sample.quality.alarm_flag() == 0 {
            self.pending.remove(&id);
            return false;
        }
        if metadata.alarm_delay <= 0.0 {
            return true;
        }
        match self.pending.get(&id) {
            Some(first) => {
                if sample.time.as_seconds() - first.as_seconds() > metadata.alarm_delay as f64 {
                    self.pending.remove(&id);
                    true
                } else {
                    false
                }
            }
            None => {
                self.pending.insert(id, sample.time);
                false
            }
        }
    }

    /// Number of series waiting out an alarm delay.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Result of feeding one sample to the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    /// Sample to archive, if any. This is the first sample of a series or
    /// the sample received before the one just evaluated.
    pub archive: Option<PointRecord>,
    /// True when an alarm notification is due for the series.
    pub alarm: bool,
}

/// Compression decisions for all series of an archive.
#[derive(Debug)]
pub struct CompressionEngine {
    compress_data: bool,
    alarms: AlarmTracker,
}

impl CompressionEngine {
    /// Creates an engine. With `compress_data` false every sample is
    /// archived, one sample behind.
    pub fn new(compress_data: bool) -> Self {
        Self {
            compress_data,
            alarms: AlarmTracker::default(),
        }
    }

    /// Returns true when samples are compressed.
    pub fn compresses(&self) -> bool {
        self.compress_data
    }

    /// Feeds `point` to the series state.
    ///
    /// The state is fully updated, including `archived` when a sample is
    /// returned for archival. Callers that fail to store the sample must
    /// discard the updated state.
    pub fn evaluate(
        &mut self,
        state: &mut CompressionState,
        point: PointRecord,
        metadata: &MetadataRecord,
    ) -> Evaluation {
        let limit = compression_limit(metadata);
        let mut archive = None;
        let mut reseed = false;
        let mut alarm = false;

        state.current = point;
        if state.archived.is_empty() {
            archive = Some(point);
            state.current = PointRecord::empty(point.historian_id);
        } else if state.previous.is_empty() {
            reseed = true;
        } else {
            if metadata.alarm_enabled {
                alarm = self.alarms.observe(metadata, &state.current);
            }

            if !self.compress_data {
                archive = Some(state.previous);
            } else if metadata.compression_min_time > 0
                && seconds_between(&state.archived, &state.current)
                    < metadata.compression_min_time as f64
            {
                // Too soon after the last archived sample.
            } else if state.current.quality != state.archived.quality
                || state.current.quality != state.previous.quality
                || (metadata.compression_max_time > 0
                    && seconds_between(&state.archived, &state.previous)
                        > metadata.compression_max_time as f64)
            {
                archive = Some(state.previous);
                reseed = true;
            } else {
                let elapsed = seconds_between(&state.archived, &state.current);
                let archived = state.archived.value as f64;
                let current = state.current.value as f64;
                let slope1 = (current - (archived + limit)) / elapsed;
                let slope2 = (current - (archived - limit)) / elapsed;
                let current_slope = (current - archived) / elapsed;

                if slope1 >= state.slope1 {
                    state.slope1 = slope1;
                }
                if slope2 <= state.slope2 {
                    state.slope2 = slope2;
                }
                if current_slope <= state.slope1 || current_slope >= state.slope2 {
                    archive = Some(state.previous);
                    reseed = true;
                }
            }
        }

        if let Some(sample) = archive {
            state.archived = sample;
        }
        if reseed {
            Self::reseed(state, limit);
        }
        state.previous = state.current;

        Evaluation { archive, alarm }
    }

    fn reseed(state: &mut CompressionState, limit: f64) {
        let elapsed = seconds_between(&state.archived, &state.current);
        if elapsed != 0.0 {
            let archived = state.archived.value as f64;
            let current = state.current.value as f64;
            state.slope1 = (current - (archived + limit)) / elapsed;
            state.slope2 = (current - (archived - limit)) / elapsed;
        } else {
            state.slope1 = 0.0;
            state.slope2 = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seconds: i64, value: f32, quality: Quality) -> PointRecord {
        PointRecord::new(1, TimeTag::from_millis(seconds * 1000).unwrap(), value, quality)
    }

    fn analog(limit: f32) -> MetadataRecord {
        MetadataRecord::new(1, "line").with_compression_limit(limit)
    }

    fn archived_times(
        engine: &mut CompressionEngine,
        state: &mut CompressionState,
        metadata: &MetadataRecord,
        samples: &[PointRecord],
    ) -> Vec<i64> {
        samples
            .iter()
            .filter_map(|p| engine.evaluate(state, *p, metadata).archive)
            .map(|p| p.time.whole_seconds() as i64)
            .collect()
    }

    #[test]
    fn test_linear_series_keeps_first_and_last() {
        let metadata = analog(0.5);
        let mut engine = CompressionEngine::new(true);
        let mut state = CompressionState::new(1);

        let mut samples: Vec<PointRecord> = (0..10)
            .map(|i| sample(100 + i, i as f32, Quality::Good))
            .collect();
        // A quality change flushes the pending sample.
        samples.push(sample(110, 10.0, Quality::Old));

        let archived = archived_times(&mut engine, &mut state, &metadata, &samples);
        assert_eq!(archived, vec![100, 109]);
    }

    #[test]
    fn test_outlier_archives_preceding_sample_and_reseeds() {
        let metadata = analog(0.5);
        let mut engine = CompressionEngine::new(true);
        let mut state = CompressionState::new(1);

        let mut samples: Vec<PointRecord> = (0..5)
            .map(|i| sample(100 + i, i as f32, Quality::Good))
            .collect();
        samples.push(sample(105, 15.0, Quality::Good));

        let archived = archived_times(&mut engine, &mut state, &metadata, &samples);
        assert_eq!(archived, vec![100, 104]);
        assert_eq!(state.archived.value, 4.0);
        assert_eq!(state.slope1, 10.5);
        assert_eq!(state.slope2, 11.5);
        assert_eq!(state.previous.time.whole_seconds(), 105);
    }

    #[test]
    fn test_second_sample_seeds_corridor() {
        let metadata = analog(1.0);
        let mut engine = CompressionEngine::new(true);
        let mut state = CompressionState::new(1);

        let first = engine.evaluate(&mut state, sample(10, 5.0, Quality::Good), &metadata);
        assert!(first.archive.is_some());
        assert!(state.previous.is_empty());

        let second = engine.evaluate(&mut state, sample(12, 9.0, Quality::Good), &metadata);
        assert!(second.archive.is_none());
        assert_eq!(state.slope1, 1.5);
        assert_eq!(state.slope2, 2.5);
        assert_eq!(state.previous.value, 9.0);
    }

    #[test]
    fn test_uncompressed_lags_one_sample() {
        let metadata = analog(100.0);
        let mut engine = CompressionEngine::new(false);
        let mut state = CompressionState::new(1);

        let samples: Vec<PointRecord> = (0..5)
            .map(|i| sample(100 + i, 1.0, Quality::Good))
            .collect();
        let archived = archived_times(&mut engine, &mut state, &metadata, &samples);
        assert_eq!(archived, vec![100, 101, 102, 103]);
    }

    #[test]
    fn test_min_time_suppresses_archival() {
        let metadata = analog(0.0).with_compression_times(60, 0);
        let mut engine = CompressionEngine::new(true);
        let mut state = CompressionState::new(1);

        let samples = [
            sample(100, 1.0, Quality::Good),
            sample(110, 50.0, Quality::Good),
            sample(120, -50.0, Quality::Old),
            sample(130, 50.0, Quality::Good),
        ];
        let archived = archived_times(&mut engine, &mut state, &metadata, &samples);
        assert_eq!(archived, vec![100]);
    }

    #[test]
    fn test_max_time_forces_archival() {
        let metadata = analog(1000.0).with_compression_times(0, 30);
        let mut engine = CompressionEngine::new(true);
        let mut state = CompressionState::new(1);

        let samples: Vec<PointRecord> = (0..6)
            .map(|i| sample(100 + i * 10, 1.0, Quality::Good))
            .collect();
        let archived = archived_times(&mut engine, &mut state, &metadata, &samples);
        // Sample 140 is archived once the gap to it exceeds 30 s.
        assert_eq!(archived, vec![100, 140]);
    }

    #[test]
    fn test_digital_change_archives() {
        let metadata = MetadataRecord::new(1, "breaker").with_data_type(DataType::Digital);
        let mut engine = CompressionEngine::new(true);
        let mut state = CompressionState::new(1);

        let samples = [
            sample(100, 0.0, Quality::Good),
            sample(101, 0.0, Quality::Good),
            sample(102, 0.0, Quality::Good),
            sample(103, 1.0, Quality::Good),
        ];
        let archived = archived_times(&mut engine, &mut state, &metadata, &samples);
        assert_eq!(archived, vec![100, 102]);
    }

    #[test]
    fn test_classify_analog_priority() {
        let metadata = MetadataRecord::new(1, "temp").with_analog_limits(crate::store::AnalogLimits {
            high_range: 100.0,
            low_range: -100.0,
            high_alarm: 80.0,
            low_alarm: -80.0,
            high_warning: 60.0,
            low_warning: -60.0,
        });
        assert_eq!(classify_quality(150.0, &metadata), Quality::UnreasonableHigh);
        assert_eq!(classify_quality(80.0, &metadata), Quality::ValueAboveHiHiAlarm);
        assert_eq!(classify_quality(70.0, &metadata), Quality::ValueAboveHiAlarm);
        assert_eq!(classify_quality(0.0, &metadata), Quality::Good);
        assert_eq!(classify_quality(-70.0, &metadata), Quality::ValueBelowLoAlarm);
        assert_eq!(classify_quality(-90.0, &metadata), Quality::ValueBelowLoLoAlarm);
        assert_eq!(classify_quality(-100.0, &metadata), Quality::UnreasonableLow);
    }

    #[test]
    fn test_classify_digital() {
        let metadata = MetadataRecord::new(1, "valve")
            .with_data_type(DataType::Digital)
            .with_digital_alarm_state(1);
        assert_eq!(classify_quality(1.0, &metadata), Quality::LogicalAlarm);
        assert_eq!(classify_quality(0.0, &metadata), Quality::Good);
    }

    #[test]
    fn test_alarm_delay() {
        let metadata =
            analog(0.0).with_alarms(Quality::ValueAboveHiAlarm.alarm_flag(), 5.0);
        let mut tracker = AlarmTracker::default();

        assert!(!tracker.observe(&metadata, &sample(10, 1.0, Quality::ValueAboveHiAlarm)));
        assert_eq!(tracker.pending(), 1);
        assert!(!tracker.observe(&metadata, &sample(14, 1.0, Quality::ValueAboveHiAlarm)));
        assert!(tracker.observe(&metadata, &sample(16, 1.0, Quality::ValueAboveHiAlarm)));
        assert_eq!(tracker.pending(), 0);

        // A good sample clears a pending alarm.
        assert!(!tracker.observe(&metadata, &sample(20, 1.0, Quality::ValueAboveHiAlarm)));
        assert!(!tracker.observe(&metadata, &sample(21, 1.0, Quality::Good)));
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_alarm_without_delay_in_steady_state() {
        let metadata = analog(0.5).with_alarms(Quality::ValueAboveHiAlarm.alarm_flag(), 0.0);
        let mut engine = CompressionEngine::new(true);
        let mut state = CompressionState::new(1);

        engine.evaluate(&mut state, sample(1, 1.0, Quality::Good), &metadata);
        engine.evaluate(&mut state, sample(2, 1.0, Quality::Good), &metadata);
        let evaluation =
            engine.evaluate(&mut state, sample(3, 70.0, Quality::ValueAboveHiAlarm), &metadata);
        assert!(evaluation.alarm);
    }
}
