use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default error band as a fraction of the signal's RMS amplitude.
pub const DEFAULT_COMPRESSION: f64 = 0.05;

/// A segment is confirmed after this many hours even if the trend still fits.
const MAX_SEGMENT_HOURS: i64 = 12;

/// Online cone-narrowing trajectory compressor.
///
/// For each incoming `(timestamp, value)` on one signal the compressor
/// decides whether the point can be represented by extending the current
/// trend line within an allowed error band, or must start a new segment.
/// It owns no storage: `write` emits a new anchor point and `update` asks
/// the caller to replace the previously accepted point in place.
#[derive(Debug, Clone, Copy)]
pub struct TrajectoryCompressor {
    percentage: f64,
}

impl Default for TrajectoryCompressor {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION)
    }
}

/// Per-signal compressor state, owned by exactly one buffer.
///
/// `count`/`sum`/`sum_square` run over every value the signal has ever seen
/// since this state was created. The resulting RMS amplitude (and with it
/// the error band) therefore drifts as history accumulates instead of
/// tracking a recent window. That is the long-standing behavior of this
/// estimator; keep the formula as-is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompressorState {
    start_time: Option<DateTime<Utc>>,
    start_value: f64,
    previous_time: Option<DateTime<Utc>>,
    previous_value: f64,
    upper_slope: f64,
    lower_slope: f64,
    count: u64,
    sum: f64,
    sum_square: f64,
    last_delta: f64,
    last_delta_time: f64,
}

impl CompressorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw difference between the two most recent real samples, tracked
    /// before any compression decision. Exposed verbatim to delta functions.
    pub fn last_delta(&self) -> f64 {
        self.last_delta
    }

    /// Seconds between the two most recent real samples.
    pub fn last_delta_time(&self) -> f64 {
        self.last_delta_time
    }

    /// Anchor of the current cone, if any point has been seen.
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn start_value(&self) -> f64 {
        self.start_value
    }

    /// The last accepted (or updated) point of the current segment.
    pub fn previous_time(&self) -> Option<DateTime<Utc>> {
        self.previous_time
    }

    pub fn upper_slope(&self) -> f64 {
        self.upper_slope
    }

    pub fn lower_slope(&self) -> f64 {
        self.lower_slope
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    fn rms(&self) -> f64 {
        // A lone point must not collapse the band to zero.
        let variance = if self.count < 2 {
            0.01
        } else {
            let n = self.count as f64;
            let mean = self.sum / n;
            (self.sum_square / n - mean * mean).max(0.0)
        };
        variance.sqrt()
    }
}

impl TrajectoryCompressor {
    pub fn new(percentage: f64) -> Self {
        Self { percentage }
    }

    pub fn percentage(&self) -> f64 {
        self.percentage
    }

    /// Feed one sample through the compressor.
    ///
    /// `write(timestamp, value)` emits a point that must be appended to the
    /// compressed series. `update(old_timestamp, new_timestamp, value)`
    /// replaces the previously accepted point (the last element of the
    /// series) with the new one.
    pub fn add<W, U>(
        &self,
        state: &mut CompressorState,
        timestamp: DateTime<Utc>,
        value: f64,
        mut write: W,
        mut update: U,
    ) where
        W: FnMut(DateTime<Utc>, f64),
        U: FnMut(DateTime<Utc>, DateTime<Utc>, f64),
    {
        // Raw delta bookkeeping happens first, from the previous real point,
        // so DELTA()-style functions never observe compression.
        if let Some(previous_time) = state.previous_time {
            state.last_delta = value - state.previous_value;
            state.last_delta_time = seconds_between(previous_time, timestamp);
        } else if let Some(start_time) = state.start_time {
            state.last_delta = value - state.start_value;
            state.last_delta_time = seconds_between(start_time, timestamp);
        }

        state.count += 1;
        state.sum += value;
        state.sum_square += value * value;

        // Very first point: it is the anchor.
        let Some(start_time) = state.start_time else {
            write(timestamp, value);
            state.start_time = Some(timestamp);
            state.start_value = value;
            return;
        };

        let band = state.rms() * self.percentage;
        let upper_estimate = value + band;
        let lower_estimate = value - band;

        // Second point: written as-is, seeds the cone.
        let Some(previous_time) = state.previous_time else {
            write(timestamp, value);
            state.previous_time = Some(timestamp);
            state.previous_value = value;
            let elapsed = millis_between(start_time, timestamp);
            state.upper_slope = (upper_estimate - state.start_value) / elapsed;
            state.lower_slope = (lower_estimate - state.start_value) / elapsed;
            return;
        };

        if timestamp == previous_time {
            // Duplicate timestamp, nothing to record.
            return;
        }

        let elapsed = millis_between(start_time, timestamp);
        let upper_bound = state.start_value + state.upper_slope * elapsed;
        let lower_bound = state.start_value + state.lower_slope * elapsed;

        if value > upper_bound
            || value < lower_bound
            || timestamp - start_time > Duration::hours(MAX_SEGMENT_HOURS)
        {
            // The previous point is confirmed as a real breakpoint: it
            // becomes the anchor of a new segment and this point starts it.
            write(timestamp, value);
            let previous_value = state.previous_value;
            state.start_time = Some(previous_time);
            state.start_value = previous_value;
            let elapsed = millis_between(previous_time, timestamp);
            state.upper_slope = (upper_estimate - previous_value) / elapsed;
            state.lower_slope = (lower_estimate - previous_value) / elapsed;
            state.previous_time = Some(timestamp);
            state.previous_value = value;
            return;
        }

        // Consistent with the trend: this point replaces the previously
        // accepted one, and the cone only ever narrows.
        update(previous_time, timestamp, value);
        state.previous_time = Some(timestamp);
        state.previous_value = value;

        if upper_estimate < upper_bound {
            state.upper_slope = (upper_estimate - state.start_value) / elapsed;
        }
        if lower_estimate > lower_bound {
            state.lower_slope = (lower_estimate - state.start_value) / elapsed;
        }
    }
}

fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    millis_between(from, to) / 1000.0
}
