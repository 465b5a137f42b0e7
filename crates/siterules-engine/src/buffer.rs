use crate::compressor::{CompressorState, TrajectoryCompressor, DEFAULT_COMPRESSION};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use siterules_common::types::{is_sentinel, TimedValue};

/// Recompression of old points starts once the buffer spans this many days.
const REAPPLY_MIN_SPAN_DAYS: i64 = 15;

/// A buffered window of compressed time series values for one named signal.
///
/// The buffer owns its [`CompressorState`]; neither is ever shared between
/// actors. Points stay ordered by timestamp with no duplicates. Retention
/// caps are enforced by [`TimeSeriesBuffer::apply_limits`], typically when
/// the owning actor is saved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeSeriesBuffer {
    /// Maximum age of values to keep, in seconds.
    max_time_to_keep_secs: Option<i64>,
    /// Maximum number of values to keep.
    max_count_to_keep: Option<usize>,
    unit_of_measure: String,
    points: Vec<TimedValue>,
    compression: Option<CompressorState>,
    /// Raw gap between the two most recent real samples, in seconds. Kept
    /// outside the points because compression may have merged them away.
    last_gap_secs: f64,
    /// Alias of a shared capability buffer; exempt from aggressive trimming.
    #[serde(default)]
    capability_alias: bool,
}

impl TimeSeriesBuffer {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit_of_measure: unit.into(),
            ..Self::default()
        }
    }

    pub fn points(&self) -> &[TimedValue] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn unit_of_measure(&self) -> &str {
        &self.unit_of_measure
    }

    /// Update old buffers that might not have a unit yet.
    pub fn set_unit_if_empty(&mut self, unit: &str) {
        if self.unit_of_measure.is_empty() {
            self.unit_of_measure = unit.to_string();
        }
    }

    pub fn is_capability_alias(&self) -> bool {
        self.capability_alias
    }

    pub fn mark_capability_alias(&mut self) {
        self.capability_alias = true;
    }

    pub fn compression(&self) -> Option<&CompressorState> {
        self.compression.as_ref()
    }

    pub fn last(&self) -> Option<&TimedValue> {
        self.points.last()
    }

    pub fn first(&self) -> Option<&TimedValue> {
        self.points.first()
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last().map(|p| p.timestamp)
    }

    pub fn first_seen(&self) -> Option<DateTime<Utc>> {
        self.first().map(|p| p.timestamp)
    }

    pub fn get_last_value_double(&self) -> Option<f64> {
        self.last().and_then(TimedValue::value_double)
    }

    pub fn get_last_value_bool(&self) -> Option<bool> {
        self.last().and_then(TimedValue::value_bool)
    }

    pub fn get_last_value_text(&self) -> Option<&str> {
        self.last().and_then(TimedValue::value_text)
    }

    /// Seconds between the two most recent real samples fed to this buffer.
    pub fn last_gap_seconds(&self) -> f64 {
        self.last_gap_secs
    }

    pub fn try_get_last_and_previous(&self) -> Option<(&TimedValue, &TimedValue)> {
        if self.points.len() > 1 {
            Some((
                &self.points[self.points.len() - 1],
                &self.points[self.points.len() - 2],
            ))
        } else {
            None
        }
    }

    /// The last real value difference between samples, avoiding compression.
    pub fn get_last_delta(&self) -> f64 {
        if self.points.len() < 2 {
            return 0.0;
        }
        if let Some(state) = &self.compression {
            return state.last_delta();
        }
        match self.try_get_last_and_previous() {
            Some((last, previous)) => last.numeric() - previous.numeric(),
            None => 0.0,
        }
    }

    /// The last real time difference between samples in seconds, avoiding
    /// compression.
    pub fn get_last_delta_time(&self) -> f64 {
        if self.points.len() < 2 {
            return 0.0;
        }
        if let Some(state) = &self.compression {
            return state.last_delta_time();
        }
        match self.try_get_last_and_previous() {
            Some((last, previous)) => {
                (last.timestamp - previous.timestamp).num_milliseconds() as f64 / 1000.0
            }
            None => 0.0,
        }
    }

    /// Adds a point with the default compressor.
    ///
    /// `compression` overrides the default error-band percentage for this
    /// call only.
    pub fn add_point(
        &mut self,
        value: TimedValue,
        apply_compression: bool,
        reapply_compression: bool,
        compression: Option<f64>,
    ) -> bool {
        let compressor = TrajectoryCompressor::new(compression.unwrap_or(DEFAULT_COMPRESSION));
        self.add_point_with(value, apply_compression, &compressor, reapply_compression)
    }

    /// Adds a point to the buffer.
    ///
    /// Bogus samples (sentinel timestamps, non-finite doubles) are rejected.
    /// A sample repeating the current last value, or sharing its timestamp,
    /// is dropped — so the last point's timestamp is always the time of the
    /// most recent value change. Going backward in time prunes everything
    /// after the new sample and resets the compression state.
    ///
    /// Returns true when the buffer changed.
    pub fn add_point_with(
        &mut self,
        value: TimedValue,
        apply_compression: bool,
        compressor: &TrajectoryCompressor,
        reapply_compression: bool,
    ) -> bool {
        if !is_valid_incoming_point(&value) {
            return false;
        }

        if apply_compression && reapply_compression {
            // Once a day, revisit how aggressively old points are kept.
            let new_day = self
                .points
                .last()
                .map_or(true, |p| p.timestamp.date_naive() != value.timestamp.date_naive());
            if new_day {
                self.re_apply_compression();
            }
        }

        // Remove anything after this timestamp if we have gone backward in time.
        if self
            .points
            .last()
            .is_some_and(|p| p.timestamp > value.timestamp)
        {
            if self
                .points
                .first()
                .is_some_and(|p| p.timestamp > value.timestamp)
            {
                // Entire set is beyond the new start time.
                self.points.clear();
            } else {
                let timestamp = value.timestamp;
                let before = self.points.len();
                self.points.retain(|p| p.timestamp <= timestamp);
                tracing::debug!(
                    removed = before - self.points.len(),
                    %timestamp,
                    "pruned buffer tail on rewind"
                );
                self.points.shrink_to_fit();
            }
            self.compression = Some(CompressorState::new());
        }

        if let Some(last) = self.points.last() {
            if last.is_same_value(&value) || last.timestamp == value.timestamp {
                return false;
            }
            self.last_gap_secs =
                (value.timestamp - last.timestamp).num_milliseconds() as f64 / 1000.0;
        }

        if apply_compression && !self.points.is_empty() {
            if self.compression.is_none() {
                self.rebuild_compression_state(compressor);
            }

            let mut add = false;
            let mut update = false;
            let state = self.compression.get_or_insert_with(CompressorState::new);
            compressor.add(
                state,
                value.timestamp,
                value.numeric(),
                |_, _| add = true,
                |_, _, _| update = true,
            );

            if add {
                self.points.push(value);
            } else if update {
                let last = self.points.len() - 1;
                self.points[last] = value;
            }
        } else {
            // No compression, or the very first point; state is rebuilt by
            // replay once a second compressed point arrives.
            self.points.push(value);
        }

        true
    }

    /// Replay the stored points through a fresh compressor to rebuild state
    /// that was reset (rewind) or never persisted.
    fn rebuild_compression_state(&mut self, compressor: &TrajectoryCompressor) {
        let mut state = CompressorState::new();
        let snapshot = self.points.clone();
        for current in snapshot {
            let mut drop_current = false;
            compressor.add(
                &mut state,
                current.timestamp,
                current.numeric(),
                |_, _| {},
                // The next point replaces this one, so this one goes.
                |_, _, _| drop_current = true,
            );
            if drop_current {
                self.points.retain(|p| p.timestamp != current.timestamp);
            }
        }
        self.compression = Some(state);
    }

    /// Re-compress the buffer using coarser error bands for older points.
    ///
    /// Points newer than 15 days keep the default compression; beyond that
    /// the band widens with age (0.5 over 15 d, 1.0 over 31 d, 5.0 over
    /// 60 d) so long-lived anchored temporals stay usable without holding
    /// every historical anchor.
    fn re_apply_compression(&mut self) {
        let (Some(first), Some(last_seen)) = (self.first_seen(), self.last_seen()) else {
            return;
        };
        if last_seen - first < Duration::days(REAPPLY_MIN_SPAN_DAYS) {
            return;
        }

        // Keep the live state for future values; the replay below only
        // concerns historical points.
        let current_state = self.compression.take();
        let points_copy = std::mem::take(&mut self.points);

        let mut compressor = TrajectoryCompressor::default();

        for point in points_copy {
            let gap = last_seen - point.timestamp;

            if gap < Duration::days(REAPPLY_MIN_SPAN_DAYS) {
                // Already at the correct (default) compression.
                self.points.push(point);
                continue;
            }

            let percentage = if gap > Duration::days(60) {
                5.0
            } else if gap > Duration::days(31) {
                1.0
            } else {
                0.5
            };

            if compressor.percentage() != percentage {
                compressor = TrajectoryCompressor::new(percentage);
            }

            self.add_point_with(point, true, &compressor, false);
        }

        self.compression = current_state;
    }

    /// Apply limits to points based on `now` and the default maximums.
    ///
    /// The buffer's own `max_time_to_keep` wins over the default but is
    /// capped at `time_cap`. Returns the count of points removed.
    pub fn apply_limits(
        &mut self,
        now: DateTime<Utc>,
        default_max_time_to_keep: Duration,
        time_cap: Duration,
        can_remove_all_points: bool,
    ) -> usize {
        let mut min_date = now - default_max_time_to_keep;

        if let Some(secs) = self.max_time_to_keep_secs {
            min_date = now - Duration::seconds(secs);
            if now - min_date > time_cap {
                min_date = now - time_cap;
            }
        }

        self.apply_limit_bounds(self.max_count_to_keep, Some(min_date), can_remove_all_points)
    }

    /// Apply explicit count/age bounds to the points.
    ///
    /// Returns the count of points removed.
    pub fn apply_limit_bounds(
        &mut self,
        max_capacity: Option<usize>,
        min_date: Option<DateTime<Utc>>,
        can_remove_all_points: bool,
    ) -> usize {
        let mut removed = 0;

        // If the first point is stupidly far before the min date, chop it
        // off: single stale points from variables no longer referenced by
        // the rule otherwise hang around forever.
        let min_count = if can_remove_all_points { 0 } else { 2 };

        if let Some(min_date) = min_date {
            while self.points.len() > min_count
                && self.points[0].timestamp + Duration::days(7) < min_date
            {
                self.points.remove(0);
                removed += 1;
            }

            // Always keep at least two, and at least one before the min
            // date so interpolation can reach back to it.
            while self.points.len() > 2 && self.points[1].timestamp < min_date {
                self.points.remove(0);
                removed += 1;
            }
        }

        if let Some(max_allowed) = max_capacity {
            while self.points.len() > 2 && self.points.len() > max_allowed {
                self.points.remove(0);
                removed += 1;
            }
        }

        if removed > 0 {
            self.points.shrink_to_fit();
        }

        removed
    }

    /// Only raises the retention window, never narrows it.
    pub fn set_max_buffer_time(&mut self, max_time: Duration) {
        let current = self.max_time_to_keep_secs.unwrap_or(i64::MIN);
        if max_time.num_seconds() > current && max_time > Duration::zero() {
            self.max_time_to_keep_secs = Some(max_time.num_seconds());
        }
    }

    pub fn set_max_buffer_count(&mut self, max_count_to_keep: Option<usize>) {
        self.max_count_to_keep = max_count_to_keep;
    }

    /// Removes points after a certain date.
    ///
    /// Used when the buffer is about to reprocess a range it has already
    /// seen; leaving the tail in place would produce duplicates.
    pub fn remove_points_after(&mut self, date: DateTime<Utc>) {
        let before = self.points.len();
        self.points.retain(|p| p.timestamp <= date);
        if self.points.len() != before {
            tracing::debug!(removed = before - self.points.len(), %date, "removed points after date");
            self.compression = None;
            self.last_gap_secs = 0.0;
        }
    }

    /// The stored points within `[start, end]`, inclusive.
    pub fn get_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> &[TimedValue] {
        // Scan from the back; recent ranges are the common case.
        let mut end_index = None;
        for i in (0..self.points.len()).rev() {
            let ts = self.points[i].timestamp;
            if ts <= end && ts >= start {
                end_index = Some(i);
                break;
            }
        }
        let Some(end_index) = end_index else {
            return &[];
        };

        let mut start_index = end_index;
        for i in (0..end_index).rev() {
            if self.points[i].timestamp >= start {
                start_index = i;
            } else {
                break;
            }
        }

        &self.points[start_index..=end_index]
    }

    /// Re-sorts the points by timestamp.
    pub fn sort(&mut self) {
        self.points.sort_by_key(|p| p.timestamp);
    }

    /// Debug check that the series is in timestamp order.
    pub fn check_in_order(&self) -> bool {
        self.points.windows(2).all(|w| w[0].timestamp <= w[1].timestamp)
    }
}

/// Don't add bogus values to the buffer: sentinel timestamps and non-finite
/// doubles never represent a real observation.
fn is_valid_incoming_point(value: &TimedValue) -> bool {
    if is_sentinel(value.timestamp) {
        return false;
    }
    if let Some(d) = value.value_double() {
        if !d.is_finite() {
            return false;
        }
    }
    true
}
