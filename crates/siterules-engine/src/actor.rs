use crate::buffer::TimeSeriesBuffer;
use crate::config::EngineLimits;
use crate::output::OutputValues;
use crate::{RulePolicy, VariableSource, RESULT_FIELD, SCALAR_UNIT, TIME_FIELD};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use siterules_common::types::{CumulativeType, InvalidCategory, TimedValue};
use std::collections::HashMap;

/// Per-rule-instance state: the latest buffered value of each signal the
/// rule uses, and the history of its evaluation results.
///
/// One actor is created per rule instance at first evaluation and mutated
/// by exactly one logical writer at a time; the engine performs no
/// synchronization of its own. Cached in memory and persisted write-through
/// by the owning service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorState {
    /// The rule instance id; doubles as the persistence key.
    pub id: String,
    pub rule_id: String,
    /// Version of the rule definition this state was built against.
    pub version: u32,
    /// The earliest timestamp seen. Runs starting before this should build
    /// a fresh actor instead of updating this one.
    pub earliest_seen: DateTime<Utc>,
    /// The timestamp of the latest processed sample.
    pub timestamp: DateTime<Utc>,
    /// When the output last changed.
    pub last_changed_output: DateTime<Utc>,
    /// Internally calculated values kept for stateful calculations, one
    /// buffer per signal name.
    pub timed_values: HashMap<String, TimeSeriesBuffer>,
    /// The results of evaluating the rule.
    pub output_values: OutputValues,
}

impl ActorState {
    pub fn new(
        rule_id: impl Into<String>,
        rule_instance_id: impl Into<String>,
        start: DateTime<Utc>,
        version: u32,
    ) -> Self {
        Self {
            id: rule_instance_id.into(),
            rule_id: rule_id.into(),
            version,
            earliest_seen: start,
            timestamp: start,
            last_changed_output: start,
            timed_values: HashMap::new(),
            output_values: OutputValues::new(),
        }
    }

    /// The current boolean state of this actor (fail / no fail).
    pub fn value_bool(&self) -> bool {
        self.output_values.faulted()
    }

    /// Does this actor have all the data it needs, or has some gone stale?
    pub fn is_valid(&self) -> bool {
        self.output_values.is_valid()
    }

    pub fn trigger_count(&self) -> u64 {
        self.output_values.trigger_count
    }

    /// Refresh policy-derived values after the rule instance was rebuilt.
    pub fn refresh_from_policy(&mut self, policy: &dyn RulePolicy) {
        self.output_values.variables_to_keep = policy.variables_to_keep().to_vec();
    }

    /// Add a timed point value to the named buffer.
    ///
    /// Advances the actor's timestamp, creates the buffer lazily, and drops
    /// it again if the point was rejected and nothing remains.
    pub fn extend(
        &mut self,
        value: TimedValue,
        name: &str,
        unit: &str,
        apply_compression: bool,
        optimize_compression: bool,
    ) -> Option<&TimeSeriesBuffer> {
        self.timestamp = value.timestamp;
        self.output_values.trigger_count += 1;
        self.prune_and_add(value, name, unit, apply_compression, optimize_compression)
    }

    /// Add a timed point value folded according to its cumulative type.
    ///
    /// The time-weighted variants multiply the incoming value by the gap
    /// since the last recorded point in the same buffer.
    pub fn extend_cumulative(
        &mut self,
        value: TimedValue,
        name: &str,
        unit: &str,
        cumulative: CumulativeType,
        apply_compression: bool,
        optimize_compression: bool,
    ) -> Option<&TimeSeriesBuffer> {
        // The buffer can exist but be empty, in which case there is no gap.
        let last_gap = self
            .timed_values
            .get(name)
            .and_then(|b| b.last_seen())
            .map(|seen| value.timestamp - seen)
            .unwrap_or_else(Duration::zero);
        let gap_ms = last_gap.num_milliseconds() as f64;

        match cumulative {
            CumulativeType::Simple => {
                self.extend(value, name, unit, apply_compression, optimize_compression)
            }
            CumulativeType::Accumulate => {
                let unit = if unit.is_empty() { SCALAR_UNIT } else { unit };
                self.accumulate(
                    name,
                    value.timestamp,
                    value.value_double().unwrap_or(0.0),
                    unit,
                    apply_compression,
                    optimize_compression,
                )
            }
            CumulativeType::AccumulateTimeSeconds => self.accumulate(
                name,
                value.timestamp,
                value.value_double().unwrap_or(0.0) * (gap_ms / 1000.0),
                unit,
                apply_compression,
                optimize_compression,
            ),
            CumulativeType::AccumulateTimeMinutes => self.accumulate(
                name,
                value.timestamp,
                value.value_double().unwrap_or(0.0) * (gap_ms / 60_000.0),
                unit,
                apply_compression,
                optimize_compression,
            ),
            CumulativeType::AccumulateTimeHours => self.accumulate(
                name,
                value.timestamp,
                value.value_double().unwrap_or(0.0) * (gap_ms / 3_600_000.0),
                unit,
                apply_compression,
                optimize_compression,
            ),
        }
    }

    /// Add a cumulative sum timed point value: the contribution is stacked
    /// on the buffer's current last value.
    pub fn accumulate(
        &mut self,
        name: &str,
        timestamp: DateTime<Utc>,
        mut value: f64,
        unit: &str,
        apply_compression: bool,
        optimize_compression: bool,
    ) -> Option<&TimeSeriesBuffer> {
        if let Some(values) = self.timed_values.get(name) {
            value += values.get_last_value_double().unwrap_or(0.0);
        }
        self.extend(
            TimedValue::new_double(timestamp, value),
            name,
            unit,
            apply_compression,
            optimize_compression,
        )
    }

    /// Get the named buffer, creating it if missing.
    pub fn filter(&mut self, field_id: &str, unit: &str) -> &mut TimeSeriesBuffer {
        let buffer = self
            .timed_values
            .entry(field_id.to_string())
            .or_insert_with(|| TimeSeriesBuffer::new(unit));
        // Update old buffers that might not have a unit yet.
        buffer.set_unit_if_empty(unit);
        buffer
    }

    /// Record a valid evaluation result.
    ///
    /// Keeps the declared variable snapshots (split by whether the boolean
    /// result was triggered), and on a fault-state transition backdates the
    /// interval boundary to when the result actually changed rather than
    /// when this evaluation happened to run.
    pub fn valid_output(&mut self, now: DateTime<Utc>, is_faulted: bool, env: &dyn VariableSource) {
        let mut variables: Vec<(String, Value)> = Vec::new();

        if !self.output_values.variables_to_keep.is_empty() {
            if let Some(result) = self.timed_values.get(RESULT_FIELD) {
                let snapshot: Vec<(String, Value)> = self
                    .output_values
                    .variables_to_keep
                    .iter()
                    .map(|name| (name.clone(), env.bound_value(name).unwrap_or(Value::Null)))
                    .collect();

                let is_triggered = result.get_last_value_bool().unwrap_or(true);

                if is_triggered {
                    self.output_values.last_triggered_values = snapshot.clone();
                } else {
                    self.output_values.last_untriggered_values = snapshot.clone();
                }

                variables = if is_faulted {
                    self.output_values.last_triggered_values.clone()
                } else {
                    self.output_values.last_untriggered_values.clone()
                };

                // Fall back to the current snapshot when there was no prior
                // state; happens when the previous cycle was invalid.
                if variables.is_empty() {
                    variables = snapshot;
                }
            }
        }

        // Same-value samples are suppressed on ingest, so the result
        // buffer's last timestamp is the moment the boolean result last
        // changed.
        if let Some(result) = self.timed_values.get(RESULT_FIELD) {
            if let (Some(triggered), Some(seen)) = (result.get_last_value_bool(), result.last_seen())
            {
                if triggered {
                    self.output_values.last_trigger_on_time = Some(seen);
                } else {
                    self.output_values.last_trigger_off_time = Some(seen);
                }
            }
        }

        let mut now = now;
        let was_faulted = self.output_values.faulted();
        if !was_faulted && is_faulted {
            if let Some(on) = self.output_values.last_trigger_on_time {
                now = on;
            }
        } else if was_faulted && !is_faulted {
            if let Some(off) = self.output_values.last_trigger_off_time {
                now = off;
            }
        }

        self.output_values
            .with_output(now, true, is_faulted, variables, "", None);
    }

    /// Record a non-valid output with a category tag.
    pub fn invalid_output(
        &mut self,
        now: DateTime<Utc>,
        text: impl Into<String>,
        category: Option<InvalidCategory>,
    ) {
        let mut text = text.into();
        if let Some((idx, _)) = text.char_indices().nth(500) {
            tracing::warn!(len = text.chars().count(), "truncating oversized output text");
            text.truncate(idx);
            text.push_str("...");
        }
        self.output_values
            .with_output(now, false, false, Vec::new(), text, category);
    }

    pub fn invalid_value(&mut self, now: DateTime<Utc>, text: Option<String>) {
        self.invalid_output(
            now,
            text.unwrap_or_else(|| "Invalid Value".to_string()),
            Some(InvalidCategory::InvalidValue),
        );
    }

    pub fn missing_value(&mut self, now: DateTime<Utc>, text: Option<String>) {
        self.invalid_output(
            now,
            text.unwrap_or_else(|| "Missing value".to_string()),
            Some(InvalidCategory::MissingValue),
        );
    }

    pub fn insufficient_data(&mut self, now: DateTime<Utc>, text: Option<String>) {
        self.invalid_output(
            now,
            text.unwrap_or_else(|| "Insufficient Data".to_string()),
            Some(InvalidCategory::InsufficientData),
        );
    }

    pub fn insufficient_data_range(&mut self, now: DateTime<Utc>, text: Option<String>) {
        self.invalid_output(
            now,
            text.unwrap_or_else(|| "Insufficient Range".to_string()),
            Some(InvalidCategory::InsufficientRange),
        );
    }

    /// Record a command trigger state for one trigger id.
    pub fn with_trigger(
        &mut self,
        trigger_id: &str,
        now: DateTime<Utc>,
        trigger_start_time: DateTime<Utc>,
        trigger_end_time: Option<DateTime<Utc>>,
        triggered: bool,
        value: f64,
    ) {
        self.output_values.with_trigger(
            trigger_id,
            now,
            trigger_start_time,
            trigger_end_time,
            triggered,
            value,
        );
    }

    pub fn update_last_changed_output(&mut self, last_change_date: DateTime<Utc>) {
        self.last_changed_output = last_change_date;
    }

    /// Removes all calculated values after the specified date.
    ///
    /// Very destructive; meant for full recalculation or debugging, not the
    /// normal forward path.
    pub fn remove_values_after(&mut self, start_date: DateTime<Utc>) {
        self.timed_values.retain(|key, buffer| {
            buffer.remove_points_after(start_date);
            if buffer.is_empty() {
                tracing::debug!(signal = %key, "dropped empty buffer on rewind");
                false
            } else {
                true
            }
        });
        self.last_changed_output = start_date;
    }

    /// Debug invariant check for overlapping output intervals.
    pub fn has_overlapping_output_values(&self) -> bool {
        self.output_values
            .points()
            .windows(2)
            .any(|w| w[0].end_time > w[1].start_time)
    }

    /// Apply retention limits to the actor's buffers.
    ///
    /// A buffer is "tracked" — and exempt from the point-count cap — when
    /// it is the canonical result, a cumulative accumulator, or referenced
    /// temporally by another parameter's expression. Untracked non-alias
    /// buffers are capped at 3 points: delta functions need the last two,
    /// and impact scoring inspects the last compression outcome. The
    /// internal TIME accumulator is never fully cleared.
    ///
    /// Returns `(points_removed, total_tracked)`.
    pub fn apply_limits(
        &mut self,
        policy: &dyn RulePolicy,
        now: DateTime<Utc>,
        max_time_to_keep: Duration,
        limit_untracked: bool,
    ) -> (usize, usize) {
        let bound = policy.bound_parameters();

        let mut tracked: HashMap<&str, bool> = HashMap::new();
        let mut total_tracked = 0;

        for (i, pb) in bound.iter().enumerate() {
            let mut enable_tracking =
                pb.field_id == RESULT_FIELD || pb.cumulative != CumulativeType::Simple;

            if !enable_tracking {
                // Work this out upfront rather than during execution.
                enable_tracking = bound.iter().enumerate().any(|(j, other)| {
                    j != i && other.temporal_references.iter().any(|r| *r == pb.field_id)
                });
            }

            if enable_tracking {
                total_tracked += 1;
            }
            tracked.insert(pb.field_id.as_str(), enable_tracking);
        }

        let mut removed = 0;

        for (key, buffer) in self.timed_values.iter_mut() {
            if buffer.is_capability_alias() {
                // Aliases of shared capability buffers are not ours to trim.
                continue;
            }

            buffer.set_max_buffer_count(None);

            let mut can_remove_all_points = true;

            if let Some(&enable_tracking) = tracked.get(key.as_str()) {
                // Still referenced by the rule instance; never fully clear.
                can_remove_all_points = false;

                if limit_untracked && !enable_tracking {
                    buffer.set_max_buffer_count(Some(3));
                }
            } else if key == TIME_FIELD {
                can_remove_all_points = false;
            }

            removed +=
                buffer.apply_limits(now, Duration::days(7), max_time_to_keep, can_remove_all_points);
        }

        (removed, total_tracked)
    }

    /// Trim the output history per the configured limits; runs when the
    /// actor is saved. Returns the number of intervals removed.
    pub fn apply_output_limits(&mut self, limits: &EngineLimits, now: DateTime<Utc>) -> usize {
        self.output_values.apply_limits(
            limits.max_output_count,
            now - Duration::days(i64::from(limits.max_output_days)),
        )
    }

    /// Drop every buffer that aliases a shared capability buffer. Returns
    /// how many were removed.
    pub fn remove_alias_time_series(&mut self) -> usize {
        let before = self.timed_values.len();
        self.timed_values
            .retain(|_, buffer| !buffer.is_capability_alias());
        before - self.timed_values.len()
    }

    fn prune_and_add(
        &mut self,
        value: TimedValue,
        name: &str,
        unit: &str,
        apply_compression: bool,
        optimize_compression: bool,
    ) -> Option<&TimeSeriesBuffer> {
        let now_empty = {
            let buffer = self
                .timed_values
                .entry(name.to_string())
                .or_insert_with(|| TimeSeriesBuffer::new(unit));
            buffer.set_unit_if_empty(unit);
            buffer.add_point(value, apply_compression, optimize_compression, None);
            buffer.is_empty()
        };

        if now_empty {
            self.timed_values.remove(name);
            return None;
        }

        self.timed_values.get(name)
    }
}
