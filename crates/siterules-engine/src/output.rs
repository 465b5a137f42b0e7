use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use siterules_common::types::{sentinel_min, InvalidCategory};
use std::collections::HashMap;

/// Behavior the merge engine needs from an interval payload: bounds,
/// clone-with-new-bounds, and equality-for-merging.
///
/// `clone_with` receives the most recently recorded interval so payloads can
/// merge metadata from it (the command payload does; the fault payload does
/// not).
pub trait OutputPayload: Clone {
    fn start_time(&self) -> DateTime<Utc>;

    fn end_time(&self) -> DateTime<Utc>;

    fn clone_with(
        output: &Self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        last: Option<&Self>,
    ) -> Self;

    /// True when two outputs classify the same way and their intervals may
    /// merge into one.
    fn is_same_state(&self, other: &Self) -> bool;
}

/// A minimal chronological sequence of non-overlapping typed intervals.
///
/// [`OutputSeries::with_output`] turns a stream of "as of `now`, the output
/// is X" calls into interval extensions, splits on classification change,
/// and rewinds. After every mutation the points are ordered by start time
/// and non-overlapping; the last interval may be "open", its end equal to
/// the most recent processed timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSeries<T> {
    points: Vec<T>,
}

impl<T> Default for OutputSeries<T> {
    fn default() -> Self {
        Self { points: Vec::new() }
    }
}

enum Merge<T> {
    ReplaceLast(T),
    Append(T),
}

impl<T: OutputPayload> OutputSeries<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> &[T] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first(&self) -> Option<&T> {
        self.points.first()
    }

    pub fn last(&self) -> Option<&T> {
        self.points.last()
    }

    /// Record that the output is `output` as of `now`.
    pub fn with_output(&mut self, now: DateTime<Utc>, output: T) {
        // Rewind: someone is reprocessing from earlier than we ever reached.
        // Intervals that start in the discarded future go entirely.
        let before = self.points.len();
        self.points.retain(|p| p.start_time() <= now);
        if self.points.len() != before {
            tracing::debug!(
                removed = before - self.points.len(),
                %now,
                "dropped future intervals on rewind"
            );
        }

        // Intervals reaching past `now` are truncated to it, scanning from
        // the tail; ordering lets us stop at the first one that ends in time.
        for i in (0..self.points.len()).rev() {
            if self.points[i].end_time() <= now {
                break;
            }
            let truncated = {
                let p = &self.points[i];
                T::clone_with(p, p.start_time(), now, self.points.last())
            };
            self.points[i] = truncated;
        }

        if self.points.is_empty() {
            self.points.push(T::clone_with(&output, now, now, None));
            return;
        }

        let n = self.points.len();
        let last = &self.points[n - 1];
        let last_start = last.start_time();
        let last_end = last.end_time();

        let merge = if last_start == now {
            // A zero-width interval at the same instant collapses to the
            // newest classification.
            Merge::ReplaceLast(T::clone_with(&output, now, now, Some(last)))
        } else if last_end == now && last.is_same_state(&output) {
            Merge::ReplaceLast(T::clone_with(last, last_start, now, Some(last)))
        } else if last_end < now {
            if last.is_same_state(&output) {
                // Open interval growth.
                Merge::ReplaceLast(T::clone_with(last, last_start, now, Some(last)))
            } else {
                // A new classification begins.
                Merge::Append(T::clone_with(&output, now, now, Some(last)))
            }
        } else {
            // Unreachable after truncation above; append defensively.
            Merge::Append(T::clone_with(&output, now, now, Some(last)))
        };

        match merge {
            Merge::ReplaceLast(value) => self.points[n - 1] = value,
            Merge::Append(value) => self.points.push(value),
        }
    }

    /// Append a pre-built interval, purging anything it would overlap
    /// (reruns write over the same range).
    ///
    /// # Panics
    ///
    /// Panics when the interval's start exceeds its end; that is a caller
    /// bug, not a data condition.
    pub fn add(&mut self, value: T) {
        assert!(
            value.start_time() <= value.end_time(),
            "interval start must not exceed end"
        );
        let start = value.start_time();
        self.points
            .retain(|p| p.start_time() != start && p.end_time() <= start);
        self.points.push(value);
    }

    /// Overwrite the last interval, if any.
    ///
    /// # Panics
    ///
    /// Panics when the interval's start exceeds its end.
    pub fn replace_last(&mut self, value: T) {
        assert!(
            value.start_time() <= value.end_time(),
            "interval start must not exceed end"
        );
        if let Some(last) = self.points.last_mut() {
            *last = value;
        }
    }

    /// Trim the series to at most `max_count` intervals ending at or after
    /// `min_date`. Intervals carrying the never-set start sentinel are
    /// legacy bad data and are dropped too. Returns the number removed.
    pub fn apply_limits(&mut self, max_count: usize, min_date: DateTime<Utc>) -> usize {
        let before = self.points.len();
        self.points
            .retain(|p| p.end_time() >= min_date && p.start_time() != sentinel_min());
        while self.points.len() > max_count {
            self.points.remove(0);
        }
        before - self.points.len()
    }
}

/// One maximal time range over which the boolean evaluation result stayed
/// classified the same way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputValue {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// False when the rule could not evaluate (see `invalid_category`).
    pub is_valid: bool,
    pub faulted: bool,
    pub invalid_category: Option<InvalidCategory>,
    pub text: String,
    /// Ordered snapshot of the variables the rule declared worth keeping.
    pub variables: Vec<(String, Value)>,
}

impl OutputValue {
    /// # Panics
    ///
    /// Panics when `start_time` exceeds `end_time`.
    pub fn new(
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        is_valid: bool,
        faulted: bool,
        variables: Vec<(String, Value)>,
        text: impl Into<String>,
        invalid_category: Option<InvalidCategory>,
    ) -> Self {
        assert!(start_time <= end_time, "interval start must not exceed end");
        Self {
            start_time,
            end_time,
            is_valid,
            faulted,
            invalid_category,
            text: text.into(),
            variables,
        }
    }
}

impl OutputPayload for OutputValue {
    fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    fn clone_with(
        output: &Self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        _last: Option<&Self>,
    ) -> Self {
        assert!(start <= end, "interval start must not exceed end");
        Self {
            start_time: start,
            end_time: end,
            ..output.clone()
        }
    }

    fn is_same_state(&self, other: &Self) -> bool {
        self.faulted == other.faulted
            && self.is_valid == other.is_valid
            && self.invalid_category == other.invalid_category
    }
}

/// One maximal time range over which a command trigger stayed in the same
/// triggered state with the same value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutputValue {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub triggered: bool,
    pub value: f64,
    pub trigger_start_time: DateTime<Utc>,
    pub trigger_end_time: Option<DateTime<Utc>>,
}

impl CommandOutputValue {
    /// # Panics
    ///
    /// Panics when `start_time` exceeds `end_time`.
    pub fn new(
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        triggered: bool,
        value: f64,
        trigger_start_time: DateTime<Utc>,
        trigger_end_time: Option<DateTime<Utc>>,
    ) -> Self {
        assert!(start_time <= end_time, "interval start must not exceed end");
        Self {
            start_time,
            end_time,
            triggered,
            value,
            trigger_start_time,
            trigger_end_time,
        }
    }
}

impl OutputPayload for CommandOutputValue {
    fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    fn clone_with(
        output: &Self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        last: Option<&Self>,
    ) -> Self {
        assert!(start <= end, "interval start must not exceed end");
        if !output.triggered {
            if let Some(last) = last {
                if !last.triggered {
                    // A still-clear state must not keep overwriting the
                    // previously recorded clear-state metadata.
                    return Self {
                        start_time: start,
                        end_time: end,
                        triggered: last.triggered,
                        value: last.value,
                        trigger_start_time: last.trigger_start_time,
                        trigger_end_time: last.trigger_end_time,
                    };
                }
            }
        }
        Self {
            start_time: start,
            end_time: end,
            ..output.clone()
        }
    }

    fn is_same_state(&self, other: &Self) -> bool {
        (!self.triggered && !other.triggered)
            || (self.triggered && other.triggered && self.value == other.value)
    }
}

/// The fault-history channel of one actor: the boolean output intervals plus
/// the transition bookkeeping and per-trigger command series.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputValues {
    points: OutputSeries<OutputValue>,
    /// Number of transitions into a faulted state.
    pub faulted_count: usize,
    /// When the first transition into a faulted state was recorded.
    pub first_faulted_time: Option<DateTime<Utc>>,
    pub last_faulted_value: Option<OutputValue>,
    /// Variable snapshot from the most recent cycle whose result was true.
    pub last_triggered_values: Vec<(String, Value)>,
    /// Variable snapshot from the most recent cycle whose result was false.
    pub last_untriggered_values: Vec<(String, Value)>,
    /// When the boolean result last turned on / off.
    pub last_trigger_on_time: Option<DateTime<Utc>>,
    pub last_trigger_off_time: Option<DateTime<Utc>>,
    /// Names of the variables to snapshot on each valid output.
    pub variables_to_keep: Vec<String>,
    /// Number of samples this actor has processed.
    pub trigger_count: u64,
    /// Per-trigger command interval series, keyed by trigger id.
    pub commands: HashMap<String, OutputSeries<CommandOutputValue>>,
}

impl OutputValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> &[OutputValue] {
        self.points.points()
    }

    pub fn last(&self) -> Option<&OutputValue> {
        self.points.last()
    }

    /// The current faulted state: that of the last recorded interval.
    pub fn faulted(&self) -> bool {
        self.points.last().map(|p| p.faulted).unwrap_or(false)
    }

    /// Whether the last evaluation was valid. An empty history counts as
    /// valid: nothing has failed to evaluate yet.
    pub fn is_valid(&self) -> bool {
        self.points.last().map(|p| p.is_valid).unwrap_or(true)
    }

    pub fn command(&self, trigger_id: &str) -> Option<&OutputSeries<CommandOutputValue>> {
        self.commands.get(trigger_id)
    }

    /// Record one evaluation cycle's output as of `now`, maintaining the
    /// fault transition counters.
    pub fn with_output(
        &mut self,
        now: DateTime<Utc>,
        is_valid: bool,
        faulted: bool,
        variables: Vec<(String, Value)>,
        text: impl Into<String>,
        invalid_category: Option<InvalidCategory>,
    ) {
        let output = OutputValue::new(now, now, is_valid, faulted, variables, text, invalid_category);

        if output.faulted && !self.faulted() {
            self.faulted_count += 1;
            if self.first_faulted_time.is_none() {
                self.first_faulted_time = Some(output.start_time);
            }
        }
        if output.faulted {
            self.last_faulted_value = Some(output.clone());
        }

        self.points.with_output(now, output);
    }

    /// Record a command trigger state, creating the per-trigger series on
    /// first use.
    pub fn with_trigger(
        &mut self,
        trigger_id: &str,
        now: DateTime<Utc>,
        trigger_start_time: DateTime<Utc>,
        trigger_end_time: Option<DateTime<Utc>>,
        triggered: bool,
        value: f64,
    ) {
        let output = CommandOutputValue::new(
            now,
            now,
            triggered,
            value,
            trigger_start_time,
            trigger_end_time,
        );
        self.commands
            .entry(trigger_id.to_string())
            .or_default()
            .with_output(now, output);
    }

    /// Append a pre-built interval to the fault series; reruns writing over
    /// the same range purge what they overlap.
    ///
    /// # Panics
    ///
    /// Panics when the interval's start exceeds its end.
    pub fn add(&mut self, value: OutputValue) {
        self.points.add(value);
    }

    /// Overwrite the last fault interval, if any.
    ///
    /// # Panics
    ///
    /// Panics when the interval's start exceeds its end.
    pub fn replace_last(&mut self, value: OutputValue) {
        self.points.replace_last(value);
    }

    /// Rebuild the fault summary fields from the stored intervals.
    ///
    /// Legacy records predate the counters; when `first_faulted_time` was
    /// never populated, derive it (and the count and last faulted value)
    /// from the interval list.
    pub fn rebuild_fault_summary(&mut self) {
        if self.points.is_empty() || self.first_faulted_time.is_some() {
            return;
        }
        let faulted_points: Vec<&OutputValue> =
            self.points.points().iter().filter(|v| v.faulted).collect();
        if faulted_points.is_empty() {
            return;
        }
        self.faulted_count = faulted_points.len();
        self.first_faulted_time = faulted_points.first().map(|v| v.start_time);
        self.last_faulted_value = faulted_points.last().map(|&v| v.clone());
    }

    /// Trim the fault series and every command series. Returns the total
    /// number of intervals removed.
    pub fn apply_limits(&mut self, max_count: usize, min_date: DateTime<Utc>) -> usize {
        let mut removed = self.points.apply_limits(max_count, min_date);
        for series in self.commands.values_mut() {
            removed += series.apply_limits(max_count, min_date);
        }
        removed
    }
}
