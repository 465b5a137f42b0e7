use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Progress record for one incremental batch-execution window of a rule
/// (or of all rules), persisted by the scheduler between runs.
///
/// States are implicit in the fields: fresh (no work done), extending
/// (`target_end_date > completed_end_date`), caught up (the two are equal).
/// A restart is modeled externally: discard this record and create a new
/// one, which gets a fresh `generation` — there is deliberately no in-place
/// reset, so a stale worker can never keep writing into a superseded
/// window. In-flight work must compare its generation against the current
/// record before persisting results, and discard on mismatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleExecution {
    pub id: String,
    pub customer_environment_id: String,
    pub rule_id: String,
    /// Opaque id distinguishing successive incompatible windows.
    pub generation: String,
    /// Completion percentage for progress display.
    pub percentage: f64,
    pub start_date: DateTime<Utc>,
    /// How far evaluation has actually progressed. Never exceeds
    /// `target_end_date`.
    pub completed_end_date: DateTime<Utc>,
    /// Where the window is headed. Only ever moves forward.
    pub target_end_date: DateTime<Utc>,
}

impl RuleExecution {
    pub fn new(
        id: impl Into<String>,
        customer_environment_id: impl Into<String>,
        rule_id: impl Into<String>,
        start_date: DateTime<Utc>,
        target_end_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            customer_environment_id: customer_environment_id.into(),
            rule_id: rule_id.into(),
            generation: siterules_common::id::next_id(),
            percentage: 0.0,
            start_date,
            completed_end_date: start_date,
            target_end_date,
        }
    }

    /// Extend the window's target end.
    ///
    /// A `start_date` before this execution's own start is rejected: that
    /// case must go through a restart (a new record, new generation), never
    /// a bump. An `end_date` that does not exceed the current target is a
    /// no-op. Returns true when the target advanced.
    pub fn bump_end_date(
        &mut self,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        if start_date < self.start_date {
            return Err(EngineError::ExecutionRestartRequired {
                requested: start_date,
                start: self.start_date,
            });
        }
        if end_date <= self.target_end_date {
            return Ok(false);
        }
        self.target_end_date = end_date;
        Ok(true)
    }

    /// Whether a requested `[new_start, new_end]` range can only be served
    /// by restarting: the start precedes what this window ever covered.
    pub fn needs_to_restart(&self, new_start: DateTime<Utc>, _new_end: DateTime<Utc>) -> bool {
        new_start < self.start_date
    }

    /// Interval-overlap test between the two `[start, target_end]` ranges.
    pub fn overlaps(&self, other: &RuleExecution) -> bool {
        self.start_date <= other.target_end_date && other.start_date <= self.target_end_date
    }

    /// True when this execution's range fully contains the other's.
    pub fn consumes(&self, other: &RuleExecution) -> bool {
        self.start_date <= other.start_date && self.target_end_date >= other.target_end_date
    }

    /// Record progress through `date`, clamped to the target end, and keep
    /// the percentage in step.
    pub fn mark_completed_through(&mut self, date: DateTime<Utc>) {
        self.completed_end_date = date.min(self.target_end_date);
        let total = (self.target_end_date - self.start_date).num_milliseconds();
        self.percentage = if total > 0 {
            let done = (self.completed_end_date - self.start_date).num_milliseconds();
            (done as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
        } else {
            100.0
        };
    }

    pub fn is_caught_up(&self) -> bool {
        self.completed_end_date >= self.target_end_date
    }
}
