//! Stateful core of the siterules engine: fault-detection and
//! calculated-point evaluation state over streaming telemetry.
//!
//! For each monitored rule instance the core ingests timestamped samples
//! per named signal (bounding memory through cone-narrowing trajectory
//! compression in [`compressor`] and [`buffer`]), folds each evaluation
//! cycle's result into a compact non-overlapping interval history
//! ([`output`]), and composes both per actor ([`actor`]). The
//! [`execution`] record tracks how far incremental batch runs have
//! progressed so re-runs can resume or restart safely.
//!
//! Everything here is plain in-memory data: no I/O, no blocking, no
//! internal locking. Each [`actor::ActorState`] must be mutated by exactly
//! one logical writer at a time; concurrency across actors belongs to the
//! caller.

pub mod actor;
pub mod buffer;
pub mod compressor;
pub mod config;
pub mod error;
pub mod execution;
pub mod output;


use serde::{Deserialize, Serialize};
use siterules_common::types::CumulativeType;

/// Field id of the canonical boolean result buffer.
pub const RESULT_FIELD: &str = "result";

/// Name of the internal faulted-time accumulator buffer; never fully
/// cleared by retention.
pub const TIME_FIELD: &str = "TIME";

/// Unit given to accumulated values when none is declared.
pub const SCALAR_UNIT: &str = "scalar";

/// One bound parameter of a rule instance, as the retention logic sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundParameter {
    pub field_id: String,
    #[serde(default)]
    pub cumulative: CumulativeType,
    /// Field ids this parameter's expression reads temporally (inside
    /// windowing functions). A temporal reference keeps the target buffer
    /// fully retained.
    #[serde(default)]
    pub temporal_references: Vec<String>,
}

/// Per-rule-instance policy consumed by retention and output snapshotting.
///
/// Implemented by the (external) rule binding layer; the core never parses
/// expressions itself, it only asks what the binding established.
pub trait RulePolicy {
    /// Bound parameters in evaluation order.
    fn bound_parameters(&self) -> &[BoundParameter];

    /// Variable names to snapshot on each valid output.
    fn variables_to_keep(&self) -> &[String];
}

/// Read-only view of the expression environment, used to snapshot declared
/// variables when an output is recorded.
pub trait VariableSource {
    fn bound_value(&self, name: &str) -> Option<serde_json::Value>;
}

impl VariableSource for std::collections::HashMap<String, serde_json::Value> {
    fn bound_value(&self, name: &str) -> Option<serde_json::Value> {
        self.get(name).cloned()
    }
}
