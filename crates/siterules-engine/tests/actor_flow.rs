//! End-to-end flow over the public API: ingest samples, evaluate, backdate
//! fault transitions, rewind, and apply retention limits.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use siterules_common::types::{CumulativeType, TimedValue};
use siterules_engine::actor::ActorState;
use siterules_engine::config::EngineLimits;
use siterules_engine::{BoundParameter, RulePolicy, RESULT_FIELD};
use std::collections::HashMap;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

fn at_min(minutes: i64) -> DateTime<Utc> {
    start() + Duration::minutes(minutes)
}

struct ZoneTempPolicy {
    params: Vec<BoundParameter>,
    vars: Vec<String>,
}

impl ZoneTempPolicy {
    fn new() -> Self {
        Self {
            params: vec![
                BoundParameter {
                    field_id: RESULT_FIELD.to_string(),
                    cumulative: CumulativeType::Simple,
                    temporal_references: Vec::new(),
                },
                BoundParameter {
                    field_id: "zone_temp".to_string(),
                    cumulative: CumulativeType::Simple,
                    temporal_references: Vec::new(),
                },
            ],
            vars: vec!["zone_temp".to_string()],
        }
    }
}

impl RulePolicy for ZoneTempPolicy {
    fn bound_parameters(&self) -> &[BoundParameter] {
        &self.params
    }

    fn variables_to_keep(&self) -> &[String] {
        &self.vars
    }
}

/// One evaluation cycle: ingest the temperature, derive the boolean result
/// (faulted above 25 degrees), record the outcome.
fn cycle(actor: &mut ActorState, sample_min: i64, eval_min: i64, temp: f64) {
    actor.extend(
        TimedValue::new_double(at_min(sample_min), temp),
        "zone_temp",
        "degC",
        true,
        false,
    );
    let faulted = temp > 25.0;
    actor.extend(
        TimedValue::new_bool(at_min(sample_min), faulted),
        RESULT_FIELD,
        "bool",
        false,
        false,
    );

    let mut env: HashMap<String, Value> = HashMap::new();
    env.insert("zone_temp".to_string(), json!(temp));
    actor.valid_output(at_min(eval_min), faulted, &env);
}

#[test]
fn fault_cycle_with_backdating_rewind_and_limits() {
    let policy = ZoneTempPolicy::new();
    let mut actor = ActorState::new("overheat-rule", "overheat-rule_zone-1", start(), 1);
    actor.refresh_from_policy(&policy);

    // Three healthy hours, two faulted hours, then recovery. Some
    // evaluations run late; the recorded boundaries must not.
    cycle(&mut actor, 0, 0, 21.0);
    cycle(&mut actor, 60, 60, 22.0);
    cycle(&mut actor, 120, 120, 23.0);
    cycle(&mut actor, 180, 210, 26.0); // evaluated 30 min late
    cycle(&mut actor, 240, 240, 27.0);
    cycle(&mut actor, 300, 315, 22.0); // evaluated 15 min late

    let points = actor.output_values.points().to_vec();
    assert_eq!(points.len(), 3);

    // Healthy interval spans the first three hours.
    assert_eq!(points[0].start_time, at_min(0));
    assert_eq!(points[0].end_time, at_min(120));
    assert!(!points[0].faulted);

    // The faulted interval starts when the result actually turned on, not
    // when the late evaluation ran.
    assert_eq!(points[1].start_time, at_min(180));
    assert_eq!(points[1].end_time, at_min(240));
    assert!(points[1].faulted);
    assert_eq!(
        points[1].variables,
        vec![("zone_temp".to_string(), json!(26.0))]
    );

    // Recovery backdates to the off transition as well.
    assert_eq!(points[2].start_time, at_min(300));
    assert!(!points[2].faulted);

    assert_eq!(actor.output_values.faulted_count, 1);
    assert_eq!(actor.output_values.first_faulted_time, Some(at_min(180)));
    assert!(!actor.has_overlapping_output_values());

    // Hard rewind to hour two, then reprocess forward from there.
    actor.remove_values_after(at_min(120));
    assert_eq!(actor.timed_values[RESULT_FIELD].len(), 1);

    cycle(&mut actor, 150, 150, 24.0);

    let points = actor.output_values.points().to_vec();
    assert_eq!(points.len(), 1, "future intervals dropped on rewind");
    assert_eq!(points[0].start_time, at_min(0));
    assert_eq!(points[0].end_time, at_min(150));
    assert!(!points[0].faulted);
    assert!(!actor.has_overlapping_output_values());

    // Retention: the result buffer is tracked, the raw temperature is not.
    let (_removed, total_tracked) =
        actor.apply_limits(&policy, at_min(150), Duration::days(30), true);
    assert_eq!(total_tracked, 1);
    assert!(actor.timed_values["zone_temp"].len() <= 3);
    assert!(actor.timed_values[RESULT_FIELD].len() >= 1);
    assert!(actor.timed_values["zone_temp"].check_in_order());

    // Output trimming on save keeps everything this recent.
    let removed = actor.apply_output_limits(&EngineLimits::default(), at_min(150));
    assert_eq!(removed, 0);
    assert_eq!(actor.output_values.points().len(), 1);
}
