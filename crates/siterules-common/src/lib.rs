//! Shared leaf types for the siterules engine.
//!
//! The sample model ([`types::TimedValue`]) and the process-wide id
//! generator live here so that the engine core and its external
//! collaborators (schedulers, persistence) agree on one vocabulary.

pub mod id;
pub mod types;
