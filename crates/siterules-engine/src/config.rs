use crate::compressor::TrajectoryCompressor;
use serde::{Deserialize, Serialize};

/// Retention and compression tuning for the engine core.
///
/// Owning services deserialize this from their configuration and drive the
/// periodic maintenance entry points with it; every field has a default so
/// a missing section falls back to production values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineLimits {
    /// Error band for trajectory compression, as a fraction of RMS.
    #[serde(default = "default_compression")]
    pub compression: f64,
    /// Upper bound on how far back any input buffer may reach, in days.
    #[serde(default = "default_max_buffer_days")]
    pub max_buffer_days: u32,
    /// Maximum number of output intervals to retain per series.
    #[serde(default = "default_max_output_count")]
    pub max_output_count: usize,
    /// Maximum age of output intervals to retain, in days.
    #[serde(default = "default_max_output_days")]
    pub max_output_days: u32,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            compression: default_compression(),
            max_buffer_days: default_max_buffer_days(),
            max_output_count: default_max_output_count(),
            max_output_days: default_max_output_days(),
        }
    }
}

impl EngineLimits {
    /// A compressor using the configured error band.
    pub fn compressor(&self) -> TrajectoryCompressor {
        TrajectoryCompressor::new(self.compression)
    }
}

fn default_compression() -> f64 {
    crate::compressor::DEFAULT_COMPRESSION
}

fn default_max_buffer_days() -> u32 {
    365
}

fn default_max_output_count() -> usize {
    2500
}

fn default_max_output_days() -> u32 {
    365
}
