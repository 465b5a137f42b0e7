use chrono::{DateTime, Utc};

/// Errors raised by the engine core.
///
/// The taxonomy is deliberately narrow: the core performs no I/O and no
/// retries, so everything here is a caller contract violation. Data-quality
/// conditions (missing/invalid/insufficient samples) are NOT errors — they
/// are recorded as first-class output states.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// An execution window was asked to move its start backward, which must
    /// go through a restart with a fresh generation instead of a bump.
    #[error(
        "Engine: execution window starting at {start} cannot be bumped back to {requested}; \
         restart with a new generation instead"
    )]
    ExecutionRestartRequired {
        requested: DateTime<Utc>,
        start: DateTime<Utc>,
    },
}

/// Convenience `Result` alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
