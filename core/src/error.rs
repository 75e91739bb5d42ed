use thiserror::Error;

use crate::types::OpTime;

/// Failures surfaced by a database driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver: {0}")]
    Backend(Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("{0}")]
    Other(String),
}

impl DriverError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self { DriverError::Backend(Box::new(err)) }

    pub fn other(msg: impl Into<String>) -> Self { DriverError::Other(msg.into()) }
}

/// Failures surfaced to the engine's caller.
///
/// Transient cursor death (capped-collection rollover of the cursor,
/// replica-set election) is recovered internally and never appears here.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Opening a cursor with an empty registry. Register before iterating.
    #[error("nothing to watch")]
    NothingToWatch,

    /// The journal no longer reaches back to the watermark, so entries may
    /// have been lost. The caller must re-snapshot its queries.
    #[error("journal rolled past watermark {watermark} (earliest retained entry: {earliest})")]
    WatermarkLost { watermark: OpTime, earliest: OpTime },

    #[error("driver: {0}")]
    Driver(#[from] DriverError),

    /// A caller-provided predicate failed to evaluate. Predicates are caller
    /// logic; their errors indicate caller bugs and are never swallowed.
    #[error("predicate: {0}")]
    Predicate(#[from] moql::Error),
}
