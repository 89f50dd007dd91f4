use std::time::Duration;

/// Errors surfaced by the persistence layer.
///
/// The capture-to-persistence pipeline absorbs transient failures internally
/// (retry with backoff, counters); only [`StoreError::Permanent`] refuses
/// startup. Query-path variants (`NotFound`, `Conflict`, `InvalidArgument`)
/// surface verbatim to the adapter layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A write or open failed and the retry budget is exhausted.
    #[error("storage failure after {attempts} attempts: {source}")]
    Transient {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    /// Schema migration failure or database corruption.
    #[error("permanent storage failure: {0}")]
    Permanent(String),

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            other => StoreError::Transient {
                attempts: 1,
                source: other,
            },
        }
    }
}

/// Errors raised while opening the capture interface.
///
/// Never fatal to the orchestrator: capture stays disabled and the failure
/// is recorded in the health snapshot.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("interface {0:?} not found")]
    InterfaceNotFound(String),

    #[error("failed to open {interface:?}: {reason}")]
    OpenFailed { interface: String, reason: String },

    #[error("invalid filter expression {filter:?}: {reason}")]
    BadFilter { filter: String, reason: String },
}

/// Exponential backoff delay for the given retry attempt (0-based), capped.
pub fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let factor = 1u32 << attempt.min(10);
    base.saturating_mul(factor).min(cap)
}
