use thiserror::Error;

/// Error taxonomy for metadata-store interactions.
///
/// Every gateway operation resolves to one of these classes; callers decide
/// between dropping the job (`Conflict`, `LockLost`), retrying on the next
/// tick (`Transient`), skipping a record (`Validation`), or crashing
/// (`Fatal`).
#[derive(Error, Debug)]
pub enum MdsError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("lock lost: {0}")]
    LockLost(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl MdsError {
    /// True for errors the tick loop should retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, MdsError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, MdsError>;
