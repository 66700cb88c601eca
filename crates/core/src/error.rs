//! Error taxonomy shared by every crate in the workspace.

use crate::EntityId;

/// Errors surfaced by the proximity pipeline and the boost path.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Caller bug: bad coordinate, non-positive radius, malformed id or filter. Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("store unavailable ({context}): {message}")]
    StoreUnavailable { context: String, message: String },
    #[error("timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },
    /// Expected business condition; the UI turns it into a purchase prompt.
    #[error("insufficient credits for {id}")]
    InsufficientCredits { id: EntityId },
    /// One or more interval queries failed; the whole search is rejected.
    #[error("{failed} of {total} interval queries failed: {detail}")]
    PartialResultsSuppressed { failed: usize, total: usize, detail: String },
    #[error("entity not found: {0}")]
    NotFound(EntityId),
    #[error("conflicting credit update on {id} after {attempts} attempts")]
    Conflict { id: EntityId, attempts: u32 },
}

impl Error {
    /// Transient infrastructure failures a caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable { .. } | Error::Timeout { .. } | Error::PartialResultsSuppressed { .. }
        )
    }

    /// Wrap an adapter error with the operation context (interval, entity).
    pub fn store(context: impl Into<String>, err: StoreError) -> Self {
        Error::StoreUnavailable { context: context.into(), message: err.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by a `GeoStore` adapter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// Conditional write lost the race: the stored credit count moved.
    #[error("credit mismatch: expected {expected}, found {actual}")]
    Conflict { expected: u32, actual: u32 },
    #[error("not found")]
    NotFound,
    #[error("corrupt record: {0}")]
    Corrupt(String),
}
