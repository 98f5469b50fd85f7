//! Store error types.

use chunkline_protocol::{Coded, ErrorCode, FailureKind};

/// Persistence backend errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store timed out: {0}")]
    Timeout(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unavailable(_))
    }

    /// Retry-log classification of this error.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Timeout(_) => FailureKind::NetworkTimeout,
            Self::Unavailable(_) => FailureKind::ServerError,
            Self::NotFound(_) | Self::AlreadyExists(_) | Self::Conflict(_) | Self::Internal(_) => {
                FailureKind::StorageError
            }
        }
    }
}

impl Coded for StoreError {
    fn code(&self) -> ErrorCode {
        ErrorCode::StorageError
    }
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
