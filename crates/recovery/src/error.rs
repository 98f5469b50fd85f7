use chunkline_protocol::{Coded, ErrorCode, UploadId};
use chunkline_store::StoreError;
use chunkline_transfer::UploadError;

/// Errors produced by the recovery engine.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("upload expired: {0}")]
    UploadExpired(UploadId),

    #[error("chunk {chunk} still failing after {attempts} attempts: {last}")]
    MaxRetriesExceeded {
        chunk: u32,
        attempts: u32,
        #[source]
        last: UploadError,
    },

    #[error("recovery cancelled")]
    Cancelled,

    #[error("cleanup failed: {0}")]
    CleanupFailed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Coded for RecoveryError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::Upload(e) => e.code(),
            Self::Store(_) => ErrorCode::StorageError,
            Self::UploadExpired(_) => ErrorCode::UploadExpired,
            Self::MaxRetriesExceeded { .. } => ErrorCode::MaxRetriesExceeded,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::CleanupFailed(_) => ErrorCode::CleanupFailed,
            Self::InvalidArgument(_) => ErrorCode::InvalidMetadata,
        }
    }
}

pub type RecoveryResult<T> = std::result::Result<T, RecoveryError>;
