use chunkline_protocol::{Coded, ErrorCode, FailureKind, UploadId, UploadStatus};
use chunkline_store::StoreError;

/// Errors produced by session, ingest, finalize and progress operations.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("checksum mismatch on chunk {chunk}")]
    ChecksumMismatch { chunk: u32 },

    #[error("upload {id} is {status}")]
    InvalidState { id: UploadId, status: UploadStatus },

    #[error("session not found: {0}")]
    SessionNotFound(UploadId),

    #[error("session expired: {0}")]
    SessionExpired(UploadId),

    #[error("session cancelled: {0}")]
    SessionCancelled(UploadId),

    #[error("failed to store chunk {chunk} ({kind}): {source}")]
    ChunkUploadFailed {
        chunk: u32,
        kind: FailureKind,
        #[source]
        source: StoreError,
    },

    #[error("incomplete upload: {present}/{total} chunks present")]
    IncompleteUpload { present: u32, total: u32 },

    #[error("incomplete upload: received {received} of {expected} bytes")]
    ByteCountMismatch { received: u64, expected: u64 },

    #[error("finalize already in progress for {0}")]
    FinalizeInProgress(UploadId),

    #[error("assembly failed: {0}")]
    AssemblyFailed(String),

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl UploadError {
    /// Whether another attempt at the same chunk may succeed.
    ///
    /// Session lifecycle violations and malformed chunks are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ChecksumMismatch { .. } | Self::Io(_) => true,
            Self::ChunkUploadFailed { source, .. } | Self::Store(source) => source.is_transient(),
            _ => false,
        }
    }

    /// Retry-log classification of this error.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::ChunkUploadFailed { kind, .. } => *kind,
            Self::ChecksumMismatch { .. } => FailureKind::ChecksumMismatch,
            Self::SessionNotFound(_)
            | Self::SessionExpired(_)
            | Self::SessionCancelled(_)
            | Self::InvalidState { .. } => FailureKind::SessionError,
            Self::Store(e) => e.failure_kind(),
            Self::Io(_) => FailureKind::StorageError,
            _ => FailureKind::Unknown,
        }
    }
}

impl Coded for UploadError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidMetadata(_) => ErrorCode::InvalidMetadata,
            Self::InvalidChunk(_) => ErrorCode::InvalidChunk,
            Self::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            Self::InvalidState { .. } => ErrorCode::InvalidState,
            Self::SessionNotFound(_) => ErrorCode::SessionNotFound,
            Self::SessionExpired(_) => ErrorCode::SessionExpired,
            Self::SessionCancelled(_) => ErrorCode::SessionCancelled,
            Self::ChunkUploadFailed { .. } => ErrorCode::ChunkUploadFailed,
            Self::IncompleteUpload { .. } | Self::ByteCountMismatch { .. } => {
                ErrorCode::IncompleteUpload
            }
            Self::FinalizeInProgress(_) => ErrorCode::FinalizeInProgress,
            Self::AssemblyFailed(_) => ErrorCode::AssemblyFailed,
            Self::InsufficientData(_) => ErrorCode::InsufficientData,
            Self::Io(_) | Self::Store(_) => ErrorCode::StorageError,
        }
    }
}

pub type UploadResult<T> = std::result::Result<T, UploadError>;
