use std::fmt;

use serde::{Deserialize, Serialize};

/// Machine-readable error code carried across the service boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMetadata,
    InvalidChunk,
    ChecksumMismatch,
    InvalidState,
    SessionNotFound,
    SessionExpired,
    SessionCancelled,
    UploadExpired,
    ChunkUploadFailed,
    IncompleteUpload,
    FinalizeInProgress,
    AssemblyFailed,
    MaxRetriesExceeded,
    InsufficientData,
    CleanupFailed,
    StorageError,
    Cancelled,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidMetadata => "INVALID_METADATA",
            Self::InvalidChunk => "INVALID_CHUNK",
            Self::ChecksumMismatch => "CHECKSUM_MISMATCH",
            Self::InvalidState => "INVALID_STATE",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::SessionCancelled => "SESSION_CANCELLED",
            Self::UploadExpired => "UPLOAD_EXPIRED",
            Self::ChunkUploadFailed => "CHUNK_UPLOAD_FAILED",
            Self::IncompleteUpload => "INCOMPLETE_UPLOAD",
            Self::FinalizeInProgress => "FINALIZE_IN_PROGRESS",
            Self::AssemblyFailed => "ASSEMBLY_FAILED",
            Self::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
            Self::InsufficientData => "INSUFFICIENT_DATA",
            Self::CleanupFailed => "CLEANUP_FAILED",
            Self::StorageError => "STORAGE_ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Session lifecycle violations that no amount of retrying will fix.
    pub fn is_session_violation(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound
                | Self::SessionExpired
                | Self::SessionCancelled
                | Self::UploadExpired
                | Self::InvalidState
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_match_display() {
        for code in [
            ErrorCode::InvalidMetadata,
            ErrorCode::SessionNotFound,
            ErrorCode::IncompleteUpload,
            ErrorCode::MaxRetriesExceeded,
            ErrorCode::FinalizeInProgress,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn session_violations() {
        assert!(ErrorCode::SessionExpired.is_session_violation());
        assert!(ErrorCode::UploadExpired.is_session_violation());
        assert!(!ErrorCode::ChunkUploadFailed.is_session_violation());
    }
}
