//! Driver error types.

use chunkline_protocol::{Coded, ErrorCode, UploadId};
use chunkline_recovery::RecoveryError;
use chunkline_transfer::UploadError;

/// Errors produced while driving a whole-file upload.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error("file does not match upload {upload_id}: {reason}")]
    FileMismatch { upload_id: UploadId, reason: String },

    #[error("cancelled")]
    Cancelled,
}

impl DriverError {
    /// Whether a later run may pick the upload up again.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Self::Cancelled
                | Self::Recovery(RecoveryError::Cancelled)
                | Self::Recovery(RecoveryError::MaxRetriesExceeded { .. })
        )
    }
}

impl Coded for DriverError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::Upload(e) => e.code(),
            Self::Recovery(e) => e.code(),
            Self::FileMismatch { .. } => ErrorCode::InvalidMetadata,
            Self::Cancelled => ErrorCode::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_pass_through() {
        let id = UploadId::new();
        assert_eq!(
            DriverError::from(UploadError::SessionExpired(id)).code(),
            ErrorCode::SessionExpired
        );
        assert_eq!(
            DriverError::from(RecoveryError::UploadExpired(id)).code(),
            ErrorCode::UploadExpired
        );
        assert_eq!(DriverError::Cancelled.code(), ErrorCode::Cancelled);
    }

    #[test]
    fn only_transient_outcomes_are_resumable() {
        assert!(DriverError::Cancelled.is_resumable());
        assert!(DriverError::from(RecoveryError::Cancelled).is_resumable());
        assert!(!DriverError::from(UploadError::SessionCancelled(UploadId::new())).is_resumable());
    }
}
