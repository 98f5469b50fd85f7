use chrono::Utc;
use tracing::debug;

use chunkline_protocol::messages::ResumeInfo;
use chunkline_protocol::{UploadId, UploadStatus};
use chunkline_transfer::percent_floor;

use crate::engine::{RecoveryEngine, missing_chunks};
use crate::error::{RecoveryError, RecoveryResult};

impl RecoveryEngine {
    /// What is left to send for `upload_id`.
    pub async fn get_resume_info(&self, upload_id: UploadId) -> RecoveryResult<ResumeInfo> {
        let session = self.load_session(upload_id).await?;
        if session.status == UploadStatus::Expired || session.is_expired_at(Utc::now()) {
            return Err(RecoveryError::UploadExpired(upload_id));
        }

        let completed = self.completed_chunks(&session).await?;
        let missing = missing_chunks(session.total_chunks, &completed);
        let completed_count = completed.len() as u32;
        debug!(
            upload = %upload_id,
            completed = completed_count,
            missing = missing.len(),
            "resume info"
        );

        Ok(ResumeInfo {
            upload_id,
            status: session.status,
            can_resume: session.status != UploadStatus::Completed && !missing.is_empty(),
            progress: percent_floor(completed_count, session.total_chunks),
            completed_chunks: completed.into_iter().collect(),
            missing_chunks: missing,
            total_chunks: session.total_chunks,
            chunk_size: session.chunk_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use chunkline_protocol::ErrorCode;
    use chunkline_protocol::Coded;
    use chunkline_transfer::UploadError;

    use super::*;
    use crate::engine::testing::{Harness, fast_config};

    #[tokio::test]
    async fn reports_missing_and_progress() {
        let h = Harness::new();
        let s = h.session(5).await;
        h.put(s.id, &[3, 1]).await;

        let info = h.engine(fast_config()).get_resume_info(s.id).await.unwrap();
        assert_eq!(info.completed_chunks, vec![1, 3]);
        assert_eq!(info.missing_chunks, vec![2, 4, 5]);
        assert_eq!(info.progress, 40);
        assert!(info.can_resume);
        assert_eq!(info.status, UploadStatus::Uploading);
        assert_eq!(info.total_chunks, 5);
    }

    #[tokio::test]
    async fn nothing_to_resume_when_all_present() {
        let h = Harness::new();
        let s = h.session(2).await;
        h.put(s.id, &[1, 2]).await;
        let info = h.engine(fast_config()).get_resume_info(s.id).await.unwrap();
        assert!(!info.can_resume);
        assert_eq!(info.progress, 100);
    }

    #[tokio::test]
    async fn expired_upload_is_rejected() {
        let h = Harness::new();
        let mut s = h.session(2).await;
        s.expires_at = Utc::now() - Duration::seconds(1);
        h.store.put_session(s.clone()).await;

        let err = h.engine(fast_config()).get_resume_info(s.id).await.unwrap_err();
        assert!(matches!(err, RecoveryError::UploadExpired(_)));
        assert_eq!(err.code(), ErrorCode::UploadExpired);
    }

    #[tokio::test]
    async fn unknown_upload_is_not_found() {
        let h = Harness::new();
        let err = h
            .engine(fast_config())
            .get_resume_info(UploadId::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RecoveryError::Upload(UploadError::SessionNotFound(_))
        ));
    }
}
