use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use chunkline_protocol::messages::RetryOutcome;
use chunkline_protocol::{RetryLogEntry, UploadId};
use chunkline_store::RetryLogRepo;
use chunkline_transfer::UploadError;

use crate::engine::RecoveryEngine;
use crate::error::{RecoveryError, RecoveryResult};

impl RecoveryEngine {
    /// Uploads one chunk with up to `max_retries` attempts and exponential
    /// backoff between them. Every attempt lands in the retry log.
    pub async fn retry_chunk_upload(
        &self,
        upload_id: UploadId,
        chunk_number: u32,
        data: &[u8],
        max_retries: u32,
    ) -> RecoveryResult<RetryOutcome> {
        self.retry_chunk_upload_until(
            upload_id,
            chunk_number,
            data,
            max_retries,
            &CancellationToken::new(),
        )
        .await
    }

    /// Like [`retry_chunk_upload`](Self::retry_chunk_upload), giving up with
    /// [`RecoveryError::Cancelled`] as soon as `cancel` fires.
    pub async fn retry_chunk_upload_until(
        &self,
        upload_id: UploadId,
        chunk_number: u32,
        data: &[u8],
        max_retries: u32,
        cancel: &CancellationToken,
    ) -> RecoveryResult<RetryOutcome> {
        let max_retries = max_retries.max(1);
        let started = Instant::now();
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(RecoveryError::Cancelled);
            }

            let result = self
                .uploader
                .upload_chunk(upload_id, chunk_number, data)
                .await;
            self.log_attempt(upload_id, chunk_number, attempt, result.as_ref().err())
                .await;

            match result {
                Ok(_) => {
                    debug!(upload = %upload_id, chunk = chunk_number, attempt, "chunk uploaded");
                    return Ok(RetryOutcome {
                        success: true,
                        attempts: attempt,
                        total_time_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Err(e) if !e.is_retryable() => return Err(e.into()),
                Err(e) if attempt >= max_retries => {
                    warn!(
                        upload = %upload_id,
                        chunk = chunk_number,
                        attempts = attempt,
                        error = %e,
                        "retry budget exhausted"
                    );
                    return Err(RecoveryError::MaxRetriesExceeded {
                        chunk: chunk_number,
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    attempt += 1;
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    warn!(
                        upload = %upload_id,
                        chunk = chunk_number,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "chunk upload failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RecoveryError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn log_attempt(
        &self,
        upload_id: UploadId,
        chunk_number: u32,
        attempt: u32,
        error: Option<&UploadError>,
    ) {
        let entry = RetryLogEntry {
            upload_id,
            chunk_number,
            attempt_number: attempt,
            success: error.is_none(),
            error_type: error.map(UploadError::failure_kind),
            error_message: error.map(ToString::to_string),
            occurred_at: Utc::now(),
        };
        if let Err(e) = self.store.append_retry(&entry).await {
            warn!(upload = %upload_id, chunk = chunk_number, error = %e, "failed to record attempt");
        }
    }
}
