//! Upload driver for whole files.
//!
//! Splits a local file into chunks, sends the missing ones with bounded
//! parallelism through the recovery engine's retry loop, reports progress
//! and finalizes.

use std::path::Path;
use std::sync::Arc;

use futures_util::{StreamExt, stream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chunkline_protocol::{FileMetadata, OwnerContext, UploadId, UploadSession};
use chunkline_recovery::{RecoveryEngine, RecoveryError};
use chunkline_transfer::{
    Chunk, ChunkReader, Finalizer, ProgressTracker, SessionManager, SpeedCalculator, UploadError,
};

use crate::error::DriverError;
use crate::types::{DriverConfig, DriverEvent, DriverResult};

/// Drives chunked uploads of local files end to end.
pub struct UploadDriver {
    sessions: SessionManager,
    recovery: Arc<RecoveryEngine>,
    finalizer: Arc<Finalizer>,
    progress: Arc<ProgressTracker>,
    config: DriverConfig,
    events_tx: mpsc::Sender<DriverEvent>,
    events_rx: Option<mpsc::Receiver<DriverEvent>>,
    cancel: CancellationToken,
}

impl UploadDriver {
    pub fn new(
        sessions: SessionManager,
        recovery: Arc<RecoveryEngine>,
        finalizer: Arc<Finalizer>,
        progress: Arc<ProgressTracker>,
        config: DriverConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            sessions,
            recovery,
            finalizer,
            progress,
            config,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<DriverEvent>> {
        self.events_rx.take()
    }

    /// Returns a cancellation token for uploads run by this driver.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Uploads `path` as a new upload owned by `owner`.
    pub async fn upload_file(
        &self,
        path: &Path,
        owner: OwnerContext,
    ) -> Result<DriverResult, DriverError> {
        let chunk_size = self
            .config
            .chunk_size
            .unwrap_or(self.sessions.config().default_chunk_size);
        let reader = ChunkReader::new(path, chunk_size).map_err(|e| self.fail(None, e.into()))?;

        let session = self
            .sessions
            .initialize(FileMetadata {
                file_name: reader.file_name().to_string(),
                file_size: reader.file_size(),
                chunk_size: Some(reader.chunk_size()),
                owner,
            })
            .await
            .map_err(|e| self.fail(None, e.into()))?;

        let missing = (1..=session.total_chunks).collect();
        self.drive(session, path, missing).await
    }

    /// Continues `upload_id` from `path`, sending only the chunks the store
    /// doesn't have yet.
    pub async fn resume_file(
        &self,
        upload_id: UploadId,
        path: &Path,
    ) -> Result<DriverResult, DriverError> {
        let info = self
            .recovery
            .get_resume_info(upload_id)
            .await
            .map_err(|e| self.fail(Some(upload_id), e.into()))?;
        let session = self
            .sessions
            .validate(upload_id)
            .await
            .map_err(|e| self.fail(Some(upload_id), e.into()))?;

        let reader = ChunkReader::new(path, session.chunk_size)
            .map_err(|e| self.fail(Some(upload_id), e.into()))?;
        if reader.file_size() != session.file_size {
            let err = DriverError::FileMismatch {
                upload_id,
                reason: format!(
                    "file is {} bytes, upload expects {}",
                    reader.file_size(),
                    session.file_size
                ),
            };
            return Err(self.fail(Some(upload_id), err));
        }

        info!(
            upload = %upload_id,
            missing = info.missing_chunks.len(),
            present = info.completed_chunks.len(),
            "resuming upload"
        );
        self.drive(session, path, info.missing_chunks).await
    }

    async fn drive(
        &self,
        session: UploadSession,
        path: &Path,
        missing: Vec<u32>,
    ) -> Result<DriverResult, DriverError> {
        let upload_id = session.id;
        let chunks_skipped = session.total_chunks - missing.len() as u32;

        let bytes_sent = match self.send_missing(&session, path, &missing).await {
            Ok(bytes) => bytes,
            Err(e) => {
                if matches!(e, DriverError::Recovery(_)) && !e.is_resumable() {
                    if let Err(mark) = self.sessions.mark_failed(upload_id, &e.to_string()).await {
                        warn!(upload = %upload_id, error = %mark, "could not mark upload failed");
                    }
                }
                return Err(self.fail(Some(upload_id), e));
            }
        };

        let artifact = self
            .finalizer
            .finalize(upload_id)
            .await
            .map_err(|e| self.fail(Some(upload_id), e.into()))?;

        info!(
            upload = %upload_id,
            sent = missing.len(),
            skipped = chunks_skipped,
            bytes = bytes_sent,
            "upload completed"
        );
        self.emit(DriverEvent::Completed(artifact.clone()));

        Ok(DriverResult {
            upload_id,
            artifact,
            chunks_sent: missing.len() as u32,
            chunks_skipped,
            bytes_sent,
        })
    }

    /// Sends `missing` and returns the bytes delivered. Stops at the first
    /// chunk that cannot be delivered.
    async fn send_missing(
        &self,
        session: &UploadSession,
        path: &Path,
        missing: &[u32],
    ) -> Result<u64, DriverError> {
        if self.cancel.is_cancelled() {
            return Err(DriverError::Cancelled);
        }

        let pending: u64 = missing.iter().map(|&n| session.expected_chunk_size(n)).sum();
        let mut remaining = pending;
        let speed = SpeedCalculator::new(None, None);
        // Marks the start of the window.
        speed.add_sample(0);

        let mut results = stream::iter(missing.iter().copied())
            .map(|n| self.send_chunk(session, path, n))
            .buffer_unordered(self.config.parallelism.max(1));

        while let Some((chunk, result)) = results.next().await {
            match result {
                Ok(bytes) => {
                    remaining = remaining.saturating_sub(bytes);
                    speed.add_sample(bytes);
                    self.emit_progress(session.id, &speed, remaining).await;
                }
                Err(e) => {
                    warn!(upload = %session.id, chunk, error = %e, "chunk not delivered");
                    self.emit(DriverEvent::ChunkFailed {
                        upload_id: session.id,
                        chunk,
                        error: e.to_string(),
                    });
                    return Err(e);
                }
            }
        }
        Ok(pending - remaining)
    }

    async fn send_chunk(
        &self,
        session: &UploadSession,
        path: &Path,
        number: u32,
    ) -> (u32, Result<u64, DriverError>) {
        let result = async {
            let chunk = read_chunk(path, session.chunk_size, number).await?;
            let outcome = self
                .recovery
                .retry_chunk_upload_until(
                    session.id,
                    number,
                    &chunk.data,
                    self.recovery.config().retry.max_retries,
                    &self.cancel,
                )
                .await
                .map_err(|e| match e {
                    RecoveryError::Cancelled => DriverError::Cancelled,
                    other => DriverError::Recovery(other),
                })?;
            debug!(
                upload = %session.id,
                chunk = number,
                attempts = outcome.attempts,
                "chunk delivered"
            );
            Ok::<_, DriverError>(chunk.data.len() as u64)
        }
        .await;
        (number, result)
    }

    async fn emit_progress(&self, upload_id: UploadId, speed: &SpeedCalculator, remaining: u64) {
        match self.progress.progress_update(upload_id).await {
            Ok(mut update) => {
                let live = speed.bytes_per_second();
                if live > 0.0 {
                    update.upload_speed = Some(live);
                    update.estimated_time_remaining =
                        speed.eta(remaining).map(|d| d.as_secs_f64());
                }
                self.emit(DriverEvent::Progress(update));
            }
            Err(e) => debug!(upload = %upload_id, error = %e, "progress unavailable"),
        }
    }

    /// Logs `err`, reports it on the event channel and hands it back.
    fn fail(&self, upload_id: Option<UploadId>, err: DriverError) -> DriverError {
        match upload_id {
            Some(id) => error!(upload = %id, error = %err, "upload failed"),
            None => error!(error = %err, "upload failed"),
        }
        self.emit(DriverEvent::Failed {
            upload_id,
            error: err.to_string(),
        });
        err
    }

    fn emit(&self, event: DriverEvent) {
        // Events are best-effort; a slow or absent consumer never stalls uploads.
        if self.events_tx.try_send(event).is_err() {
            debug!("driver event dropped");
        }
    }
}

async fn read_chunk(path: &Path, chunk_size: u64, number: u32) -> Result<Chunk, UploadError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || ChunkReader::new(&path, chunk_size)?.read_chunk(number))
        .await
        .map_err(|e| UploadError::Io(std::io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chunkline_protocol::messages::ChunkResult;
    use chunkline_protocol::{FailureKind, MIN_CHUNK_SIZE, UploadStatus};
    use chunkline_recovery::{RecoveryConfig, RetryPolicy};
    use chunkline_store::{MemoryUploadStore, RetryLogRepo, SessionRepo, StoreError};
    use chunkline_transfer::{
        ChunkIngest, ChunkUploader, FinalizeConfig, SessionConfig, UploadResult,
        calculate_file_checksum,
    };
    use tempfile::NamedTempFile;

    use super::*;

    const CHUNK: u64 = MIN_CHUNK_SIZE;

    enum Mode {
        Ok,
        Transient(AtomicU32),
        Fatal,
    }

    /// Records which chunks were sent and injects failures on demand.
    struct TestUploader {
        inner: ChunkIngest,
        mode: Mode,
        sent: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl ChunkUploader for TestUploader {
        async fn upload_chunk(
            &self,
            upload_id: UploadId,
            chunk_number: u32,
            data: &[u8],
        ) -> UploadResult<ChunkResult> {
            self.sent.lock().unwrap().push(chunk_number);
            match &self.mode {
                Mode::Ok => {}
                Mode::Transient(left) => {
                    if left
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
                    {
                        return Err(UploadError::ChunkUploadFailed {
                            chunk: chunk_number,
                            kind: FailureKind::NetworkTimeout,
                            source: StoreError::Timeout("flaky link".into()),
                        });
                    }
                }
                Mode::Fatal => {
                    return Err(UploadError::InvalidChunk("rejected by server".into()));
                }
            }
            self.inner.put_chunk(upload_id, chunk_number, data).await
        }
    }

    struct Fixture {
        store: Arc<MemoryUploadStore>,
        sessions: SessionManager,
        ingest: ChunkIngest,
        uploader: Arc<TestUploader>,
        driver: UploadDriver,
        file: NamedTempFile,
    }

    impl Fixture {
        fn new(mode: Mode, file_size: usize, max_retries: u32) -> Self {
            let store = Arc::new(MemoryUploadStore::new());
            let sessions = SessionManager::new(store.clone(), SessionConfig::default());
            let ingest = ChunkIngest::new(sessions.clone());
            let uploader = Arc::new(TestUploader {
                inner: ingest.clone(),
                mode,
                sent: Mutex::new(Vec::new()),
            });
            let recovery = Arc::new(RecoveryEngine::new(
                sessions.clone(),
                uploader.clone(),
                RecoveryConfig {
                    retry: RetryPolicy {
                        max_retries,
                        base_delay: Duration::from_millis(1),
                        ..RetryPolicy::default()
                    },
                    ..RecoveryConfig::default()
                },
            ));
            let finalizer = Arc::new(Finalizer::new(store.clone(), FinalizeConfig::default()));
            let progress = Arc::new(ProgressTracker::new(store.clone(), 10));
            let driver = UploadDriver::new(
                sessions.clone(),
                recovery,
                finalizer,
                progress,
                DriverConfig {
                    parallelism: 2,
                    chunk_size: Some(CHUNK),
                },
            );

            let mut file = NamedTempFile::new().unwrap();
            let data: Vec<u8> = (0..file_size).map(|i| (i % 251) as u8).collect();
            file.write_all(&data).unwrap();
            file.flush().unwrap();

            Self {
                store,
                sessions,
                ingest,
                uploader,
                driver,
                file,
            }
        }

        fn sent(&self) -> Vec<u32> {
            let mut sent = self.uploader.sent.lock().unwrap().clone();
            sent.sort_unstable();
            sent
        }
    }

    fn drain(rx: &mut mpsc::Receiver<DriverEvent>) -> Vec<DriverEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn uploads_and_finalizes_whole_file() {
        let mut fx = Fixture::new(Mode::Ok, (3 * CHUNK + CHUNK / 2) as usize, 3);
        let mut events = fx.driver.take_events().unwrap();
        assert!(fx.driver.take_events().is_none());

        let result = fx
            .driver
            .upload_file(fx.file.path(), OwnerContext::default())
            .await
            .unwrap();
        assert_eq!(result.chunks_sent, 4);
        assert_eq!(result.chunks_skipped, 0);
        assert_eq!(result.bytes_sent, 3 * CHUNK + CHUNK / 2);
        assert_eq!(result.artifact.file_size, result.bytes_sent);
        assert_eq!(
            result.artifact.checksum.as_deref(),
            Some(calculate_file_checksum(fx.file.path()).unwrap().as_str())
        );
        assert!(fx.store.get_session(result.upload_id).await.unwrap().is_none());
        assert_eq!(fx.sent(), vec![1, 2, 3, 4]);

        let events = drain(&mut events);
        let progress = events
            .iter()
            .filter(|e| matches!(e, DriverEvent::Progress(_)))
            .count();
        assert_eq!(progress, 4);
        assert!(matches!(events.last(), Some(DriverEvent::Completed(_))));
    }

    #[tokio::test]
    async fn resume_sends_only_missing_chunks() {
        let fx = Fixture::new(Mode::Ok, (4 * CHUNK) as usize, 3);
        let session = fx
            .sessions
            .initialize(FileMetadata {
                file_name: "clip.mov".into(),
                file_size: 4 * CHUNK,
                chunk_size: Some(CHUNK),
                owner: OwnerContext::default(),
            })
            .await
            .unwrap();
        for n in [1, 3] {
            let chunk = read_chunk(fx.file.path(), CHUNK, n).await.unwrap();
            fx.ingest.put_chunk(session.id, n, &chunk.data).await.unwrap();
        }

        let result = fx
            .driver
            .resume_file(session.id, fx.file.path())
            .await
            .unwrap();
        assert_eq!(fx.sent(), vec![2, 4]);
        assert_eq!(result.chunks_sent, 2);
        assert_eq!(result.chunks_skipped, 2);
        assert_eq!(
            result.artifact.checksum.as_deref(),
            Some(calculate_file_checksum(fx.file.path()).unwrap().as_str())
        );
    }

    #[tokio::test]
    async fn resume_rejects_a_different_file() {
        let fx = Fixture::new(Mode::Ok, (2 * CHUNK) as usize, 3);
        let session = fx
            .sessions
            .initialize(FileMetadata {
                file_name: "clip.mov".into(),
                file_size: 3 * CHUNK,
                chunk_size: Some(CHUNK),
                owner: OwnerContext::default(),
            })
            .await
            .unwrap();

        let err = fx
            .driver
            .resume_file(session.id, fx.file.path())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::FileMismatch { .. }));
        assert!(fx.sent().is_empty());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let fx = Fixture::new(Mode::Transient(AtomicU32::new(2)), (2 * CHUNK) as usize, 3);
        let result = fx
            .driver
            .upload_file(fx.file.path(), OwnerContext::default())
            .await
            .unwrap();
        assert_eq!(result.chunks_sent, 2);
        assert_eq!(fx.uploader.sent.lock().unwrap().len(), 4);
        let failures = fx
            .store
            .list_retries(result.upload_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| !e.success)
            .count();
        assert_eq!(failures, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_leave_upload_resumable() {
        let mut fx = Fixture::new(Mode::Transient(AtomicU32::new(100)), CHUNK as usize, 2);
        let mut events = fx.driver.take_events().unwrap();

        let err = fx
            .driver
            .upload_file(fx.file.path(), OwnerContext::default())
            .await
            .unwrap_err();
        assert!(err.is_resumable());

        let events = drain(&mut events);
        let Some(DriverEvent::Failed {
            upload_id: Some(id),
            ..
        }) = events.last()
        else {
            panic!("expected a failure event, got {events:?}");
        };
        assert!(events.iter().any(|e| matches!(e, DriverEvent::ChunkFailed { chunk: 1, .. })));
        let session = fx.store.get_session(*id).await.unwrap().unwrap();
        assert!(session.status.is_active());
    }

    #[tokio::test]
    async fn fatal_chunk_error_fails_the_upload() {
        let mut fx = Fixture::new(Mode::Fatal, (2 * CHUNK) as usize, 3);
        let mut events = fx.driver.take_events().unwrap();

        let err = fx
            .driver
            .upload_file(fx.file.path(), OwnerContext::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DriverError::Recovery(RecoveryError::Upload(UploadError::InvalidChunk(_)))
        ));

        let events = drain(&mut events);
        let id = events
            .iter()
            .find_map(|e| match e {
                DriverEvent::ChunkFailed { upload_id, .. } => Some(*upload_id),
                _ => None,
            })
            .unwrap();
        let session = fx.store.get_session(id).await.unwrap().unwrap();
        assert_eq!(session.status, UploadStatus::Failed);
    }

    #[tokio::test]
    async fn cancelled_driver_sends_nothing() {
        let mut fx = Fixture::new(Mode::Ok, (2 * CHUNK) as usize, 3);
        let mut events = fx.driver.take_events().unwrap();
        fx.driver.cancel_token().cancel();

        let err = fx
            .driver
            .upload_file(fx.file.path(), OwnerContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Cancelled));
        assert!(fx.sent().is_empty());

        let events = drain(&mut events);
        let Some(DriverEvent::Failed {
            upload_id: Some(id),
            ..
        }) = events.last()
        else {
            panic!("expected a failure event");
        };
        let session = fx.store.get_session(*id).await.unwrap().unwrap();
        assert_eq!(session.status, UploadStatus::Initialized);
    }
}
