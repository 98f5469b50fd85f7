//! Caller-facing upload service.
//!
//! Wires every component to one store and exposes their operations as
//! [`ApiResult`] values, so callers never see a Rust error type.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use tracing::debug;

use chunkline_driver::UploadDriver;
use chunkline_protocol::messages::{
    BatchRecoveryResult, ChunkResult, CleanupReport, CompletionEstimate, FailurePattern,
    OrphanCleanup, PerformanceMetrics, PriorityRecovery, PriorityRequest, ProgressUpdate,
    RecoveryTime, RepairResult, ResumeInfo, RetryOutcome, UploadProgress, UploadSpeed,
    UploadStatusReport,
};
use chunkline_protocol::{
    ApiResult, ErrorCode, FileMetadata, FinalArtifact, UploadId, UploadSession,
};
use chunkline_recovery::{MaintenanceScheduler, RecoveryEngine};
use chunkline_store::{MemoryUploadStore, UploadStore};
use chunkline_transfer::{ChunkIngest, Finalizer, ProgressTracker, SessionManager};

use crate::config::ServiceConfig;

/// Callback invoked with a progress snapshot after every accepted chunk.
pub type ProgressCallback = Box<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Upload service over a shared [`UploadStore`].
pub struct UploadService {
    sessions: SessionManager,
    ingest: ChunkIngest,
    finalizer: Arc<Finalizer>,
    recovery: Arc<RecoveryEngine>,
    progress: Arc<ProgressTracker>,
    config: ServiceConfig,
    callbacks: RwLock<Vec<ProgressCallback>>,
}

impl UploadService {
    pub fn new(store: Arc<dyn UploadStore>, config: ServiceConfig) -> Self {
        let sessions = SessionManager::new(Arc::clone(&store), config.session_config());
        let ingest = ChunkIngest::new(sessions.clone());
        let finalizer = Arc::new(Finalizer::new(
            Arc::clone(&store),
            config.finalize_config(),
        ));
        let recovery = Arc::new(RecoveryEngine::new(
            sessions.clone(),
            Arc::new(ingest.clone()),
            config.recovery_config(),
        ));
        let progress = Arc::new(ProgressTracker::new(store, config.speed_window));
        Self {
            sessions,
            ingest,
            finalizer,
            recovery,
            progress,
            config,
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Service backed by a fresh [`MemoryUploadStore`].
    pub fn in_memory(config: ServiceConfig) -> Self {
        Self::new(Arc::new(MemoryUploadStore::new()), config)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Registers a callback for progress notifications.
    pub fn on_progress<F>(&self, cb: F)
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(cb));
    }

    /// Maintenance loop over this service's store. Call
    /// [`start`](MaintenanceScheduler::start) to run it.
    pub fn scheduler(&self) -> MaintenanceScheduler {
        MaintenanceScheduler::new(Arc::clone(&self.recovery))
    }

    /// Whole-file driver sharing this service's components.
    pub fn driver(&self) -> UploadDriver {
        UploadDriver::new(
            self.sessions.clone(),
            Arc::clone(&self.recovery),
            Arc::clone(&self.finalizer),
            Arc::clone(&self.progress),
            self.config.driver_config(),
        )
    }

    // -- Sessions and chunks -------------------------------------------------

    pub async fn initialize_upload(&self, meta: FileMetadata) -> ApiResult<UploadSession> {
        self.sessions.initialize(meta).await.into()
    }

    pub async fn upload_chunk(
        &self,
        upload_id: UploadId,
        chunk_number: u32,
        data: &[u8],
    ) -> ApiResult<ChunkResult> {
        let result = self.ingest.put_chunk(upload_id, chunk_number, data).await;
        if result.is_ok() {
            self.notify_progress(upload_id).await;
        }
        result.into()
    }

    /// Like [`upload_chunk`](Self::upload_chunk), rejecting bytes that don't
    /// hash to `checksum`.
    pub async fn upload_chunk_verified(
        &self,
        upload_id: UploadId,
        chunk_number: u32,
        data: &[u8],
        checksum: &str,
    ) -> ApiResult<ChunkResult> {
        let result = self
            .ingest
            .put_chunk_verified(upload_id, chunk_number, data, checksum)
            .await;
        if result.is_ok() {
            self.notify_progress(upload_id).await;
        }
        result.into()
    }

    pub async fn finalize_upload(&self, upload_id: UploadId) -> ApiResult<FinalArtifact> {
        self.finalizer.finalize(upload_id).await.into()
    }

    pub async fn get_artifact(&self, upload_id: UploadId) -> ApiResult<Option<FinalArtifact>> {
        self.finalizer.artifact(upload_id).await.into()
    }

    pub async fn get_upload_status(&self, upload_id: UploadId) -> ApiResult<UploadStatusReport> {
        self.sessions.status(upload_id).await.into()
    }

    pub async fn cancel_upload(&self, upload_id: UploadId) -> ApiResult<()> {
        self.sessions.cancel(upload_id).await.into()
    }

    pub async fn cleanup_expired_sessions(&self) -> ApiResult<u64> {
        self.sessions.expire_stale(Utc::now()).await.into()
    }

    // -- Recovery -----------------------------------------------------------

    pub async fn get_resume_info(&self, upload_id: UploadId) -> ApiResult<ResumeInfo> {
        self.recovery.get_resume_info(upload_id).await.into()
    }

    /// Retries one chunk. `max_retries` defaults to the configured budget.
    pub async fn retry_chunk_upload(
        &self,
        upload_id: UploadId,
        chunk_number: u32,
        data: &[u8],
        max_retries: Option<u32>,
    ) -> ApiResult<RetryOutcome> {
        let max_retries = max_retries.unwrap_or(self.config.max_retries);
        let result = self
            .recovery
            .retry_chunk_upload(upload_id, chunk_number, data, max_retries)
            .await;
        if result.is_ok() {
            self.notify_progress(upload_id).await;
        }
        result.into()
    }

    pub async fn validate_and_repair_upload(&self, upload_id: UploadId) -> ApiResult<RepairResult> {
        self.recovery.validate_and_repair_upload(upload_id).await.into()
    }

    pub async fn analyze_failure_pattern(&self, upload_id: UploadId) -> ApiResult<FailurePattern> {
        self.recovery.analyze_failure_pattern(upload_id).await.into()
    }

    pub async fn get_optimal_recovery_time(&self, upload_id: UploadId) -> ApiResult<RecoveryTime> {
        self.recovery.get_optimal_recovery_time(upload_id).await.into()
    }

    pub async fn batch_recover_uploads(
        &self,
        upload_ids: &[UploadId],
    ) -> ApiResult<BatchRecoveryResult> {
        self.recovery.batch_recover_uploads(upload_ids).await.into()
    }

    pub async fn prioritize_recovery(
        &self,
        requests: &[PriorityRequest],
    ) -> ApiResult<PriorityRecovery> {
        self.recovery.prioritize_recovery(requests).await.into()
    }

    /// Drops retry log entries past retention. `retention_days` defaults to
    /// the configured value.
    pub async fn cleanup_expired_retry_logs(&self, retention_days: Option<u32>) -> ApiResult<u64> {
        let days = retention_days.unwrap_or(self.config.retry_log_retention_days);
        self.recovery.cleanup_expired_retry_logs(days).await.into()
    }

    /// Removes orphaned sessions. `threshold_hours` defaults to the
    /// configured value.
    pub async fn cleanup_orphan_sessions(
        &self,
        threshold_hours: Option<i64>,
    ) -> ApiResult<OrphanCleanup> {
        let hours = threshold_hours.unwrap_or(self.config.orphan_threshold_hours);
        let Some(threshold) = chrono::Duration::try_hours(hours) else {
            return ApiResult::error(
                ErrorCode::InvalidMetadata,
                format!("orphan threshold of {hours}h is out of range"),
            );
        };
        self.recovery.cleanup_orphan_sessions(threshold).await.into()
    }

    /// Runs every cleanup sweep once.
    pub async fn run_maintenance(&self) -> ApiResult<CleanupReport> {
        self.recovery.run_once().await.into()
    }

    // -- Progress -----------------------------------------------------------

    pub async fn calculate_progress(&self, upload_id: UploadId) -> ApiResult<UploadProgress> {
        self.progress.calculate_progress(upload_id).await.into()
    }

    pub async fn calculate_upload_speed(&self, upload_id: UploadId) -> ApiResult<UploadSpeed> {
        self.progress.calculate_upload_speed(upload_id).await.into()
    }

    pub async fn estimate_completion_time(
        &self,
        upload_id: UploadId,
    ) -> ApiResult<CompletionEstimate> {
        self.progress.estimate_completion_time(upload_id).await.into()
    }

    pub async fn get_performance_metrics(
        &self,
        upload_id: UploadId,
    ) -> ApiResult<PerformanceMetrics> {
        self.progress.get_performance_metrics(upload_id).await.into()
    }

    pub async fn get_progress_update(&self, upload_id: UploadId) -> ApiResult<ProgressUpdate> {
        self.progress.progress_update(upload_id).await.into()
    }

    async fn notify_progress(&self, upload_id: UploadId) {
        if self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
        {
            return;
        }
        let update = match self.progress.progress_update(upload_id).await {
            Ok(update) => update,
            Err(e) => {
                debug!(upload = %upload_id, error = %e, "no progress update");
                return;
            }
        };
        let callbacks = self.callbacks.read().unwrap_or_else(PoisonError::into_inner);
        for cb in callbacks.iter() {
            cb(update.clone());
        }
    }
}
