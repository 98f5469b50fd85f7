use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chunkline_protocol::{UploadId, UploadSession};
use chunkline_store::{ChunkRepo, SessionRepo, UploadStore};
use chunkline_transfer::{ChunkUploader, SessionManager, UploadError};

use crate::error::RecoveryResult;
use crate::policy::RetryPolicy;

/// Tunables of the recovery engine.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub retry: RetryPolicy,
    /// Concurrent active uploads the system is sized for; drives the load signal.
    pub capacity: u64,
    /// Failed or cancelled sessions idle longer than this are orphans.
    pub orphan_threshold: chrono::Duration,
    pub retry_log_retention_days: u32,
    /// Period of the maintenance loop.
    pub cleanup_interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            capacity: 100,
            orphan_threshold: chrono::Duration::hours(24),
            retry_log_retention_days: 30,
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

/// Resume, retry, repair, analysis and cleanup over the shared store.
///
/// The engine is stateless; everything it knows comes from the store, so it
/// can be shared freely behind an `Arc`.
pub struct RecoveryEngine {
    pub(crate) store: Arc<dyn UploadStore>,
    pub(crate) sessions: SessionManager,
    pub(crate) uploader: Arc<dyn ChunkUploader>,
    pub(crate) config: RecoveryConfig,
}

impl RecoveryEngine {
    pub fn new(
        sessions: SessionManager,
        uploader: Arc<dyn ChunkUploader>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            store: Arc::clone(sessions.store()),
            sessions,
            uploader,
            config,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub(crate) async fn load_session(&self, upload_id: UploadId) -> RecoveryResult<UploadSession> {
        Ok(self
            .store
            .get_session(upload_id)
            .await?
            .ok_or(UploadError::SessionNotFound(upload_id))?)
    }

    /// Chunk numbers of `session` present in the ledger.
    pub(crate) async fn completed_chunks(
        &self,
        session: &UploadSession,
    ) -> RecoveryResult<BTreeSet<u32>> {
        Ok(self
            .store
            .list_chunks(session.id)
            .await?
            .into_iter()
            .map(|c| c.chunk_number)
            .filter(|n| (1..=session.total_chunks).contains(n))
            .collect())
    }
}

/// `{1..total} \ completed`, ascending.
pub(crate) fn missing_chunks(total: u32, completed: &BTreeSet<u32>) -> Vec<u32> {
    (1..=total).filter(|n| !completed.contains(n)).collect()
}
