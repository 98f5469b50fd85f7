//! Upload session lifecycle.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use chunkline_protocol::messages::UploadStatusReport;
use chunkline_protocol::{
    DEFAULT_CHUNK_SIZE, DEFAULT_SESSION_TTL_HOURS, FileMetadata, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
    UploadId, UploadSession, UploadStatus,
};
use chunkline_store::{ChunkRepo, SessionFilter, SessionRepo, UploadStore};

use crate::error::{UploadError, UploadResult};
use crate::validation::validate_file_name;

/// Settings applied to newly created sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Chunk size used when the client does not ask for one.
    pub default_chunk_size: u64,
    pub session_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            session_ttl: Duration::hours(DEFAULT_SESSION_TTL_HOURS),
        }
    }
}

/// Creates, validates and transitions upload sessions.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn UploadStore>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(store: Arc<dyn UploadStore>, config: SessionConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn UploadStore> {
        &self.store
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Validates `meta` and persists a fresh `initialized` session.
    pub async fn initialize(&self, meta: FileMetadata) -> UploadResult<UploadSession> {
        if meta.file_size == 0 {
            return Err(UploadError::InvalidMetadata(
                "file size must be greater than zero".into(),
            ));
        }
        validate_file_name(&meta.file_name)?;
        for segment in [&meta.owner.user_id, &meta.owner.album_id]
            .into_iter()
            .flatten()
        {
            validate_file_name(segment)?;
        }

        let chunk_size = meta.chunk_size.unwrap_or(self.config.default_chunk_size);
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
            return Err(UploadError::InvalidMetadata(format!(
                "chunk size {chunk_size} outside {MIN_CHUNK_SIZE}..={MAX_CHUNK_SIZE}"
            )));
        }
        if meta.file_size.div_ceil(chunk_size) > u64::from(u32::MAX) {
            return Err(UploadError::InvalidMetadata(
                "file needs too many chunks".into(),
            ));
        }

        let session = UploadSession::new(
            meta.file_name,
            meta.file_size,
            chunk_size,
            meta.owner,
            self.config.session_ttl,
            Utc::now(),
        );
        self.store.create_session(&session).await?;
        info!(
            upload = %session.id,
            file = %session.file_name,
            size = session.file_size,
            chunks = session.total_chunks,
            "upload session initialized"
        );
        Ok(session)
    }

    /// Loads a session that may still receive chunks.
    pub async fn validate(&self, upload_id: UploadId) -> UploadResult<UploadSession> {
        let session = self
            .store
            .get_session(upload_id)
            .await?
            .ok_or(UploadError::SessionNotFound(upload_id))?;

        match session.status {
            UploadStatus::Cancelled => return Err(UploadError::SessionCancelled(upload_id)),
            UploadStatus::Expired => return Err(UploadError::SessionExpired(upload_id)),
            _ => {}
        }
        if session.is_expired_at(Utc::now()) {
            return Err(UploadError::SessionExpired(upload_id));
        }
        if session.status.is_terminal() {
            return Err(UploadError::InvalidState {
                id: upload_id,
                status: session.status,
            });
        }
        Ok(session)
    }

    /// Cancels the session and drops its chunks. Unknown ids are ignored.
    pub async fn cancel(&self, upload_id: UploadId) -> UploadResult<()> {
        let Some(session) = self
            .store
            .transition_status(upload_id, UploadStatus::Cancelled, Utc::now())
            .await?
        else {
            debug!(upload = %upload_id, "cancel of unknown upload ignored");
            return Ok(());
        };
        if session.status != UploadStatus::Cancelled {
            debug!(upload = %upload_id, status = %session.status, "cancel of finished upload ignored");
            return Ok(());
        }

        let purge = self.store.delete_chunks(upload_id).await?;
        info!(upload = %upload_id, chunks = purge.chunks, "upload cancelled");
        Ok(())
    }

    /// Records chunk activity, moving `initialized` sessions to `uploading`.
    pub async fn mark_uploading(&self, upload_id: UploadId) -> UploadResult<()> {
        let now = Utc::now();
        match self
            .store
            .transition_status(upload_id, UploadStatus::Uploading, now)
            .await?
        {
            Some(s) if s.status == UploadStatus::Uploading => {
                self.store.touch_session(upload_id, now).await?;
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(UploadError::SessionNotFound(upload_id)),
        }
    }

    /// Moves an active session to `failed`.
    pub async fn mark_failed(
        &self,
        upload_id: UploadId,
        reason: &str,
    ) -> UploadResult<UploadSession> {
        let session = self
            .store
            .transition_status(upload_id, UploadStatus::Failed, Utc::now())
            .await?
            .ok_or(UploadError::SessionNotFound(upload_id))?;
        warn!(upload = %upload_id, status = %session.status, reason, "upload marked failed");
        Ok(session)
    }

    /// Session descriptor with chunk counts.
    pub async fn status(&self, upload_id: UploadId) -> UploadResult<UploadStatusReport> {
        let session = self
            .store
            .get_session(upload_id)
            .await?
            .ok_or(UploadError::SessionNotFound(upload_id))?;
        let completed = self.store.count_chunks(upload_id).await?;
        let completed_chunks = u32::try_from(completed).unwrap_or(u32::MAX);
        Ok(UploadStatusReport {
            progress: percent_floor(completed_chunks, session.total_chunks),
            completed_chunks,
            session,
        })
    }

    /// Expires every active session whose TTL ended before `now` and purges
    /// its chunks. Returns how many sessions were expired.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> UploadResult<u64> {
        let filter = SessionFilter {
            expires_before: Some(now),
            ..SessionFilter::with_statuses(&[UploadStatus::Initialized, UploadStatus::Uploading])
        };
        let stale = self.store.list_sessions(&filter).await?;

        let mut expired = 0;
        for session in stale {
            let after = self
                .store
                .transition_status(session.id, UploadStatus::Expired, now)
                .await?;
            if after.is_some_and(|s| s.status == UploadStatus::Expired) {
                self.store.delete_chunks(session.id).await?;
                expired += 1;
            }
        }
        if expired > 0 {
            info!(count = expired, "expired stale upload sessions");
        }
        Ok(expired)
    }
}

/// `floor(done / total * 100)`, clamped to 100.
pub fn percent_floor(done: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    (u64::from(done) * 100 / u64::from(total)).min(100) as u8
}
