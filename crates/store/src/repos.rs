//! Repository traits making up the persistence contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use chunkline_protocol::{
    ChunkRecord, FinalArtifact, FinalizeLease, RetryLogEntry, UploadId, UploadSession,
    UploadStatus,
};

use crate::error::StoreResult;

/// Filter for session scans. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub statuses: Vec<UploadStatus>,
    /// Only sessions whose last activity is strictly before this instant.
    pub updated_before: Option<DateTime<Utc>>,
    /// Only sessions whose TTL ends strictly before this instant.
    pub expires_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl SessionFilter {
    pub fn with_statuses(statuses: &[UploadStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Self::default()
        }
    }

    pub fn matches(&self, session: &UploadSession) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&session.status))
            && self.updated_before.is_none_or(|t| session.updated_at < t)
            && self.expires_before.is_none_or(|t| session.expires_at < t)
    }
}

/// Rows and bytes removed by a chunk purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkPurge {
    pub chunks: u64,
    pub bytes: u64,
}

/// Attempt counters aggregated from the retry log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttemptStats {
    pub attempts: u64,
    pub successes: u64,
}

impl AttemptStats {
    /// Success ratio in `[0, 1]`, or `None` without samples.
    pub fn success_rate(&self) -> Option<f64> {
        if self.attempts == 0 {
            None
        } else {
            Some(self.successes as f64 / self.attempts as f64)
        }
    }
}

/// Session Store.
#[async_trait]
pub trait SessionRepo: Send + Sync {
    /// Insert a new session. Fails with `AlreadyExists` on id collision.
    async fn create_session(&self, session: &UploadSession) -> StoreResult<()>;

    async fn get_session(&self, upload_id: UploadId) -> StoreResult<Option<UploadSession>>;

    /// Atomically move the session to `next` if the current status allows it,
    /// bumping `updated_at`.
    ///
    /// Returns `None` if the session doesn't exist. Otherwise returns the
    /// session as stored after the call; callers check its `status` to learn
    /// whether the transition was applied.
    async fn transition_status(
        &self,
        upload_id: UploadId,
        next: UploadStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<UploadSession>>;

    /// Record activity on the session without changing its status.
    async fn touch_session(&self, upload_id: UploadId, now: DateTime<Utc>) -> StoreResult<()>;

    /// Conditionally install `lease` on the session row.
    ///
    /// Succeeds only if no other unexpired lease is held. Returns `None` if the
    /// session doesn't exist; otherwise the stored session, whose
    /// `finalize_lease` carries `lease.token` only if the claim won.
    async fn claim_finalize(
        &self,
        upload_id: UploadId,
        lease: FinalizeLease,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<UploadSession>>;

    /// Drop the lease if it is still held by `token`.
    async fn release_finalize(&self, upload_id: UploadId, token: Uuid) -> StoreResult<()>;

    /// Delete the session row. Returns `true` if it existed.
    async fn delete_session(&self, upload_id: UploadId) -> StoreResult<bool>;

    async fn list_sessions(&self, filter: &SessionFilter) -> StoreResult<Vec<UploadSession>>;
}

/// Chunk Ledger.
#[async_trait]
pub trait ChunkRepo: Send + Sync {
    /// Insert or replace the record keyed by `(upload_id, chunk_number)`.
    ///
    /// Backends may retain `payload` for later verification and assembly.
    async fn upsert_chunk(&self, record: &ChunkRecord, payload: &[u8]) -> StoreResult<()>;

    /// All records of an upload, ordered by chunk number.
    async fn list_chunks(&self, upload_id: UploadId) -> StoreResult<Vec<ChunkRecord>>;

    /// The most recent `limit` records by upload time, newest first.
    async fn recent_chunks(&self, upload_id: UploadId, limit: usize)
    -> StoreResult<Vec<ChunkRecord>>;

    /// Stored bytes of one chunk, if this backend retains payloads.
    async fn chunk_payload(
        &self,
        upload_id: UploadId,
        chunk_number: u32,
    ) -> StoreResult<Option<Vec<u8>>>;

    async fn count_chunks(&self, upload_id: UploadId) -> StoreResult<u64>;

    async fn delete_chunks(&self, upload_id: UploadId) -> StoreResult<ChunkPurge>;
}

/// Retry Log.
#[async_trait]
pub trait RetryLogRepo: Send + Sync {
    async fn append_retry(&self, entry: &RetryLogEntry) -> StoreResult<()>;

    /// Entries for one upload in insertion order.
    async fn list_retries(&self, upload_id: UploadId) -> StoreResult<Vec<RetryLogEntry>>;

    /// Delete entries that occurred strictly before `cutoff`.
    async fn delete_retries_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}

/// Final artifact table.
#[async_trait]
pub trait ArtifactRepo: Send + Sync {
    /// Insert an artifact. Fails with `AlreadyExists` if one was already
    /// recorded for the same source upload.
    async fn insert_artifact(&self, artifact: &FinalArtifact) -> StoreResult<()>;

    async fn get_artifact_for_upload(
        &self,
        upload_id: UploadId,
    ) -> StoreResult<Option<FinalArtifact>>;
}

/// Aggregate queries feeding recovery-time recommendations.
#[async_trait]
pub trait StatsRepo: Send + Sync {
    /// Sessions currently able to receive chunks.
    async fn active_session_count(&self) -> StoreResult<u64>;

    /// Attempts recorded at or after `since`.
    async fn attempt_stats_since(&self, since: DateTime<Utc>) -> StoreResult<AttemptStats>;

    /// Attempts recorded at or after `since` whose UTC hour-of-day is `hour`.
    async fn attempt_stats_for_hour(
        &self,
        hour: u32,
        since: DateTime<Utc>,
    ) -> StoreResult<AttemptStats>;
}

/// Everything a component may need from the persistence backend.
pub trait UploadStore: SessionRepo + ChunkRepo + RetryLogRepo + ArtifactRepo + StatsRepo {}

impl<T> UploadStore for T where T: SessionRepo + ChunkRepo + RetryLogRepo + ArtifactRepo + StatsRepo
{}
