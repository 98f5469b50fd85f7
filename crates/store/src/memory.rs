//! In-memory reference backend.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use chunkline_protocol::{
    ChunkRecord, FinalArtifact, FinalizeLease, RetryLogEntry, UploadId, UploadSession,
    UploadStatus,
};

use crate::error::{StoreError, StoreResult};
use crate::repos::{
    ArtifactRepo, AttemptStats, ChunkPurge, ChunkRepo, RetryLogRepo, SessionFilter, SessionRepo,
    StatsRepo,
};

struct StoredChunk {
    record: ChunkRecord,
    payload: Option<Vec<u8>>,
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<UploadId, UploadSession>,
    chunks: HashMap<UploadId, BTreeMap<u32, StoredChunk>>,
    retry_log: Vec<RetryLogEntry>,
    artifacts: HashMap<UploadId, FinalArtifact>,
}

/// [`UploadStore`](crate::UploadStore) kept entirely in process memory.
///
/// All tables sit behind one lock, so every method is atomic with respect to
/// the others. Chunk payloads are retained unless the store was built with
/// [`without_payloads`](Self::without_payloads).
pub struct MemoryUploadStore {
    tables: RwLock<Tables>,
    keep_payloads: bool,
}

impl Default for MemoryUploadStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryUploadStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            keep_payloads: true,
        }
    }

    /// A store that only keeps chunk records, like a metadata-only backend.
    pub fn without_payloads() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            keep_payloads: false,
        }
    }

    /// Overwrite a session row as-is, bypassing transition rules.
    ///
    /// Meant for seeding fixtures and for import tooling.
    pub async fn put_session(&self, session: UploadSession) {
        self.tables
            .write()
            .await
            .sessions
            .insert(session.id, session);
    }

    /// Replace the stored payload of a chunk without touching its record.
    pub async fn overwrite_payload(
        &self,
        upload_id: UploadId,
        chunk_number: u32,
        payload: Vec<u8>,
    ) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        let chunk = t
            .chunks
            .get_mut(&upload_id)
            .and_then(|c| c.get_mut(&chunk_number))
            .ok_or_else(|| StoreError::NotFound(format!("chunk {chunk_number} of {upload_id}")))?;
        chunk.payload = Some(payload);
        Ok(())
    }

    /// Total number of sessions held.
    pub async fn session_count(&self) -> usize {
        self.tables.read().await.sessions.len()
    }
}

#[async_trait]
impl SessionRepo for MemoryUploadStore {
    async fn create_session(&self, session: &UploadSession) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        if t.sessions.contains_key(&session.id) {
            debug!(upload = %session.id, "session id already taken");
            return Err(StoreError::AlreadyExists(format!("session {}", session.id)));
        }
        t.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, upload_id: UploadId) -> StoreResult<Option<UploadSession>> {
        Ok(self.tables.read().await.sessions.get(&upload_id).cloned())
    }

    async fn transition_status(
        &self,
        upload_id: UploadId,
        next: UploadStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<UploadSession>> {
        let mut t = self.tables.write().await;
        let Some(session) = t.sessions.get_mut(&upload_id) else {
            return Ok(None);
        };
        if session.status.can_transition_to(next) {
            session.status = next;
            session.updated_at = now;
        }
        Ok(Some(session.clone()))
    }

    async fn touch_session(&self, upload_id: UploadId, now: DateTime<Utc>) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        if let Some(session) = t.sessions.get_mut(&upload_id) {
            session.updated_at = session.updated_at.max(now);
        }
        Ok(())
    }

    async fn claim_finalize(
        &self,
        upload_id: UploadId,
        lease: FinalizeLease,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<UploadSession>> {
        let mut t = self.tables.write().await;
        let Some(session) = t.sessions.get_mut(&upload_id) else {
            return Ok(None);
        };
        let held = session.finalize_lease.is_some_and(|l| l.is_live_at(now));
        if held {
            debug!(upload = %upload_id, "finalize lease still held");
        } else {
            session.finalize_lease = Some(lease);
        }
        Ok(Some(session.clone()))
    }

    async fn release_finalize(&self, upload_id: UploadId, token: Uuid) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        if let Some(session) = t.sessions.get_mut(&upload_id) {
            if session.finalize_lease.is_some_and(|l| l.token == token) {
                session.finalize_lease = None;
            }
        }
        Ok(())
    }

    async fn delete_session(&self, upload_id: UploadId) -> StoreResult<bool> {
        Ok(self
            .tables
            .write()
            .await
            .sessions
            .remove(&upload_id)
            .is_some())
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> StoreResult<Vec<UploadSession>> {
        let t = self.tables.read().await;
        let mut sessions: Vec<UploadSession> = t
            .sessions
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        sessions.sort_by_key(|s| (s.created_at, s.id));
        if let Some(limit) = filter.limit {
            sessions.truncate(limit);
        }
        Ok(sessions)
    }
}

#[async_trait]
impl ChunkRepo for MemoryUploadStore {
    async fn upsert_chunk(&self, record: &ChunkRecord, payload: &[u8]) -> StoreResult<()> {
        let payload = self.keep_payloads.then(|| payload.to_vec());
        let mut t = self.tables.write().await;
        t.chunks.entry(record.upload_id).or_default().insert(
            record.chunk_number,
            StoredChunk {
                record: record.clone(),
                payload,
            },
        );
        Ok(())
    }

    async fn list_chunks(&self, upload_id: UploadId) -> StoreResult<Vec<ChunkRecord>> {
        let t = self.tables.read().await;
        Ok(t.chunks
            .get(&upload_id)
            .map(|c| c.values().map(|s| s.record.clone()).collect())
            .unwrap_or_default())
    }

    async fn recent_chunks(
        &self,
        upload_id: UploadId,
        limit: usize,
    ) -> StoreResult<Vec<ChunkRecord>> {
        let mut records = self.list_chunks(upload_id).await?;
        records.sort_by(|a, b| {
            b.uploaded_at
                .cmp(&a.uploaded_at)
                .then(b.chunk_number.cmp(&a.chunk_number))
        });
        records.truncate(limit);
        Ok(records)
    }

    async fn chunk_payload(
        &self,
        upload_id: UploadId,
        chunk_number: u32,
    ) -> StoreResult<Option<Vec<u8>>> {
        let t = self.tables.read().await;
        Ok(t.chunks
            .get(&upload_id)
            .and_then(|c| c.get(&chunk_number))
            .and_then(|s| s.payload.clone()))
    }

    async fn count_chunks(&self, upload_id: UploadId) -> StoreResult<u64> {
        let t = self.tables.read().await;
        Ok(t.chunks.get(&upload_id).map_or(0, |c| c.len() as u64))
    }

    async fn delete_chunks(&self, upload_id: UploadId) -> StoreResult<ChunkPurge> {
        let mut t = self.tables.write().await;
        let purge = t
            .chunks
            .remove(&upload_id)
            .map(|c| ChunkPurge {
                chunks: c.len() as u64,
                bytes: c.values().map(|s| s.record.size).sum(),
            })
            .unwrap_or_default();
        Ok(purge)
    }
}

#[async_trait]
impl RetryLogRepo for MemoryUploadStore {
    async fn append_retry(&self, entry: &RetryLogEntry) -> StoreResult<()> {
        self.tables.write().await.retry_log.push(entry.clone());
        Ok(())
    }

    async fn list_retries(&self, upload_id: UploadId) -> StoreResult<Vec<RetryLogEntry>> {
        let t = self.tables.read().await;
        Ok(t.retry_log
            .iter()
            .filter(|e| e.upload_id == upload_id)
            .cloned()
            .collect())
    }

    async fn delete_retries_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut t = self.tables.write().await;
        let before = t.retry_log.len();
        t.retry_log.retain(|e| e.occurred_at >= cutoff);
        Ok((before - t.retry_log.len()) as u64)
    }
}

#[async_trait]
impl ArtifactRepo for MemoryUploadStore {
    async fn insert_artifact(&self, artifact: &FinalArtifact) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        if t.artifacts.contains_key(&artifact.source_upload_id) {
            debug!(upload = %artifact.source_upload_id, "artifact already recorded");
            return Err(StoreError::AlreadyExists(format!(
                "artifact for upload {}",
                artifact.source_upload_id
            )));
        }
        t.artifacts
            .insert(artifact.source_upload_id, artifact.clone());
        Ok(())
    }

    async fn get_artifact_for_upload(
        &self,
        upload_id: UploadId,
    ) -> StoreResult<Option<FinalArtifact>> {
        Ok(self.tables.read().await.artifacts.get(&upload_id).cloned())
    }
}

#[async_trait]
impl StatsRepo for MemoryUploadStore {
    async fn active_session_count(&self) -> StoreResult<u64> {
        let t = self.tables.read().await;
        Ok(t.sessions.values().filter(|s| s.status.is_active()).count() as u64)
    }

    async fn attempt_stats_since(&self, since: DateTime<Utc>) -> StoreResult<AttemptStats> {
        let t = self.tables.read().await;
        Ok(tally(t.retry_log.iter().filter(|e| e.occurred_at >= since)))
    }

    async fn attempt_stats_for_hour(
        &self,
        hour: u32,
        since: DateTime<Utc>,
    ) -> StoreResult<AttemptStats> {
        let t = self.tables.read().await;
        Ok(tally(
            t.retry_log
                .iter()
                .filter(|e| e.occurred_at >= since && e.occurred_at.hour() == hour),
        ))
    }
}

fn tally<'a>(entries: impl Iterator<Item = &'a RetryLogEntry>) -> AttemptStats {
    entries.fold(AttemptStats::default(), |mut acc, e| {
        acc.attempts += 1;
        if e.success {
            acc.successes += 1;
        }
        acc
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use chunkline_protocol::{ChunkStatus, OwnerContext};

    fn session() -> UploadSession {
        UploadSession::new(
            "a.bin".into(),
            10,
            4,
            OwnerContext::default(),
            Duration::hours(1),
            Utc::now(),
        )
    }

    fn record(upload_id: UploadId, chunk_number: u32, checksum: &str) -> ChunkRecord {
        ChunkRecord {
            upload_id,
            chunk_number,
            checksum: checksum.into(),
            size: 4,
            uploaded_at: Utc::now(),
            status: ChunkStatus::Completed,
        }
    }

    fn attempt(upload_id: UploadId, success: bool, at: DateTime<Utc>) -> RetryLogEntry {
        RetryLogEntry {
            upload_id,
            chunk_number: 1,
            attempt_number: 1,
            success,
            error_type: None,
            error_message: None,
            occurred_at: at,
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicate_id() {
        let store = MemoryUploadStore::new();
        let s = session();
        store.create_session(&s).await.unwrap();
        let err = store.create_session(&s).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn transition_respects_forward_only() {
        let store = MemoryUploadStore::new();
        let s = session();
        store.create_session(&s).await.unwrap();

        let now = Utc::now();
        let after = store
            .transition_status(s.id, UploadStatus::Cancelled, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, UploadStatus::Cancelled);

        let after = store
            .transition_status(s.id, UploadStatus::Uploading, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, UploadStatus::Cancelled);

        let missing = store
            .transition_status(UploadId::new(), UploadStatus::Uploading, now)
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn upsert_replaces_on_conflict() {
        let store = MemoryUploadStore::new();
        let id = UploadId::new();
        store.upsert_chunk(&record(id, 1, "aa"), b"abcd").await.unwrap();
        store.upsert_chunk(&record(id, 1, "bb"), b"efgh").await.unwrap();

        let chunks = store.list_chunks(id).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].checksum, "bb");
        assert_eq!(
            store.chunk_payload(id, 1).await.unwrap().as_deref(),
            Some(&b"efgh"[..])
        );
    }

    #[tokio::test]
    async fn payloads_can_be_dropped() {
        let store = MemoryUploadStore::without_payloads();
        let id = UploadId::new();
        store.upsert_chunk(&record(id, 1, "aa"), b"abcd").await.unwrap();
        assert_eq!(store.count_chunks(id).await.unwrap(), 1);
        assert!(store.chunk_payload(id, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_chunks_reports_purge() {
        let store = MemoryUploadStore::new();
        let id = UploadId::new();
        for n in 1..=3 {
            store.upsert_chunk(&record(id, n, "aa"), b"abcd").await.unwrap();
        }
        let purge = store.delete_chunks(id).await.unwrap();
        assert_eq!(purge, ChunkPurge { chunks: 3, bytes: 12 });
        assert_eq!(store.count_chunks(id).await.unwrap(), 0);
        assert_eq!(store.delete_chunks(id).await.unwrap(), ChunkPurge::default());
    }

    #[tokio::test]
    async fn finalize_lease_is_exclusive_until_expiry() {
        let store = MemoryUploadStore::new();
        let s = session();
        store.create_session(&s).await.unwrap();
        let now = Utc::now();

        let first = FinalizeLease {
            token: Uuid::new_v4(),
            expires_at: now + Duration::minutes(5),
        };
        let won = store.claim_finalize(s.id, first, now).await.unwrap().unwrap();
        assert_eq!(won.finalize_lease.map(|l| l.token), Some(first.token));

        let second = FinalizeLease {
            token: Uuid::new_v4(),
            expires_at: now + Duration::minutes(5),
        };
        let lost = store.claim_finalize(s.id, second, now).await.unwrap().unwrap();
        assert_eq!(lost.finalize_lease.map(|l| l.token), Some(first.token));

        // An expired lease can be taken over.
        let later = now + Duration::minutes(6);
        let third = FinalizeLease {
            token: Uuid::new_v4(),
            expires_at: later + Duration::minutes(5),
        };
        let taken = store.claim_finalize(s.id, third, later).await.unwrap().unwrap();
        assert_eq!(taken.finalize_lease.map(|l| l.token), Some(third.token));

        // Releasing with a stale token is a no-op.
        store.release_finalize(s.id, first.token).await.unwrap();
        let still = store.get_session(s.id).await.unwrap().unwrap();
        assert!(still.finalize_lease.is_some());
        store.release_finalize(s.id, third.token).await.unwrap();
        let freed = store.get_session(s.id).await.unwrap().unwrap();
        assert!(freed.finalize_lease.is_none());
    }

    #[tokio::test]
    async fn retry_log_cleanup_by_cutoff() {
        let store = MemoryUploadStore::new();
        let id = UploadId::new();
        let now = Utc::now();
        store
            .append_retry(&attempt(id, false, now - Duration::days(10)))
            .await
            .unwrap();
        store.append_retry(&attempt(id, true, now)).await.unwrap();

        let removed = store
            .delete_retries_before(now - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.list_retries(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn artifact_is_recorded_once() {
        let store = MemoryUploadStore::new();
        let artifact = FinalArtifact {
            id: Uuid::new_v4(),
            source_upload_id: UploadId::new(),
            file_name: "a.bin".into(),
            storage_path: "uploads/anonymous/unsorted/a.bin".into(),
            file_size: 10,
            checksum: None,
            created_at: Utc::now(),
        };
        store.insert_artifact(&artifact).await.unwrap();
        let err = store.insert_artifact(&artifact).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert_eq!(
            store
                .get_artifact_for_upload(artifact.source_upload_id)
                .await
                .unwrap(),
            Some(artifact)
        );
    }

    #[tokio::test]
    async fn stats_aggregate_attempts() {
        let store = MemoryUploadStore::new();
        let id = UploadId::new();
        let now = Utc::now();
        store.append_retry(&attempt(id, true, now)).await.unwrap();
        store.append_retry(&attempt(id, false, now)).await.unwrap();
        store
            .append_retry(&attempt(id, false, now - Duration::days(2)))
            .await
            .unwrap();

        let recent = store
            .attempt_stats_since(now - Duration::days(1))
            .await
            .unwrap();
        assert_eq!(recent, AttemptStats { attempts: 2, successes: 1 });

        let this_hour = store
            .attempt_stats_for_hour(now.hour(), now - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(this_hour.attempts, 3);

        store.create_session(&session()).await.unwrap();
        assert_eq!(store.active_session_count().await.unwrap(), 1);
    }
}
