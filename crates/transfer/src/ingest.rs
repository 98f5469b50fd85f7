//! Chunk ingest: validation, checksumming and ledger writes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use chunkline_protocol::messages::ChunkResult;
use chunkline_protocol::{ChunkRecord, ChunkStatus, UploadId};
use chunkline_store::{ChunkRepo, UploadStore};

use crate::chunked::{checksum_bytes, verify_checksum};
use crate::error::{UploadError, UploadResult};
use crate::session::SessionManager;

/// Something that can accept one chunk of an upload.
///
/// Implemented by [`ChunkIngest`]; the retry loop and the driver only see this
/// trait so they can run against flaky uploaders in tests.
#[async_trait]
pub trait ChunkUploader: Send + Sync {
    async fn upload_chunk(
        &self,
        upload_id: UploadId,
        chunk_number: u32,
        data: &[u8],
    ) -> UploadResult<ChunkResult>;
}

/// Accepts chunk bytes into the ledger.
#[derive(Clone)]
pub struct ChunkIngest {
    sessions: SessionManager,
    store: Arc<dyn UploadStore>,
}

impl ChunkIngest {
    pub fn new(sessions: SessionManager) -> Self {
        let store = Arc::clone(sessions.store());
        Self { sessions, store }
    }

    /// Stores chunk `chunk_number` of `upload_id`, replacing any earlier copy.
    pub async fn put_chunk(
        &self,
        upload_id: UploadId,
        chunk_number: u32,
        data: &[u8],
    ) -> UploadResult<ChunkResult> {
        let session = self.sessions.validate(upload_id).await?;

        if chunk_number == 0 || chunk_number > session.total_chunks {
            return Err(UploadError::InvalidChunk(format!(
                "chunk {chunk_number} outside 1..={}",
                session.total_chunks
            )));
        }
        if data.is_empty() {
            return Err(UploadError::InvalidChunk(format!(
                "chunk {chunk_number} is empty"
            )));
        }
        let expected = session.expected_chunk_size(chunk_number);
        if data.len() as u64 != expected {
            return Err(UploadError::InvalidChunk(format!(
                "chunk {chunk_number} is {} bytes, expected {expected}",
                data.len()
            )));
        }

        let record = ChunkRecord {
            upload_id,
            chunk_number,
            checksum: checksum_bytes(data),
            size: data.len() as u64,
            uploaded_at: Utc::now(),
            status: ChunkStatus::Completed,
        };
        if let Err(e) = self.store.upsert_chunk(&record, data).await {
            warn!(upload = %upload_id, chunk = chunk_number, error = %e, "chunk write failed");
            return Err(UploadError::ChunkUploadFailed {
                chunk: chunk_number,
                kind: e.failure_kind(),
                source: e,
            });
        }

        self.sessions.mark_uploading(upload_id).await?;
        debug!(upload = %upload_id, chunk = chunk_number, size = record.size, "chunk stored");

        Ok(ChunkResult {
            chunk_number,
            checksum: record.checksum,
            size: record.size,
            uploaded_at: record.uploaded_at,
            is_complete: true,
        })
    }

    /// Like [`put_chunk`](Self::put_chunk), but first checks the bytes against
    /// the digest declared by the client.
    pub async fn put_chunk_verified(
        &self,
        upload_id: UploadId,
        chunk_number: u32,
        data: &[u8],
        expected_checksum: &str,
    ) -> UploadResult<ChunkResult> {
        if !verify_checksum(data, expected_checksum) {
            warn!(upload = %upload_id, chunk = chunk_number, "declared checksum mismatch");
            return Err(UploadError::ChecksumMismatch {
                chunk: chunk_number,
            });
        }
        self.put_chunk(upload_id, chunk_number, data).await
    }
}

#[async_trait]
impl ChunkUploader for ChunkIngest {
    async fn upload_chunk(
        &self,
        upload_id: UploadId,
        chunk_number: u32,
        data: &[u8],
    ) -> UploadResult<ChunkResult> {
        self.put_chunk(upload_id, chunk_number, data).await
    }
}
