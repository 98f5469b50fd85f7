//! Finalize: turn a complete set of chunks into a [`FinalArtifact`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use uuid::Uuid;

use chunkline_protocol::{
    ChunkRecord, FinalArtifact, FinalizeLease, UploadId, UploadSession, UploadStatus,
};
use chunkline_store::{ArtifactRepo, ChunkRepo, SessionRepo, UploadStore};

use crate::chunked::{Chunk, ChunkWriter};
use crate::error::{UploadError, UploadResult};

/// Default lifetime of a finalize lease.
pub const DEFAULT_LEASE_TTL_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct FinalizeConfig {
    /// How long a claimed lease blocks other finalizers.
    pub lease_ttl: Duration,
    /// When set, artifacts are assembled on disk under this directory.
    pub assembly_root: Option<PathBuf>,
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::seconds(DEFAULT_LEASE_TTL_SECS),
            assembly_root: None,
        }
    }
}

/// Deterministic storage path of an upload's artifact.
pub fn storage_path_for(session: &UploadSession) -> String {
    let user = session.owner.user_id.as_deref().unwrap_or("anonymous");
    let album = session.owner.album_id.as_deref().unwrap_or("unsorted");
    format!("uploads/{user}/{album}/{}", session.file_name)
}

pub struct Finalizer {
    store: Arc<dyn UploadStore>,
    config: FinalizeConfig,
}

impl Finalizer {
    pub fn new(store: Arc<dyn UploadStore>, config: FinalizeConfig) -> Self {
        Self { store, config }
    }

    /// Finalizes `upload_id`.
    ///
    /// Only one finalize per upload runs at a time; a concurrent caller gets
    /// [`UploadError::FinalizeInProgress`]. On any failure the ledger is left
    /// untouched and the lease is released.
    pub async fn finalize(&self, upload_id: UploadId) -> UploadResult<FinalArtifact> {
        let session = self
            .store
            .get_session(upload_id)
            .await?
            .ok_or(UploadError::SessionNotFound(upload_id))?;
        check_finalizable(&session)?;

        let now = Utc::now();
        let lease = FinalizeLease {
            token: Uuid::new_v4(),
            expires_at: now + self.config.lease_ttl,
        };
        let claimed = self
            .store
            .claim_finalize(upload_id, lease, now)
            .await?
            .ok_or(UploadError::SessionNotFound(upload_id))?;
        if claimed.finalize_lease.map(|l| l.token) != Some(lease.token) {
            return Err(UploadError::FinalizeInProgress(upload_id));
        }
        // Status may have changed between the first read and the claim.
        if let Err(e) = check_finalizable(&claimed) {
            self.release(upload_id, lease.token).await;
            return Err(e);
        }

        match self.finalize_claimed(&claimed).await {
            Ok(artifact) => Ok(artifact),
            Err(e) => {
                error!(upload = %upload_id, error = %e, "finalize failed");
                self.release(upload_id, lease.token).await;
                Err(e)
            }
        }
    }

    async fn finalize_claimed(&self, session: &UploadSession) -> UploadResult<FinalArtifact> {
        let chunks: Vec<ChunkRecord> = self
            .store
            .list_chunks(session.id)
            .await?
            .into_iter()
            .filter(|c| (1..=session.total_chunks).contains(&c.chunk_number))
            .collect();
        let present: BTreeSet<u32> = chunks.iter().map(|c| c.chunk_number).collect();
        if present.len() as u32 != session.total_chunks {
            return Err(UploadError::IncompleteUpload {
                present: present.len() as u32,
                total: session.total_chunks,
            });
        }
        let received: u64 = chunks.iter().map(|c| c.size).sum();
        let misfit = chunks
            .iter()
            .find(|c| c.size != session.expected_chunk_size(c.chunk_number));
        if let Some(chunk) = misfit {
            warn!(
                upload = %session.id,
                chunk = chunk.chunk_number,
                size = chunk.size,
                "chunk size does not match its slot"
            );
        }
        if misfit.is_some() || received != session.file_size {
            return Err(UploadError::ByteCountMismatch {
                received,
                expected: session.file_size,
            });
        }

        let storage_path = storage_path_for(session);
        let checksum = match &self.config.assembly_root {
            Some(root) => Some(self.assemble(session, &chunks, root.clone(), &storage_path).await?),
            None => self.whole_file_checksum(session.id, &chunks).await?,
        };

        let artifact = FinalArtifact {
            id: Uuid::new_v4(),
            source_upload_id: session.id,
            file_name: session.file_name.clone(),
            storage_path,
            file_size: session.file_size,
            checksum,
            created_at: Utc::now(),
        };
        self.store.insert_artifact(&artifact).await?;

        self.store
            .transition_status(session.id, UploadStatus::Completed, artifact.created_at)
            .await?;
        let purge = self.store.delete_chunks(session.id).await?;
        self.store.delete_session(session.id).await?;

        info!(
            upload = %session.id,
            path = %artifact.storage_path,
            chunks = purge.chunks,
            bytes = purge.bytes,
            "upload finalized"
        );
        Ok(artifact)
    }

    /// Writes every chunk to `<root>/<storage_path>` through a fresh
    /// per-upload `.part` file and returns the whole-file digest.
    async fn assemble(
        &self,
        session: &UploadSession,
        chunks: &[ChunkRecord],
        root: PathBuf,
        storage_path: &str,
    ) -> UploadResult<String> {
        let mut payloads = Vec::with_capacity(chunks.len());
        for record in chunks {
            let data = self
                .store
                .chunk_payload(session.id, record.chunk_number)
                .await?
                .ok_or_else(|| {
                    UploadError::AssemblyFailed(format!(
                        "payload of chunk {} unavailable",
                        record.chunk_number
                    ))
                })?;
            payloads.push(Chunk {
                number: record.chunk_number,
                offset: u64::from(record.chunk_number - 1) * session.chunk_size,
                data,
                checksum: record.checksum.clone(),
            });
        }

        let part_path = format!("{storage_path}.{}.part", session.id);
        let final_path = storage_path.to_string();
        let expected_len = session.file_size;
        tokio::task::spawn_blocking(move || {
            let mut writer = ChunkWriter::new(&root);
            let mut hasher = Sha256::new();
            let written = writer.create(&part_path).and_then(|()| {
                payloads.iter().try_for_each(|chunk| {
                    hasher.update(&chunk.data);
                    writer.write_chunk(&part_path, chunk)
                })
            });
            let part = root.join(&part_path);
            if let Err(e) = written
                .and_then(|()| check_assembled_len(&part, expected_len))
                .and_then(|()| {
                    std::fs::rename(&part, root.join(&final_path)).map_err(UploadError::from)
                })
            {
                let _ = std::fs::remove_file(&part);
                return Err(UploadError::AssemblyFailed(e.to_string()));
            }
            Ok(hex::encode(hasher.finalize()))
        })
        .await
        .map_err(|e| UploadError::AssemblyFailed(e.to_string()))?
    }

    /// Hashes the chunk payloads in order, if the backend kept all of them.
    async fn whole_file_checksum(
        &self,
        upload_id: UploadId,
        chunks: &[ChunkRecord],
    ) -> UploadResult<Option<String>> {
        let mut hasher = Sha256::new();
        for record in chunks {
            match self
                .store
                .chunk_payload(upload_id, record.chunk_number)
                .await?
            {
                Some(data) => hasher.update(&data),
                None => return Ok(None),
            }
        }
        Ok(Some(hex::encode(hasher.finalize())))
    }

    async fn release(&self, upload_id: UploadId, token: Uuid) {
        if let Err(e) = self.store.release_finalize(upload_id, token).await {
            warn!(upload = %upload_id, error = %e, "failed to release finalize lease");
        }
    }

    /// Artifact produced for `upload_id`, if it was finalized.
    pub async fn artifact(&self, upload_id: UploadId) -> UploadResult<Option<FinalArtifact>> {
        Ok(self.store.get_artifact_for_upload(upload_id).await?)
    }
}

fn check_assembled_len(path: &Path, expected: u64) -> UploadResult<()> {
    let len = std::fs::metadata(path)?.len();
    if len != expected {
        return Err(UploadError::AssemblyFailed(format!(
            "assembled {len} bytes, expected {expected}"
        )));
    }
    Ok(())
}

fn check_finalizable(session: &UploadSession) -> UploadResult<()> {
    match session.status {
        UploadStatus::Cancelled => Err(UploadError::SessionCancelled(session.id)),
        UploadStatus::Expired => Err(UploadError::SessionExpired(session.id)),
        _ if session.is_expired_at(Utc::now()) => Err(UploadError::SessionExpired(session.id)),
        UploadStatus::Completed | UploadStatus::Failed => Err(UploadError::InvalidState {
            id: session.id,
            status: session.status,
        }),
        UploadStatus::Initialized | UploadStatus::Uploading => Ok(()),
    }
}
