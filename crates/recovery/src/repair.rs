use tracing::{info, warn};

use chunkline_protocol::UploadId;
use chunkline_protocol::messages::{RepairAction, RepairActionKind, RepairReason, RepairResult};
use chunkline_store::ChunkRepo;
use chunkline_transfer::{is_sha256_hex, verify_checksum};

use crate::engine::{RecoveryEngine, missing_chunks};
use crate::error::RecoveryResult;

impl RecoveryEngine {
    /// Finds missing and corrupted chunks and lists what to re-upload.
    ///
    /// A chunk is corrupted when its stored bytes no longer hash to the
    /// recorded checksum. Without stored bytes, the record is only checked
    /// for a well-formed SHA-256 fingerprint.
    pub async fn validate_and_repair_upload(
        &self,
        upload_id: UploadId,
    ) -> RecoveryResult<RepairResult> {
        let session = self.load_session(upload_id).await?;
        let records = self.store.list_chunks(upload_id).await?;

        let completed = records
            .iter()
            .map(|r| r.chunk_number)
            .filter(|n| (1..=session.total_chunks).contains(n))
            .collect();
        let missing = missing_chunks(session.total_chunks, &completed);

        let mut corrupted = Vec::new();
        for record in records
            .iter()
            .filter(|r| (1..=session.total_chunks).contains(&r.chunk_number))
        {
            let intact = match self
                .store
                .chunk_payload(upload_id, record.chunk_number)
                .await?
            {
                Some(data) => {
                    data.len() as u64 == record.size && verify_checksum(&data, &record.checksum)
                }
                None => is_sha256_hex(&record.checksum),
            };
            if !intact {
                warn!(upload = %upload_id, chunk = record.chunk_number, "corrupted chunk");
                corrupted.push(record.chunk_number);
            }
        }

        let mut repair_actions: Vec<RepairAction> = missing
            .iter()
            .map(|&n| (n, RepairReason::MissingChunk))
            .chain(corrupted.iter().map(|&n| (n, RepairReason::ChecksumMismatch)))
            .map(|(chunk_number, reason)| RepairAction {
                chunk_number,
                action: RepairActionKind::Reupload,
                reason,
            })
            .collect();
        repair_actions.sort_by_key(|a| a.chunk_number);

        let repair_required = !missing.is_empty() || !corrupted.is_empty();
        if repair_required {
            info!(
                upload = %upload_id,
                missing = missing.len(),
                corrupted = corrupted.len(),
                "upload needs repair"
            );
        }

        Ok(RepairResult {
            upload_id,
            missing_chunks: missing,
            corrupted_chunks: corrupted,
            repair_actions,
            repair_required,
        })
    }
}
