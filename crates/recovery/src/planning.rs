use chrono::Utc;
use tracing::{debug, info};

use chunkline_protocol::messages::{
    BatchRecoveryResult, PrioritizedUpload, Priority, PriorityRecovery, PriorityRequest,
    RecoveryPlanEntry, SkippedUpload,
};
use chunkline_protocol::{UploadId, UploadStatus};
use chunkline_store::SessionRepo;

use crate::engine::{RecoveryEngine, missing_chunks};
use crate::error::RecoveryResult;

/// Expected cost of re-sending one chunk.
const SECS_PER_CHUNK: u64 = 10;

const MIB: u64 = 1024 * 1024;

fn plan_priority(missing: u32) -> Priority {
    match missing {
        0..=2 => Priority::High,
        3..=5 => Priority::Medium,
        _ => Priority::Low,
    }
}

fn priority_weight(priority: Priority) -> u32 {
    match priority {
        Priority::High => 50,
        Priority::Medium => 25,
        Priority::Low => 10,
    }
}

fn size_bonus(file_size: u64) -> u32 {
    if file_size < 10 * MIB {
        10
    } else if file_size < 100 * MIB {
        5
    } else {
        0
    }
}

impl RecoveryEngine {
    /// Builds a recovery plan for several uploads, fewest missing chunks
    /// first.
    pub async fn batch_recover_uploads(
        &self,
        upload_ids: &[UploadId],
    ) -> RecoveryResult<BatchRecoveryResult> {
        let now = Utc::now();
        let mut skipped = Vec::new();
        let mut plan = Vec::new();

        for &upload_id in upload_ids {
            let Some(session) = self.store.get_session(upload_id).await? else {
                skipped.push(SkippedUpload {
                    upload_id,
                    reason: "upload not found".into(),
                });
                continue;
            };

            let reason = match session.status {
                UploadStatus::Completed => Some("upload already completed".to_string()),
                UploadStatus::Cancelled => Some("upload was cancelled".to_string()),
                UploadStatus::Expired => Some("upload expired".to_string()),
                _ if session.is_expired_at(now) => Some("upload expired".to_string()),
                _ => None,
            };
            if let Some(reason) = reason {
                skipped.push(SkippedUpload { upload_id, reason });
                continue;
            }

            let completed = self.completed_chunks(&session).await?;
            let missing = missing_chunks(session.total_chunks, &completed).len() as u32;
            if missing == 0 {
                skipped.push(SkippedUpload {
                    upload_id,
                    reason: "no missing chunks".into(),
                });
                continue;
            }

            plan.push(RecoveryPlanEntry {
                upload_id,
                missing_chunks: missing,
                priority: plan_priority(missing),
                estimated_time_secs: u64::from(missing) * SECS_PER_CHUNK,
            });
        }

        plan.sort_by_key(|e| (e.missing_chunks, e.upload_id));
        info!(
            requested = upload_ids.len(),
            recoverable = plan.len(),
            skipped = skipped.len(),
            "batch recovery planned"
        );

        Ok(BatchRecoveryResult {
            total_uploads: upload_ids.len() as u32,
            recoverable_uploads: plan.iter().map(|e| e.upload_id).collect(),
            skipped,
            recovery_plan: plan,
        })
    }

    /// Ranks uploads by owner priority, closeness to completion and file size.
    ///
    /// Unknown uploads are left out of the ranking.
    pub async fn prioritize_recovery(
        &self,
        requests: &[PriorityRequest],
    ) -> RecoveryResult<PriorityRecovery> {
        let mut ranked = Vec::with_capacity(requests.len());

        for request in requests {
            let Some(session) = self.store.get_session(request.upload_id).await? else {
                debug!(upload = %request.upload_id, "not ranked: upload not found");
                continue;
            };
            let completed = self.completed_chunks(&session).await?;
            let missing = missing_chunks(session.total_chunks, &completed).len() as u32;

            let weight = priority_weight(request.user_priority);
            let closeness = 20u32.saturating_sub(missing.saturating_mul(2));
            let bonus = size_bonus(session.file_size);

            ranked.push(PrioritizedUpload {
                upload_id: request.upload_id,
                score: weight + closeness + bonus,
                reason: format!(
                    "{} priority (+{weight}), {missing} chunks missing (+{closeness}), \
                     {} MiB file (+{bonus})",
                    request.user_priority.as_str(),
                    session.file_size.div_ceil(MIB),
                ),
                missing_chunks: missing,
                user_priority: request.user_priority,
            });
        }

        ranked.sort_by(|a, b| b.score.cmp(&a.score).then(a.upload_id.cmp(&b.upload_id)));
        Ok(PriorityRecovery {
            prioritized_uploads: ranked,
        })
    }
}
