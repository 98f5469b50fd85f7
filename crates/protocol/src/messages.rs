use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{FailureKind, UploadId, UploadSession, UploadStatus};

// ---------------------------------------------------------------------------
// Session / ingest responses
// ---------------------------------------------------------------------------

/// Acknowledgement of one accepted chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResult {
    pub chunk_number: u32,
    pub checksum: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
    pub is_complete: bool,
}

/// Answer to `getUploadStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusReport {
    pub session: UploadSession,
    pub completed_chunks: u32,
    pub progress: u8,
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// What a client needs to continue an interrupted upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeInfo {
    pub upload_id: UploadId,
    pub status: UploadStatus,
    pub completed_chunks: Vec<u32>,
    pub missing_chunks: Vec<u32>,
    pub can_resume: bool,
    pub progress: u8,
    pub total_chunks: u32,
    pub chunk_size: u64,
}

/// Outcome of a successful `retryChunkUpload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryOutcome {
    pub success: bool,
    pub attempts: u32,
    pub total_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairReason {
    MissingChunk,
    ChecksumMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairActionKind {
    Reupload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairAction {
    pub chunk_number: u32,
    pub action: RepairActionKind,
    pub reason: RepairReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairResult {
    pub upload_id: UploadId,
    pub missing_chunks: Vec<u32>,
    pub corrupted_chunks: Vec<u32>,
    pub repair_actions: Vec<RepairAction>,
    pub repair_required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    StandardRetry,
    ExponentialBackoff,
    ExponentialBackoffWithCircuitBreaker,
    LinearBackoffWithJitter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Aggregate of the failed attempts recorded for one upload.
///
/// `primary_failure_type` is `None` when no failure was ever recorded, and
/// goes over the wire as `"none"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailurePattern {
    pub upload_id: UploadId,
    pub total_failures: u32,
    pub failure_types: BTreeMap<FailureKind, u32>,
    #[serde(with = "primary_failure", default)]
    pub primary_failure_type: Option<FailureKind>,
    pub recommended_strategy: RecoveryStrategy,
    pub risk_level: RiskLevel,
    pub estimated_recovery_time_secs: u64,
}

/// `Option<FailureKind>` with `"none"` standing for the empty case.
mod primary_failure {
    use serde::de::IntoDeserializer;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::types::FailureKind;

    const NONE: &str = "none";

    pub fn serialize<S: Serializer>(
        kind: &Option<FailureKind>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match kind {
            Some(kind) => kind.serialize(serializer),
            None => serializer.serialize_str(NONE),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<FailureKind>, D::Error> {
        match Option::<String>::deserialize(deserializer)?.as_deref() {
            None | Some(NONE) => Ok(None),
            Some(raw) => {
                let kind = IntoDeserializer::<'_, D::Error>::into_deserializer(raw);
                FailureKind::deserialize(kind).map(Some)
            }
        }
    }
}

/// Recommendation on when to attempt recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryTime {
    pub upload_id: UploadId,
    pub recommended_time: DateTime<Utc>,
    pub should_wait: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_reason: Option<String>,
    pub current_load: f64,
    pub success_rate: f64,
}

/// Priority label, used both for user-declared priority and plan entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryPlanEntry {
    pub upload_id: UploadId,
    pub missing_chunks: u32,
    pub priority: Priority,
    pub estimated_time_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedUpload {
    pub upload_id: UploadId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRecoveryResult {
    pub total_uploads: u32,
    pub recoverable_uploads: Vec<UploadId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedUpload>,
    pub recovery_plan: Vec<RecoveryPlanEntry>,
}

/// One upload to rank, with the priority its owner asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityRequest {
    pub upload_id: UploadId,
    pub user_priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrioritizedUpload {
    pub upload_id: UploadId,
    pub score: u32,
    pub reason: String,
    pub missing_chunks: u32,
    pub user_priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityRecovery {
    pub prioritized_uploads: Vec<PrioritizedUpload>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanCleanup {
    pub cleaned_sessions: u64,
    pub cleaned_chunks: u64,
    pub reclaimed_space: u64,
}

/// Summary of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub expired_sessions: u64,
    pub orphans: OrphanCleanup,
    /// Expired rows deleted after sitting idle past the orphan threshold.
    #[serde(default)]
    pub expired_removed: u64,
    pub retry_logs_removed: u64,
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub upload_id: UploadId,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub progress_percentage: u8,
    pub completed_chunks: u32,
    pub total_chunks: u32,
    /// Lowest-numbered chunk still missing.
    pub current_chunk: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedTrend {
    Increasing,
    Decreasing,
    Stable,
}

/// Throughput derived from the ledger, in bytes per second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSpeed {
    pub upload_id: UploadId,
    pub average_speed: f64,
    pub current_speed: f64,
    pub speed_trend: SpeedTrend,
    pub sample_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEstimate {
    pub upload_id: UploadId,
    pub estimated_time_remaining_secs: f64,
    pub avg_chunk_time_secs: f64,
    pub confidence: f64,
    pub remaining_chunks: u32,
    pub estimated_completion_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStability {
    Excellent,
    Good,
    Fair,
    Poor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub upload_id: UploadId,
    pub error_rate: f64,
    pub retry_rate: f64,
    pub efficiency: f64,
    pub network_stability: NetworkStability,
    pub recommendations: Vec<String>,
}

/// Progress event handed to the notification layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub upload_id: UploadId,
    pub progress_percentage: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<f64>,
    pub status: UploadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_chunk: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_update_omits_unknowns() {
        let update = ProgressUpdate {
            upload_id: UploadId::new(),
            progress_percentage: 40,
            upload_speed: None,
            estimated_time_remaining: None,
            status: UploadStatus::Uploading,
            current_chunk: Some(2),
        };
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("\"progressPercentage\":40"));
        assert!(json.contains("\"currentChunk\":2"));
        assert!(!json.contains("uploadSpeed"));
        assert!(!json.contains("estimatedTimeRemaining"));
    }

    #[test]
    fn repair_action_wire_names() {
        let action = RepairAction {
            chunk_number: 3,
            action: RepairActionKind::Reupload,
            reason: RepairReason::ChecksumMismatch,
        };
        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("\"action\":\"reupload\""));
        assert!(json.contains("\"reason\":\"checksum_mismatch\""));
    }

    #[test]
    fn failure_pattern_without_failures_reports_none() {
        let pattern = FailurePattern {
            upload_id: UploadId::new(),
            total_failures: 0,
            failure_types: BTreeMap::new(),
            primary_failure_type: None,
            recommended_strategy: RecoveryStrategy::StandardRetry,
            risk_level: RiskLevel::Low,
            estimated_recovery_time_secs: 0,
        };
        let json = serde_json::to_string(&pattern).unwrap();
        assert!(json.contains("\"primaryFailureType\":\"none\""));
        assert!(json.contains("\"recommendedStrategy\":\"standard_retry\""));
        let back: FailurePattern = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pattern);

        let timed_out = FailurePattern {
            total_failures: 2,
            primary_failure_type: Some(FailureKind::NetworkTimeout),
            ..pattern
        };
        let json = serde_json::to_string(&timed_out).unwrap();
        assert!(json.contains("\"primaryFailureType\":\"network_timeout\""));
        let back: FailurePattern = serde_json::from_str(&json).unwrap();
        assert_eq!(back.primary_failure_type, Some(FailureKind::NetworkTimeout));
    }

    #[test]
    fn failure_types_keyed_by_wire_name() {
        let mut types = BTreeMap::new();
        types.insert(FailureKind::NetworkTimeout, 2u32);
        let json = serde_json::to_string(&types).unwrap();
        assert_eq!(json, r#"{"network_timeout":2}"#);
    }

    #[test]
    fn priority_orders_high_first() {
        let mut p = vec![Priority::Low, Priority::High, Priority::Medium];
        p.sort();
        assert_eq!(p, vec![Priority::High, Priority::Medium, Priority::Low]);
    }
}
