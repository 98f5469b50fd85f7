use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of an upload session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadId(Uuid);

impl UploadId {
    /// Generates a new random upload ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses an upload ID from its string form.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Initialized,
    Uploading,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl UploadStatus {
    /// Returns `true` if the session may still receive chunks.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Initialized | Self::Uploading)
    }

    /// Returns `true` if the session reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Whether a transition from `self` to `next` is allowed.
    ///
    /// Status only moves forward. `Cancelled` and `Expired` are reachable from
    /// any non-terminal state and absorb everything after them.
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        match (self, next) {
            (Initialized, Uploading) => true,
            (Initialized | Uploading, Completed | Failed | Cancelled | Expired) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who an upload belongs to. Opaque to the core apart from artifact paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album_id: Option<String>,
}

/// Client-supplied description of the file to upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_name: String,
    pub file_size: u64,
    /// Chunk size override; the service default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    #[serde(default)]
    pub owner: OwnerContext,
}

/// Exclusive, time-bounded claim on a session held by a running finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeLease {
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl FinalizeLease {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Number of chunks needed to carry `file_size` bytes.
pub fn total_chunks_for(file_size: u64, chunk_size: u64) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    u32::try_from(file_size.div_ceil(chunk_size)).unwrap_or(u32::MAX)
}

/// Bookkeeping record for one upload attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub id: UploadId,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    #[serde(default)]
    pub owner: OwnerContext,
    pub status: UploadStatus,
    pub created_at: DateTime<Utc>,
    /// Last activity on the session (status change or accepted chunk).
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize_lease: Option<FinalizeLease>,
}

impl UploadSession {
    /// Creates a fresh `initialized` session.
    pub fn new(
        file_name: String,
        file_size: u64,
        chunk_size: u64,
        owner: OwnerContext,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: UploadId::new(),
            file_name,
            file_size,
            chunk_size,
            total_chunks: total_chunks_for(file_size, chunk_size),
            owner,
            status: UploadStatus::Initialized,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
            finalize_lease: None,
        }
    }

    /// Whether the TTL elapsed at `now`, regardless of the stored status.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Expected size of chunk `chunk_number` (the last one may be short).
    pub fn expected_chunk_size(&self, chunk_number: u32) -> u64 {
        if chunk_number == 0 || chunk_number > self.total_chunks {
            return 0;
        }
        let offset = u64::from(chunk_number - 1) * self.chunk_size;
        self.chunk_size.min(self.file_size - offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Completed,
}

/// One accepted chunk in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    pub upload_id: UploadId,
    pub chunk_number: u32,
    /// SHA-256 hex digest of the chunk bytes.
    pub checksum: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
    pub status: ChunkStatus,
}

/// Classification of a failed chunk attempt, as recorded in the retry log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NetworkTimeout,
    ServerError,
    ChecksumMismatch,
    StorageError,
    SessionError,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "network_timeout",
            Self::ServerError => "server_error",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::StorageError => "storage_error",
            Self::SessionError => "session_error",
            Self::Unknown => "unknown",
        }
    }

    /// Relative severity used when grading recovery risk.
    pub fn severity(&self) -> u8 {
        match self {
            Self::ServerError | Self::StorageError => 3,
            Self::NetworkTimeout | Self::ChecksumMismatch => 2,
            Self::SessionError | Self::Unknown => 1,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One chunk upload attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryLogEntry {
    pub upload_id: UploadId,
    pub chunk_number: u32,
    pub attempt_number: u32,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// The assembled result of a finalized upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalArtifact {
    pub id: Uuid,
    pub source_upload_id: UploadId,
    pub file_name: String,
    pub storage_path: String,
    pub file_size: u64,
    /// Whole-file SHA-256, when chunk payloads were available to hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(file_size: u64, chunk_size: u64) -> UploadSession {
        UploadSession::new(
            "photo.jpg".into(),
            file_size,
            chunk_size,
            OwnerContext::default(),
            Duration::hours(24),
            Utc::now(),
        )
    }

    #[test]
    fn upload_id_roundtrip() {
        let id = UploadId::new();
        let parsed = UploadId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert!(UploadId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn total_chunks_is_ceiling() {
        assert_eq!(total_chunks_for(1, 1024), 1);
        assert_eq!(total_chunks_for(1024, 1024), 1);
        assert_eq!(total_chunks_for(1025, 1024), 2);
        assert_eq!(total_chunks_for(10 * 1024 * 1024, 1024 * 1024), 10);
        assert_eq!(session(100, 64).total_chunks, 2);
    }

    #[test]
    fn expected_chunk_size_handles_short_tail() {
        let s = session(100, 64);
        assert_eq!(s.expected_chunk_size(1), 64);
        assert_eq!(s.expected_chunk_size(2), 36);
        assert_eq!(s.expected_chunk_size(3), 0);
        assert_eq!(s.expected_chunk_size(0), 0);
    }

    #[test]
    fn status_transitions_move_forward_only() {
        use UploadStatus::*;
        assert!(Initialized.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Completed));
        assert!(Uploading.can_transition_to(Cancelled));
        assert!(Initialized.can_transition_to(Expired));
        assert!(!Uploading.can_transition_to(Initialized));
        assert!(!Completed.can_transition_to(Uploading));
        assert!(!Cancelled.can_transition_to(Uploading));
        assert!(!Expired.can_transition_to(Cancelled));
    }

    #[test]
    fn expiry_ignores_stored_status() {
        let mut s = session(10, 1024);
        s.expires_at = Utc::now() - Duration::seconds(1);
        assert_eq!(s.status, UploadStatus::Initialized);
        assert!(s.is_expired());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&UploadStatus::Uploading).unwrap();
        assert_eq!(json, "\"uploading\"");
        let kind = serde_json::to_string(&FailureKind::NetworkTimeout).unwrap();
        assert_eq!(kind, "\"network_timeout\"");
    }

    #[test]
    fn session_json_uses_camel_case() {
        let json = serde_json::to_string(&session(10, 1024)).unwrap();
        assert!(json.contains("\"totalChunks\":1"));
        assert!(json.contains("\"expiresAt\""));
        assert!(!json.contains("finalizeLease"));
    }
}
