//! Shared data model and wire types for chunked, resumable uploads.
//!
//! Every other crate in the workspace speaks in these types: sessions, chunk
//! records, retry log entries, final artifacts, the report values returned by
//! recovery and progress queries, and the tagged [`ApiResult`] envelope.

pub mod codes;
pub mod envelope;
pub mod messages;
pub mod types;

pub use codes::ErrorCode;
pub use envelope::{ApiError, ApiResult, Coded};
pub use types::{
    ChunkRecord, ChunkStatus, FailureKind, FileMetadata, FinalArtifact, FinalizeLease,
    OwnerContext, RetryLogEntry, UploadId, UploadSession, UploadStatus, total_chunks_for,
};

/// Default chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Smallest chunk size a client may request: 64 KiB.
pub const MIN_CHUNK_SIZE: u64 = 64 * 1024;

/// Largest chunk size a client may request: 32 MiB.
pub const MAX_CHUNK_SIZE: u64 = 32 * 1024 * 1024;

/// Default session lifetime in hours.
pub const DEFAULT_SESSION_TTL_HOURS: i64 = 24;
