//! Data types for the upload driver.

use chunkline_protocol::messages::ProgressUpdate;
use chunkline_protocol::{FinalArtifact, UploadId};

/// Default number of chunks in flight at once.
pub const DEFAULT_PARALLELISM: usize = 4;

/// Config passed to the upload driver.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Chunks uploaded concurrently.
    pub parallelism: usize,
    /// Chunk size for new uploads. `None` uses the session default.
    pub chunk_size: Option<u64>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            chunk_size: None,
        }
    }
}

/// Event emitted while a file is uploading.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// A chunk landed.
    Progress(ProgressUpdate),
    /// A chunk could not be delivered.
    ChunkFailed {
        upload_id: UploadId,
        chunk: u32,
        error: String,
    },
    /// The upload was finalized.
    Completed(FinalArtifact),
    /// The run stopped without finalizing.
    Failed {
        upload_id: Option<UploadId>,
        error: String,
    },
}

/// Result of one driven upload.
#[derive(Debug, Clone)]
pub struct DriverResult {
    pub upload_id: UploadId,
    pub artifact: FinalArtifact,
    /// Chunks sent during this run.
    pub chunks_sent: u32,
    /// Chunks already present from an earlier run.
    pub chunks_skipped: u32,
    pub bytes_sent: u64,
}
