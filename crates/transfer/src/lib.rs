//! Chunked uploads: session lifecycle, chunk ingest, finalize and progress.
//!
//! All components share one [`UploadStore`](chunkline_store::UploadStore)
//! and keep no state of their own, so any number of them may serve the same
//! upload concurrently.

pub mod chunked;
pub mod error;
pub mod finalize;
pub mod ingest;
pub mod progress;
pub mod session;
pub mod validation;

pub use chunked::{
    Chunk, ChunkReader, ChunkWriter, calculate_file_checksum, checksum_bytes, is_sha256_hex,
    verify_checksum,
};
pub use error::{UploadError, UploadResult};
pub use finalize::{FinalizeConfig, Finalizer, storage_path_for};
pub use ingest::{ChunkIngest, ChunkUploader};
pub use progress::{DEFAULT_SPEED_WINDOW, ProgressTracker, SpeedCalculator};
pub use session::{SessionConfig, SessionManager, percent_floor};
pub use validation::{validate_file_name, validate_relative_path};
