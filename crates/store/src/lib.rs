//! Persistence contract for chunked uploads.
//!
//! The store is split into small repository traits, one per table:
//! - [`SessionRepo`]: upload sessions, status transitions and finalize leases
//! - [`ChunkRepo`]: the chunk ledger, keyed by `(upload_id, chunk_number)`
//! - [`RetryLogRepo`]: append-only log of chunk attempts
//! - [`ArtifactRepo`]: final artifacts produced by finalize
//! - [`StatsRepo`]: aggregate queries for recovery scheduling
//!
//! [`UploadStore`] bundles them for components that need the whole backend.
//! [`MemoryUploadStore`] is the in-process implementation used by tests and
//! single-node deployments.

pub mod error;
pub mod memory;
pub mod repos;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryUploadStore;
pub use repos::{
    ArtifactRepo, AttemptStats, ChunkPurge, ChunkRepo, RetryLogRepo, SessionFilter, SessionRepo,
    StatsRepo, UploadStore,
};
