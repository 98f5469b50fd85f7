//! Resumable chunked uploads behind a single service object.
//!
//! [`UploadService`] owns the session manager, chunk ingest, finalizer,
//! recovery engine and progress tracker for one [`UploadStore`], and returns
//! every answer as an [`ApiResult`] tagged `success` or `error`.
//!
//! [`UploadStore`]: chunkline_store::UploadStore
//! [`ApiResult`]: chunkline_protocol::ApiResult

pub mod config;
pub mod service;

pub use config::{ConfigError, ServiceConfig};
pub use service::{ProgressCallback, UploadService};
