//! Recovery for chunked uploads.
//!
//! [`RecoveryEngine`] works purely off the shared store: it tells a client
//! which chunks to resend, retries chunk uploads with exponential backoff,
//! detects corrupted chunks, grades failure history, plans batch recovery and
//! purges expired or orphaned state. [`MaintenanceScheduler`] runs the purges
//! periodically.

mod analysis;
mod cleanup;
mod engine;
mod error;
mod planning;
mod policy;
mod repair;
mod resume;
mod retry;

pub use cleanup::MaintenanceScheduler;
pub use engine::{RecoveryConfig, RecoveryEngine};
pub use error::{RecoveryError, RecoveryResult};
pub use policy::RetryPolicy;
