//! Whole-file upload driver.
//!
//! Composes the session manager, the recovery engine's retry loop and the
//! finalizer into a single call for uploading a local file.
//!
//! # Pipeline
//!
//! 1. **Init** or **Resume**: open a session, or ask the recovery engine
//!    which chunks an existing one is missing
//! 2. **Upload**: send the missing chunks in parallel, retrying each with
//!    backoff
//! 3. **Finalize**: assemble the artifact and purge the ledger
//!
//! Progress and failures are reported as [`DriverEvent`]s.

pub mod driver;
pub mod error;
pub mod types;

pub use driver::UploadDriver;
pub use error::DriverError;
pub use types::{DEFAULT_PARALLELISM, DriverConfig, DriverEvent, DriverResult};
