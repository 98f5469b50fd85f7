use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chunkline_protocol::UploadStatus;
use chunkline_protocol::messages::{CleanupReport, OrphanCleanup};
use chunkline_store::{ChunkRepo, RetryLogRepo, SessionFilter, SessionRepo};

use crate::engine::RecoveryEngine;
use crate::error::{RecoveryError, RecoveryResult};

impl RecoveryEngine {
    /// Drops retry log entries older than `retention_days`.
    pub async fn cleanup_expired_retry_logs(&self, retention_days: u32) -> RecoveryResult<u64> {
        let cutoff = chrono::Duration::try_days(i64::from(retention_days))
            .and_then(cutoff_for)
            .ok_or_else(|| {
                RecoveryError::InvalidArgument(format!(
                    "retry log retention of {retention_days} days is out of range"
                ))
            })?;
        let removed = self.store.delete_retries_before(cutoff).await?;
        if removed > 0 {
            info!(removed, retention_days, "expired retry log entries removed");
        }
        Ok(removed)
    }

    /// Deletes failed and cancelled sessions idle for longer than
    /// `inactivity`, together with their chunks.
    ///
    /// Reclaimed space is the size of the purged chunks. Sessions whose
    /// chunks were already gone are counted at their declared file size.
    pub async fn cleanup_orphan_sessions(
        &self,
        inactivity: chrono::Duration,
    ) -> RecoveryResult<OrphanCleanup> {
        let cutoff = cutoff_for(inactivity).ok_or_else(|| {
            RecoveryError::InvalidArgument(format!(
                "orphan threshold of {}h is out of range",
                inactivity.num_hours()
            ))
        })?;
        let filter = SessionFilter {
            updated_before: Some(cutoff),
            ..SessionFilter::with_statuses(&[UploadStatus::Failed, UploadStatus::Cancelled])
        };
        let orphans = self.store.list_sessions(&filter).await?;

        let mut report = OrphanCleanup::default();
        let mut declared_bytes = 0u64;
        for session in orphans {
            let purge = self.store.delete_chunks(session.id).await?;
            if self.store.delete_session(session.id).await? {
                debug!(upload = %session.id, chunks = purge.chunks, "orphan session removed");
                report.cleaned_sessions += 1;
                declared_bytes += session.file_size;
            }
            report.cleaned_chunks += purge.chunks;
            report.reclaimed_space += purge.bytes;
        }
        if report.reclaimed_space == 0 {
            report.reclaimed_space = declared_bytes;
        }

        if report.cleaned_sessions > 0 {
            info!(
                sessions = report.cleaned_sessions,
                chunks = report.cleaned_chunks,
                bytes = report.reclaimed_space,
                "orphan sessions cleaned"
            );
        }
        Ok(report)
    }

    /// Deletes expired session rows idle for longer than `inactivity`.
    ///
    /// Their chunks were purged when they expired; any left behind go too.
    pub async fn purge_expired_sessions(
        &self,
        inactivity: chrono::Duration,
    ) -> RecoveryResult<u64> {
        let cutoff = cutoff_for(inactivity).ok_or_else(|| {
            RecoveryError::InvalidArgument(format!(
                "expired-row threshold of {}h is out of range",
                inactivity.num_hours()
            ))
        })?;
        let filter = SessionFilter {
            updated_before: Some(cutoff),
            ..SessionFilter::with_statuses(&[UploadStatus::Expired])
        };

        let mut removed = 0u64;
        for session in self.store.list_sessions(&filter).await? {
            self.store.delete_chunks(session.id).await?;
            if self.store.delete_session(session.id).await? {
                debug!(upload = %session.id, "expired session removed");
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "expired sessions removed");
        }
        Ok(removed)
    }

    /// One maintenance pass: expire stale sessions, drop orphans and old
    /// expired rows, trim the retry log.
    pub async fn run_once(&self) -> RecoveryResult<CleanupReport> {
        self.maintenance_pass().await.map_err(|e| {
            warn!(error = %e, "maintenance pass failed");
            RecoveryError::CleanupFailed(e.to_string())
        })
    }

    async fn maintenance_pass(&self) -> RecoveryResult<CleanupReport> {
        Ok(CleanupReport {
            expired_sessions: self.sessions.expire_stale(Utc::now()).await?,
            orphans: self
                .cleanup_orphan_sessions(self.config.orphan_threshold)
                .await?,
            expired_removed: self
                .purge_expired_sessions(self.config.orphan_threshold)
                .await?,
            retry_logs_removed: self
                .cleanup_expired_retry_logs(self.config.retry_log_retention_days)
                .await?,
        })
    }
}

/// `now - age`, or `None` when the age is negative or out of range.
fn cutoff_for(age: chrono::Duration) -> Option<DateTime<Utc>> {
    if age < chrono::Duration::zero() {
        return None;
    }
    Utc::now().checked_sub_signed(age)
}

/// Shortest period the scheduler will tick at.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Runs [`RecoveryEngine::run_once`] on a fixed period until cancelled.
pub struct MaintenanceScheduler {
    engine: Arc<RecoveryEngine>,
    interval: Duration,
    cancel: CancellationToken,
}

impl MaintenanceScheduler {
    /// Scheduler ticking at the engine's configured cleanup interval.
    pub fn new(engine: Arc<RecoveryEngine>) -> Self {
        let interval = engine.config().cleanup_interval;
        Self::with_interval(engine, interval)
    }

    /// Periods shorter than one second are raised to one second.
    pub fn with_interval(engine: Arc<RecoveryEngine>, interval: Duration) -> Self {
        Self {
            engine,
            interval: interval.max(MIN_INTERVAL),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the loop when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Spawns the maintenance loop. The first pass runs immediately.
    pub fn start(&self) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let cancel = self.cancel.clone();
        let period = self.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Failures are already logged; the next tick retries.
                        if let Ok(report) = engine.run_once().await {
                            debug!(?report, "maintenance pass done");
                        }
                    }
                    _ = cancel.cancelled() => {
                        info!("maintenance scheduler stopped");
                        break;
                    }
                }
            }
        })
    }
}
