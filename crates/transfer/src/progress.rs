//! Progress, throughput and ETA derived from the chunk ledger, plus a live
//! sliding-window speed calculator for clients.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use chunkline_protocol::messages::{
    CompletionEstimate, NetworkStability, PerformanceMetrics, ProgressUpdate, SpeedTrend,
    UploadProgress, UploadSpeed,
};
use chunkline_protocol::{ChunkRecord, UploadId, UploadSession};
use chunkline_store::{ChunkRepo, RetryLogRepo, SessionRepo, UploadStore};

use crate::error::{UploadError, UploadResult};

/// Number of recent chunks used for speed and ETA figures.
pub const DEFAULT_SPEED_WINDOW: usize = 10;

/// Relative change in speed below which the trend counts as stable.
const TREND_BAND: f64 = 0.10;

/// Shortest interval credited to one chunk, so bursts don't divide by zero.
const MIN_INTERVAL_SECS: f64 = 0.001;

const MIN_CONFIDENCE: f64 = 0.1;
const MAX_CONFIDENCE: f64 = 0.95;

/// Read-only view over the ledger answering progress queries.
pub struct ProgressTracker {
    store: Arc<dyn UploadStore>,
    window: usize,
}

/// One chunk's share of elapsed time.
#[derive(Debug, Clone, Copy)]
struct Sample {
    bytes: u64,
    secs: f64,
}

impl Sample {
    fn speed(&self) -> f64 {
        self.bytes as f64 / self.secs
    }
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn UploadStore>, window: usize) -> Self {
        Self {
            store,
            window: window.max(1),
        }
    }

    async fn session(&self, upload_id: UploadId) -> UploadResult<UploadSession> {
        self.store
            .get_session(upload_id)
            .await?
            .ok_or(UploadError::SessionNotFound(upload_id))
    }

    /// Bytes and chunks received so far.
    pub async fn calculate_progress(&self, upload_id: UploadId) -> UploadResult<UploadProgress> {
        let session = self.session(upload_id).await?;
        let chunks = self.store.list_chunks(upload_id).await?;

        let uploaded_bytes: u64 = chunks.iter().map(|c| c.size).sum();
        let present: BTreeSet<u32> = chunks.iter().map(|c| c.chunk_number).collect();
        let current_chunk = (1..=session.total_chunks).find(|n| !present.contains(n));

        Ok(UploadProgress {
            upload_id,
            uploaded_bytes,
            total_bytes: session.file_size,
            progress_percentage: percent_round(uploaded_bytes, session.file_size),
            completed_chunks: present.len() as u32,
            total_chunks: session.total_chunks,
            current_chunk,
        })
    }

    /// Throughput over the most recent chunks, in bytes per second.
    pub async fn calculate_upload_speed(&self, upload_id: UploadId) -> UploadResult<UploadSpeed> {
        let session = self.session(upload_id).await?;
        let samples = self.recent_samples(&session).await?;

        let (average_speed, current_speed) = match samples.last() {
            Some(last) => {
                let bytes: u64 = samples.iter().map(|s| s.bytes).sum();
                let secs: f64 = samples.iter().map(|s| s.secs).sum();
                (bytes as f64 / secs, last.speed())
            }
            None => (0.0, 0.0),
        };

        Ok(UploadSpeed {
            upload_id,
            average_speed,
            current_speed,
            speed_trend: speed_trend(&samples),
            sample_count: samples.len() as u32,
        })
    }

    /// Remaining time from the mean per-chunk interval.
    ///
    /// Confidence grows with the number of samples and shrinks with their
    /// spread, bounded to `[0.1, 0.95]`.
    pub async fn estimate_completion_time(
        &self,
        upload_id: UploadId,
    ) -> UploadResult<CompletionEstimate> {
        let session = self.session(upload_id).await?;
        let completed = self.store.count_chunks(upload_id).await?;
        if completed == 0 {
            return Err(UploadError::InsufficientData(format!(
                "no chunks completed for {upload_id}"
            )));
        }
        let samples = self.recent_samples(&session).await?;
        if samples.is_empty() {
            return Err(UploadError::InsufficientData(format!(
                "no timing samples for {upload_id}"
            )));
        }

        let n = samples.len() as f64;
        let mean = samples.iter().map(|s| s.secs).sum::<f64>() / n;
        let variance = samples
            .iter()
            .map(|s| (s.secs - mean).powi(2))
            .sum::<f64>()
            / n;
        let cv = if mean > 0.0 {
            variance.sqrt() / mean
        } else {
            0.0
        };
        let coverage = (n / self.window as f64).min(1.0);
        let confidence = (MIN_CONFIDENCE + (MAX_CONFIDENCE - MIN_CONFIDENCE) * coverage / (1.0 + cv))
            .clamp(MIN_CONFIDENCE, MAX_CONFIDENCE);

        let remaining_chunks = session
            .total_chunks
            .saturating_sub(u32::try_from(completed).unwrap_or(u32::MAX));
        let remaining_secs = f64::from(remaining_chunks) * mean;

        Ok(CompletionEstimate {
            upload_id,
            estimated_time_remaining_secs: remaining_secs,
            avg_chunk_time_secs: mean,
            confidence,
            remaining_chunks,
            estimated_completion_at: Utc::now()
                + chrono::Duration::milliseconds((remaining_secs * 1000.0).round() as i64),
        })
    }

    /// Error and retry rates relative to the chunk count.
    pub async fn get_performance_metrics(
        &self,
        upload_id: UploadId,
    ) -> UploadResult<PerformanceMetrics> {
        let session = self.session(upload_id).await?;
        let completed = self.store.count_chunks(upload_id).await?;
        let attempts = self.store.list_retries(upload_id).await?;

        let total = f64::from(session.total_chunks.max(1));
        let failures = attempts.iter().filter(|a| !a.success).count() as f64;
        let retries = attempts.iter().filter(|a| a.attempt_number > 1).count() as f64;

        let error_rate = failures / total;
        let retry_rate = retries / total;
        let efficiency = (completed as f64 / total).min(1.0);
        let network_stability = classify_stability(error_rate, retry_rate);

        let mut recommendations = Vec::new();
        if error_rate > 0.1 {
            recommendations.push("Check network connectivity; many chunk attempts fail".to_string());
        }
        if retry_rate > 0.2 {
            recommendations.push("Use a smaller chunk size to reduce retry cost".to_string());
        }
        if matches!(network_stability, NetworkStability::Poor) {
            recommendations.push("Pause and resume the upload when the connection improves".to_string());
        }
        if efficiency < 1.0 && session.status.is_active() && recommendations.is_empty() {
            recommendations.push("Resume the upload to send the remaining chunks".to_string());
        }

        Ok(PerformanceMetrics {
            upload_id,
            error_rate,
            retry_rate,
            efficiency,
            network_stability,
            recommendations,
        })
    }

    /// Snapshot for the notification layer. Speed and ETA are omitted when
    /// there isn't enough data for them.
    pub async fn progress_update(&self, upload_id: UploadId) -> UploadResult<ProgressUpdate> {
        let session = self.session(upload_id).await?;
        let progress = self.calculate_progress(upload_id).await?;
        let speed = self.calculate_upload_speed(upload_id).await?;
        let eta = match self.estimate_completion_time(upload_id).await {
            Ok(e) => Some(e.estimated_time_remaining_secs),
            Err(UploadError::InsufficientData(_)) => None,
            Err(e) => return Err(e),
        };

        Ok(ProgressUpdate {
            upload_id,
            progress_percentage: progress.progress_percentage,
            upload_speed: (speed.sample_count > 0).then_some(speed.average_speed),
            estimated_time_remaining: eta,
            status: session.status,
            current_chunk: progress.current_chunk,
        })
    }

    /// Per-chunk intervals for the latest `window` chunks, oldest first.
    ///
    /// Each chunk is credited with the time since the chunk before it, the
    /// first one with the time since the session was created.
    async fn recent_samples(&self, session: &UploadSession) -> UploadResult<Vec<Sample>> {
        let mut recent = self.store.recent_chunks(session.id, self.window + 1).await?;
        recent.reverse();

        let (mut prev, window): (DateTime<Utc>, &[ChunkRecord]) = if recent.len() > self.window {
            (recent[0].uploaded_at, &recent[1..])
        } else {
            (session.created_at, &recent[..])
        };

        let mut samples = Vec::with_capacity(window.len());
        for chunk in window {
            let elapsed = (chunk.uploaded_at - prev).num_milliseconds() as f64 / 1000.0;
            samples.push(Sample {
                bytes: chunk.size,
                secs: elapsed.max(MIN_INTERVAL_SECS),
            });
            prev = chunk.uploaded_at;
        }
        Ok(samples)
    }
}

fn percent_round(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done as f64 / total as f64) * 100.0).round().clamp(0.0, 100.0) as u8
}

/// Compares the newer half of the window against the older half.
fn speed_trend(samples: &[Sample]) -> SpeedTrend {
    if samples.len() < 2 {
        return SpeedTrend::Stable;
    }
    let mid = samples.len() / 2;
    let mean = |s: &[Sample]| s.iter().map(Sample::speed).sum::<f64>() / s.len() as f64;
    let older = mean(&samples[..mid]);
    let newer = mean(&samples[mid..]);
    if older <= 0.0 {
        return SpeedTrend::Stable;
    }
    let ratio = newer / older;
    if ratio > 1.0 + TREND_BAND {
        SpeedTrend::Increasing
    } else if ratio < 1.0 - TREND_BAND {
        SpeedTrend::Decreasing
    } else {
        SpeedTrend::Stable
    }
}

fn classify_stability(error_rate: f64, retry_rate: f64) -> NetworkStability {
    if error_rate < 0.05 && retry_rate < 0.1 {
        NetworkStability::Excellent
    } else if error_rate < 0.15 && retry_rate < 0.3 {
        NetworkStability::Good
    } else if error_rate < 0.3 && retry_rate < 0.6 {
        NetworkStability::Fair
    } else {
        NetworkStability::Poor
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of samples.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: Vec::new(),
                max_samples: max_samples.unwrap_or(100),
                window_size: window_size.unwrap_or(Duration::from_secs(5)),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SpeedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `bytes` transferred at the current instant.
    pub fn add_sample(&self, bytes: u64) {
        let mut s = self.lock();
        let now = Instant::now();
        s.samples.push(SpeedSample {
            bytes,
            timestamp: now,
        });

        let window = s.window_size;
        s.samples
            .retain(|sample| now.duration_since(sample.timestamp) <= window);

        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Average speed in bytes/second within the window.
    ///
    /// Returns 0.0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.lock();
        let (Some(first), Some(last)) = (s.samples.first(), s.samples.last()) else {
            return 0.0;
        };
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if s.samples.len() < 2 || elapsed.is_zero() {
            return 0.0;
        }
        // The first sample marks the start of the window.
        let bytes: u64 = s.samples[1..].iter().map(|sample| sample.bytes).sum();
        bytes as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time to transfer `remaining_bytes`, or `None` while the
    /// speed is unknown.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }

    /// Clears all recorded samples.
    pub fn reset(&self) {
        self.lock().samples.clear();
    }
}
