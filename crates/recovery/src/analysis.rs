use std::collections::BTreeMap;

use chrono::{Duration, Timelike, Utc};
use tracing::debug;

use chunkline_protocol::messages::{FailurePattern, RecoveryStrategy, RecoveryTime, RiskLevel};
use chunkline_protocol::{FailureKind, UploadId};
use chunkline_store::{RetryLogRepo, StatsRepo};

use crate::engine::RecoveryEngine;
use crate::error::RecoveryResult;

/// Expected recovery cost of one failed attempt.
const SECS_PER_FAILURE: u64 = 30;

/// Load above which recovery is deferred.
const HIGH_LOAD: f64 = 0.8;
const HIGH_LOAD_WAIT_MINS: i64 = 15;

/// Hourly success rate below which recovery is deferred.
const LOW_SUCCESS_RATE: f64 = 0.5;
const LOW_SUCCESS_WAIT_MINS: i64 = 60;

/// Attempts needed before the hour-of-day rate is trusted.
const MIN_HOURLY_SAMPLES: u64 = 10;
const HOURLY_LOOKBACK_DAYS: i64 = 7;

impl RecoveryEngine {
    /// Groups the failed attempts of an upload by kind and recommends a
    /// strategy.
    pub async fn analyze_failure_pattern(
        &self,
        upload_id: UploadId,
    ) -> RecoveryResult<FailurePattern> {
        let entries = self.store.list_retries(upload_id).await?;

        let mut failure_types: BTreeMap<FailureKind, u32> = BTreeMap::new();
        for entry in entries.iter().filter(|e| !e.success) {
            *failure_types
                .entry(entry.error_type.unwrap_or(FailureKind::Unknown))
                .or_default() += 1;
        }
        let total_failures: u32 = failure_types.values().sum();

        let primary = failure_types
            .iter()
            .max_by_key(|(kind, count)| (**count, kind.severity()))
            .map(|(kind, _)| *kind);

        let recommended_strategy = match primary {
            None => RecoveryStrategy::StandardRetry,
            Some(FailureKind::NetworkTimeout) => {
                RecoveryStrategy::ExponentialBackoffWithCircuitBreaker
            }
            Some(FailureKind::ServerError) => RecoveryStrategy::LinearBackoffWithJitter,
            Some(_) => RecoveryStrategy::ExponentialBackoff,
        };

        let primary_count = primary
            .and_then(|k| failure_types.get(&k).copied())
            .unwrap_or(0);
        let risk_level = if total_failures >= 10
            || (primary == Some(FailureKind::ServerError) && primary_count >= 5)
        {
            RiskLevel::High
        } else if total_failures >= 3 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        debug!(
            upload = %upload_id,
            failures = total_failures,
            ?primary,
            ?risk_level,
            "failure pattern"
        );

        Ok(FailurePattern {
            upload_id,
            total_failures,
            failure_types,
            primary_failure_type: primary,
            recommended_strategy,
            risk_level,
            estimated_recovery_time_secs: u64::from(total_failures) * SECS_PER_FAILURE,
        })
    }

    /// Recommends recovering now or later, from current load and the
    /// historical success rate at this hour of day.
    pub async fn get_optimal_recovery_time(
        &self,
        upload_id: UploadId,
    ) -> RecoveryResult<RecoveryTime> {
        self.load_session(upload_id).await?;
        let now = Utc::now();

        let active = self.store.active_session_count().await?;
        let current_load = active as f64 / self.config.capacity.max(1) as f64;

        let hourly = self
            .store
            .attempt_stats_for_hour(now.hour(), now - Duration::days(HOURLY_LOOKBACK_DAYS))
            .await?;
        let hourly_rate = (hourly.attempts >= MIN_HOURLY_SAMPLES)
            .then(|| hourly.success_rate())
            .flatten();

        let success_rate = match hourly_rate {
            Some(rate) => rate,
            None => self
                .store
                .attempt_stats_since(now - Duration::hours(24))
                .await?
                .success_rate()
                .unwrap_or(1.0),
        };

        let (wait_mins, wait_reason) = if current_load > HIGH_LOAD {
            (
                HIGH_LOAD_WAIT_MINS,
                Some(format!(
                    "system load is high ({:.0}% of capacity)",
                    current_load * 100.0
                )),
            )
        } else if hourly_rate.is_some_and(|r| r < LOW_SUCCESS_RATE) {
            (
                LOW_SUCCESS_WAIT_MINS,
                Some(format!(
                    "success rate at this hour is low ({:.0}%)",
                    success_rate * 100.0
                )),
            )
        } else {
            (0, None)
        };

        Ok(RecoveryTime {
            upload_id,
            recommended_time: now + Duration::minutes(wait_mins),
            should_wait: wait_reason.is_some(),
            wait_reason,
            current_load,
            success_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use chunkline_protocol::RetryLogEntry;

    use super::*;
    use crate::engine::RecoveryConfig;
    use crate::engine::testing::{Harness, fast_config};

    async fn log(h: &Harness, id: UploadId, success: bool, kind: Option<FailureKind>, n: u32) {
        for i in 0..n {
            h.store
                .append_retry(&RetryLogEntry {
                    upload_id: id,
                    chunk_number: 1,
                    attempt_number: i + 1,
                    success,
                    error_type: kind,
                    error_message: None,
                    occurred_at: Utc::now(),
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn no_failures_means_standard_retry() {
        let h = Harness::new();
        let s = h.session(2).await;
        log(&h, s.id, true, None, 2).await;

        let p = h.engine(fast_config()).analyze_failure_pattern(s.id).await.unwrap();
        assert_eq!(p.total_failures, 0);
        assert_eq!(p.primary_failure_type, None);
        assert_eq!(p.recommended_strategy, RecoveryStrategy::StandardRetry);
        assert_eq!(p.risk_level, RiskLevel::Low);
        assert_eq!(p.estimated_recovery_time_secs, 0);
    }

    #[tokio::test]
    async fn timeouts_call_for_circuit_breaker() {
        let h = Harness::new();
        let s = h.session(2).await;
        log(&h, s.id, false, Some(FailureKind::NetworkTimeout), 3).await;
        log(&h, s.id, false, Some(FailureKind::ServerError), 1).await;
        log(&h, s.id, false, None, 1).await;

        let p = h.engine(fast_config()).analyze_failure_pattern(s.id).await.unwrap();
        assert_eq!(p.total_failures, 5);
        assert_eq!(p.failure_types[&FailureKind::NetworkTimeout], 3);
        assert_eq!(p.failure_types[&FailureKind::Unknown], 1);
        assert_eq!(p.primary_failure_type, Some(FailureKind::NetworkTimeout));
        assert_eq!(
            p.recommended_strategy,
            RecoveryStrategy::ExponentialBackoffWithCircuitBreaker
        );
        assert_eq!(p.risk_level, RiskLevel::Medium);
        assert_eq!(p.estimated_recovery_time_secs, 150);
    }

    #[tokio::test]
    async fn repeated_server_errors_are_high_risk() {
        let h = Harness::new();
        let s = h.session(2).await;
        log(&h, s.id, false, Some(FailureKind::ServerError), 5).await;

        let p = h.engine(fast_config()).analyze_failure_pattern(s.id).await.unwrap();
        assert_eq!(p.recommended_strategy, RecoveryStrategy::LinearBackoffWithJitter);
        assert_eq!(p.risk_level, RiskLevel::High);
    }

    #[tokio::test]
    async fn ties_break_on_severity() {
        let h = Harness::new();
        let s = h.session(2).await;
        log(&h, s.id, false, Some(FailureKind::ChecksumMismatch), 2).await;
        log(&h, s.id, false, Some(FailureKind::StorageError), 2).await;

        let p = h.engine(fast_config()).analyze_failure_pattern(s.id).await.unwrap();
        assert_eq!(p.primary_failure_type, Some(FailureKind::StorageError));
        assert_eq!(p.recommended_strategy, RecoveryStrategy::ExponentialBackoff);
    }

    #[tokio::test]
    async fn idle_system_recovers_now() {
        let h = Harness::new();
        let s = h.session(2).await;

        let t = h.engine(fast_config()).get_optimal_recovery_time(s.id).await.unwrap();
        assert!(!t.should_wait);
        assert!(t.wait_reason.is_none());
        assert_eq!(t.success_rate, 1.0);
        assert!((t.current_load - 0.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn high_load_defers_recovery() {
        let h = Harness::new();
        let s = h.session(1).await;
        for _ in 0..4 {
            h.session(1).await;
        }
        let config = RecoveryConfig {
            capacity: 5,
            ..fast_config()
        };

        let t = h.engine(config).get_optimal_recovery_time(s.id).await.unwrap();
        assert!(t.should_wait);
        assert!(t.wait_reason.unwrap().contains("load"));
        assert!(t.recommended_time > Utc::now() + Duration::minutes(14));
    }

    #[tokio::test]
    async fn poor_hourly_success_defers_recovery() {
        let h = Harness::new();
        let s = h.session(1).await;
        log(&h, s.id, false, Some(FailureKind::NetworkTimeout), 8).await;
        log(&h, s.id, true, None, 4).await;

        let t = h.engine(fast_config()).get_optimal_recovery_time(s.id).await.unwrap();
        assert!(t.should_wait);
        assert!((t.success_rate - 4.0 / 12.0).abs() < 1e-9);
        assert!(t.recommended_time > Utc::now() + Duration::minutes(59));
    }

    #[tokio::test]
    async fn few_samples_do_not_defer() {
        let h = Harness::new();
        let s = h.session(1).await;
        log(&h, s.id, false, Some(FailureKind::NetworkTimeout), 3).await;

        let t = h.engine(fast_config()).get_optimal_recovery_time(s.id).await.unwrap();
        assert!(!t.should_wait);
        assert_eq!(t.success_rate, 0.0);
    }
}
