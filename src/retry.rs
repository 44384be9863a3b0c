//! Adaptive retry around idempotent remote calls.
//!
//! The executor classifies failures (see [`ErrorClass`]) and applies a
//! class-specific backoff: exponential with jitter for quota errors, a fast
//! fixed ladder for transient network failures, a moderate ladder for the
//! rest. Fatal errors are surfaced immediately. Counters accumulate across
//! calls and a summary is logged after every top-level operation; these are
//! the signals used to spot provider degradation.

use crate::budget::ApiProvider;
use crate::defaults;
use crate::error::{ErrorClass, Result, ScrivanoError};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Backoff parameters, split by error class.
///
/// Defaults match production tuning; tests substitute scaled-down values.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub quota_base: Duration,
    pub quota_cap: Duration,
    pub quota_max_attempts: u32,
    pub network_delays: Vec<Duration>,
    pub other_delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            quota_base: defaults::QUOTA_BACKOFF_BASE,
            quota_cap: defaults::QUOTA_BACKOFF_CAP,
            quota_max_attempts: defaults::QUOTA_MAX_ATTEMPTS,
            network_delays: vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
            ],
            other_delays: vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
            ],
        }
    }
}

impl RetryPolicy {
    /// Scaled-down policy for tests: same shape, millisecond magnitudes.
    pub fn fast() -> Self {
        Self {
            quota_base: Duration::from_millis(10),
            quota_cap: Duration::from_millis(300),
            quota_max_attempts: defaults::QUOTA_MAX_ATTEMPTS,
            network_delays: vec![
                Duration::from_millis(5),
                Duration::from_millis(10),
                Duration::from_millis(20),
            ],
            other_delays: vec![
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(80),
            ],
        }
    }

    /// Attempts allowed for one error class before giving up.
    pub fn max_attempts(&self, class: ErrorClass) -> u32 {
        match class {
            ErrorClass::RateLimited => self.quota_max_attempts,
            ErrorClass::TransientNetwork => self.network_delays.len() as u32,
            ErrorClass::Other => self.other_delays.len() as u32,
            ErrorClass::Fatal => 0,
        }
    }

    /// Wait before retry number `k` (0-based) of the given class.
    ///
    /// Quota waits are `min(base * 2^k, cap)` plus uniform jitter in
    /// `[0, base)`; the fixed ladders repeat their last rung if `k` runs
    /// past the end.
    pub fn delay_for(&self, class: ErrorClass, k: u32) -> Duration {
        match class {
            ErrorClass::RateLimited => {
                let exp = self.quota_base.saturating_mul(1u32 << k.min(16));
                let capped = exp.min(self.quota_cap);
                let jitter = rand::rng().random_range(0.0..1.0);
                capped + self.quota_base.mul_f64(jitter)
            }
            ErrorClass::TransientNetwork => ladder(&self.network_delays, k),
            ErrorClass::Other => ladder(&self.other_delays, k),
            ErrorClass::Fatal => Duration::ZERO,
        }
    }
}

fn ladder(delays: &[Duration], k: u32) -> Duration {
    delays
        .get(k as usize)
        .or(delays.last())
        .copied()
        .unwrap_or(Duration::ZERO)
}

/// Cumulative retry counters, exposed for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    pub attempts_total: u64,
    pub rate_limited_retries: u64,
    pub transient_retries: u64,
    pub other_retries: u64,
    pub retry_wait_total: Duration,
}

#[derive(Default)]
struct Counters {
    attempts_total: AtomicU64,
    rate_limited: AtomicU64,
    transient: AtomicU64,
    other: AtomicU64,
    wait_micros: AtomicU64,
}

/// Wraps idempotent remote calls with classification and backoff.
///
/// All calls in the provider layer are either idempotent by design or
/// tolerant of duplicate submission (the providers deduplicate by payload
/// hash or return the same job id).
pub struct RetryExecutor {
    policy: RetryPolicy,
    cancel: CancellationToken,
    counters: Counters,
}

impl RetryExecutor {
    pub fn new(cancel: CancellationToken) -> Self {
        Self::with_policy(RetryPolicy::default(), cancel)
    }

    pub fn with_policy(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            policy,
            cancel,
            counters: Counters::default(),
        }
    }

    /// Runs `call`, retrying per class until success, exhaustion or a fatal
    /// error. Backoff waits abort early on cancellation.
    pub async fn run<T, F, Fut>(
        &self,
        provider: ApiProvider,
        operation: &str,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // Attempts used per retryable class: [rate_limited, transient, other]
        let mut used = [0u32; 3];
        let mut attempts = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Err(ScrivanoError::Cancelled);
            }

            attempts += 1;
            self.counters.attempts_total.fetch_add(1, Ordering::Relaxed);

            let error = match call().await {
                Ok(value) => {
                    self.log_summary(provider, operation, attempts, true);
                    return Ok(value);
                }
                Err(e) => e,
            };

            let class = error.class();
            if class == ErrorClass::Fatal {
                self.log_summary(provider, operation, attempts, false);
                return Err(error);
            }

            let slot = match class {
                ErrorClass::RateLimited => 0,
                ErrorClass::TransientNetwork => 1,
                _ => 2,
            };
            let k = used[slot];
            used[slot] += 1;

            if used[slot] >= self.policy.max_attempts(class) {
                tracing::warn!(
                    provider = provider.label(),
                    operation,
                    class = class.label(),
                    attempts = used[slot],
                    "retries exhausted"
                );
                self.log_summary(provider, operation, attempts, false);
                return Err(error);
            }

            let delay = self.policy.delay_for(class, k);
            self.record_retry(class, delay);
            tracing::warn!(
                provider = provider.label(),
                operation,
                class = class.label(),
                retry = k + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying after failure"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => return Err(ScrivanoError::Cancelled),
            }
        }
    }

    fn record_retry(&self, class: ErrorClass, delay: Duration) {
        let counter = match class {
            ErrorClass::RateLimited => &self.counters.rate_limited,
            ErrorClass::TransientNetwork => &self.counters.transient,
            _ => &self.counters.other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.counters
            .wait_micros
            .fetch_add(delay.as_micros() as u64, Ordering::Relaxed);
    }

    fn log_summary(&self, provider: ApiProvider, operation: &str, attempts: u32, ok: bool) {
        let stats = self.statistics();
        tracing::info!(
            provider = provider.label(),
            operation,
            attempts,
            ok,
            attempts_total = stats.attempts_total,
            rate_limited_retries = stats.rate_limited_retries,
            transient_retries = stats.transient_retries,
            other_retries = stats.other_retries,
            retry_wait_total_seconds = stats.retry_wait_total.as_secs_f64(),
            "call finished"
        );
    }

    /// Snapshot of the cumulative counters.
    pub fn statistics(&self) -> RetryStats {
        RetryStats {
            attempts_total: self.counters.attempts_total.load(Ordering::Relaxed),
            rate_limited_retries: self.counters.rate_limited.load(Ordering::Relaxed),
            transient_retries: self.counters.transient.load(Ordering::Relaxed),
            other_retries: self.counters.other.load(Ordering::Relaxed),
            retry_wait_total: Duration::from_micros(
                self.counters.wait_micros.load(Ordering::Relaxed),
            ),
        }
    }
}

/// Adaptive per-call timeout for transcription uploads: 60s plus 10s per
/// megabyte, capped at 600s.
pub fn transcription_timeout(file_bytes: u64) -> Duration {
    let mb = file_bytes as f64 / (1024.0 * 1024.0);
    let adaptive =
        defaults::TRANSCRIPTION_TIMEOUT_BASE + defaults::TRANSCRIPTION_TIMEOUT_PER_MB.mul_f64(mb);
    adaptive.min(defaults::TRANSCRIPTION_TIMEOUT_CAP)
}

/// Fixed timeout for all non-transcription provider calls.
pub fn default_call_timeout() -> Duration {
    defaults::DEFAULT_CALL_TIMEOUT
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_quota_delay_ranges_match_contract() {
        let policy = RetryPolicy::default();
        // wait_k = base * 2^k + U(0, base) with base = 1s
        for (k, low, high) in [(0u32, 1.0, 2.0), (1, 2.0, 3.0), (2, 4.0, 5.0)] {
            for _ in 0..20 {
                let d = policy.delay_for(ErrorClass::RateLimited, k).as_secs_f64();
                assert!(d >= low && d < high, "k={k} delay={d}");
            }
        }
    }

    #[test]
    fn test_quota_delay_caps_at_thirty_plus_jitter() {
        let policy = RetryPolicy::default();
        for _ in 0..20 {
            let d = policy.delay_for(ErrorClass::RateLimited, 7).as_secs_f64();
            assert!((30.0..31.0).contains(&d), "delay={d}");
        }
    }

    #[test]
    fn test_network_ladder() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for(ErrorClass::TransientNetwork, 0),
            Duration::from_millis(500)
        );
        assert_eq!(
            policy.delay_for(ErrorClass::TransientNetwork, 1),
            Duration::from_secs(1)
        );
        assert_eq!(
            policy.delay_for(ErrorClass::TransientNetwork, 2),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_other_ladder() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(ErrorClass::Other, 0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(ErrorClass::Other, 1), Duration::from_secs(4));
        assert_eq!(policy.delay_for(ErrorClass::Other, 2), Duration::from_secs(8));
    }

    #[test]
    fn test_max_attempts_per_class() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(ErrorClass::RateLimited), 8);
        assert_eq!(policy.max_attempts(ErrorClass::TransientNetwork), 3);
        assert_eq!(policy.max_attempts(ErrorClass::Other), 3);
        assert_eq!(policy.max_attempts(ErrorClass::Fatal), 0);
    }

    #[tokio::test]
    async fn test_succeeds_after_rate_limit_retries() {
        let executor =
            RetryExecutor::with_policy(RetryPolicy::fast(), CancellationToken::new());
        let calls = Arc::new(AtomicU32::new(0));

        let calls_ref = calls.clone();
        let result = executor
            .run(ApiProvider::Diarization, "diarize", move || {
                let calls = calls_ref.clone();
                async move {
                    // First three calls are throttled, fourth succeeds
                    if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(ScrivanoError::RateLimited {
                            provider: "diarization".to_string(),
                        })
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let stats = executor.statistics();
        assert_eq!(stats.attempts_total, 4);
        assert_eq!(stats.rate_limited_retries, 3);
        assert!(stats.retry_wait_total > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let executor =
            RetryExecutor::with_policy(RetryPolicy::fast(), CancellationToken::new());
        let calls = Arc::new(AtomicU32::new(0));

        let calls_ref = calls.clone();
        let result: Result<()> = executor
            .run(ApiProvider::Diarization, "diarize", move || {
                let calls = calls_ref.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ScrivanoError::Auth {
                        provider: "diarization".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(ScrivanoError::Auth { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_retries_exhaust_after_three_attempts() {
        let executor =
            RetryExecutor::with_policy(RetryPolicy::fast(), CancellationToken::new());
        let calls = Arc::new(AtomicU32::new(0));

        let calls_ref = calls.clone();
        let result: Result<()> = executor
            .run(ApiProvider::Transcription, "transcribe", move || {
                let calls = calls_ref.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ScrivanoError::TransientNetwork {
                        message: "connection reset".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(ScrivanoError::TransientNetwork { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_backoff() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            // Long quota waits so cancellation lands inside the sleep
            quota_base: Duration::from_secs(5),
            ..RetryPolicy::fast()
        };
        let executor = Arc::new(RetryExecutor::with_policy(policy, cancel.clone()));

        let executor_ref = executor.clone();
        let task = tokio::spawn(async move {
            executor_ref
                .run(ApiProvider::Diarization, "diarize", || async {
                    Err::<(), _>(ScrivanoError::RateLimited {
                        provider: "diarization".to_string(),
                    })
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(ScrivanoError::Cancelled)));
    }

    #[test]
    fn test_adaptive_transcription_timeout() {
        assert_eq!(transcription_timeout(0), Duration::from_secs(60));
        assert_eq!(
            transcription_timeout(10 * 1024 * 1024),
            Duration::from_secs(160)
        );
        // Large files hit the cap
        assert_eq!(
            transcription_timeout(200 * 1024 * 1024),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn test_default_call_timeout() {
        assert_eq!(default_call_timeout(), Duration::from_secs(300));
    }
}
