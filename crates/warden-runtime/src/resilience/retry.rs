//! Bounded retries with backoff around a single fallible action.
//!
//! Each attempt first asks the circuit breaker (when one is attached) for
//! admission. A rejection aborts immediately without consuming an attempt.
//! Only failures whose class is in the configured transient set are
//! retried; everything else propagates at once.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use warden_core::{Failure, RetryConfig, WardenConfig};

use super::backoff;
use super::circuit_breaker::CircuitBreaker;

/// Accumulated retry counters.
///
/// Counters only grow; [`RetryExecutor::reset_stats`] is the only reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryStats {
    /// Completed `execute` calls
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// Sleeps taken between attempts
    pub retry_count: u64,
    /// Every failure seen, including ones that were retried
    pub errors_by_kind: BTreeMap<String, u64>,
}

impl RetryStats {
    fn merge(&mut self, other: &RetryStats) {
        self.total_calls += other.total_calls;
        self.successful_calls += other.successful_calls;
        self.failed_calls += other.failed_calls;
        self.retry_count += other.retry_count;
        for (kind, count) in &other.errors_by_kind {
            *self.errors_by_kind.entry(kind.clone()).or_default() += count;
        }
    }
}

/// Retries a caller-supplied action per resource policy.
pub struct RetryExecutor {
    defaults: RetryConfig,
    configs: RwLock<HashMap<String, RetryConfig>>,
    breaker: Option<Arc<CircuitBreaker>>,
    stats: Mutex<HashMap<String, RetryStats>>,
}

impl RetryExecutor {
    /// Create an executor without a circuit breaker.
    pub fn new(defaults: RetryConfig) -> Self {
        Self {
            defaults,
            configs: RwLock::new(HashMap::new()),
            breaker: None,
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// Consult `breaker` before every attempt.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Build from a config document, registering every configured resource.
    pub fn from_config(config: &WardenConfig) -> Self {
        let executor = Self::new(config.resolve_defaults().retry);
        for name in config.resource_names() {
            executor.set_config(name, config.resolve(name).retry);
        }
        executor
    }

    pub fn set_config(&self, resource: &str, config: RetryConfig) {
        self.configs.write().insert(resource.to_string(), config);
    }

    pub fn config_for(&self, resource: &str) -> RetryConfig {
        self.configs
            .read()
            .get(resource)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Whether `failure` may be retried under `config`.
    pub fn is_retryable(config: &RetryConfig, failure: &Failure) -> bool {
        failure.kind.may_retry()
            && (config.transient_errors.contains(failure.error_class())
                || config.transient_errors.contains(failure.kind.as_str()))
    }

    /// Run `action` with retries.
    ///
    /// `max_attempts` overrides the resource's configured attempt count.
    /// When attempts run out, the last failure is returned annotated with
    /// the number of attempts made.
    pub async fn execute<F, Fut, T>(
        &self,
        resource: &str,
        mut action: F,
        max_attempts: Option<u32>,
    ) -> Result<T, Failure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let config = self.config_for(resource);
        let max_attempts = max_attempts.unwrap_or(config.max_attempts).max(1);
        let backoff = backoff::from_config(&config.backoff);
        let mut attempt: u32 = 0;

        loop {
            let permit = match &self.breaker {
                Some(breaker) => match breaker.acquire(resource) {
                    Ok(permit) => Some(permit),
                    Err(rejection) => {
                        tracing::debug!(resource = %resource, attempt, "Circuit rejected attempt");
                        self.record_failure(resource, &rejection);
                        return Err(rejection);
                    }
                },
                None => None,
            };

            attempt += 1;
            match action().await {
                Ok(value) => {
                    if let Some(permit) = permit {
                        permit.success();
                    }
                    if attempt > 1 {
                        tracing::debug!(resource = %resource, attempts = attempt, "Succeeded after retry");
                    }
                    self.record_success(resource);
                    return Ok(value);
                }
                Err(failure) => {
                    if let Some(permit) = permit {
                        permit.failure();
                    }
                    self.count_error(resource, &failure);

                    if !Self::is_retryable(&config, &failure) {
                        tracing::debug!(resource = %resource, error = %failure, "Non-retryable failure");
                        self.record_outcome(resource, false);
                        return Err(Failure {
                            attempts: Some(attempt),
                            ..failure
                        });
                    }

                    if attempt >= max_attempts {
                        tracing::warn!(
                            resource = %resource,
                            attempts = attempt,
                            error = %failure,
                            "Retry attempts exhausted"
                        );
                        self.record_outcome(resource, false);
                        return Err(failure.exhausted_after(attempt));
                    }

                    let delay = backoff.delay(attempt - 1);
                    self.stats
                        .lock()
                        .entry(resource.to_string())
                        .or_default()
                        .retry_count += 1;
                    tracing::warn!(
                        resource = %resource,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn count_error(&self, resource: &str, failure: &Failure) {
        *self
            .stats
            .lock()
            .entry(resource.to_string())
            .or_default()
            .errors_by_kind
            .entry(failure.kind.as_str().to_string())
            .or_default() += 1;
    }

    fn record_failure(&self, resource: &str, failure: &Failure) {
        self.count_error(resource, failure);
        self.record_outcome(resource, false);
    }

    fn record_success(&self, resource: &str) {
        self.record_outcome(resource, true);
    }

    fn record_outcome(&self, resource: &str, success: bool) {
        let mut stats = self.stats.lock();
        let entry = stats.entry(resource.to_string()).or_default();
        entry.total_calls += 1;
        if success {
            entry.successful_calls += 1;
        } else {
            entry.failed_calls += 1;
        }
    }

    /// Counters aggregated over every resource.
    pub fn stats(&self) -> RetryStats {
        let mut total = RetryStats::default();
        for stats in self.stats.lock().values() {
            total.merge(stats);
        }
        total
    }

    /// Counters for one resource.
    pub fn stats_for(&self, resource: &str) -> RetryStats {
        self.stats.lock().get(resource).cloned().unwrap_or_default()
    }

    /// Operator reset of all counters.
    pub fn reset_stats(&self) {
        self.stats.lock().clear();
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use warden_core::{BackoffConfig, CircuitBreakerConfig, FailureKind};

    fn fixed(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            backoff: BackoffConfig::Fixed { delay_ms: 10 },
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_eventually_succeeds() {
        let executor = RetryExecutor::new(fixed(3));
        let calls = AtomicU32::new(0);

        let result = executor
            .execute(
                "r",
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Failure::transient("flaky"))
                    } else {
                        Ok("done")
                    }
                },
                None,
            )
            .await;

        assert_eq!(result.unwrap(), "done");
        let stats = executor.stats();
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.successful_calls, 1);
        assert_eq!(stats.retry_count, 2);
        assert_eq!(stats.errors_by_kind.get("transient"), Some(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_annotated() {
        let executor = RetryExecutor::new(fixed(3));
        let calls = AtomicU32::new(0);

        let err = executor
            .execute(
                "r",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Failure::transient("down"))
                },
                None,
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.exhausted);
        assert_eq!(err.attempts, Some(3));
        assert_eq!(executor.stats().failed_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_not_retried() {
        let executor = RetryExecutor::new(fixed(5));
        let calls = AtomicU32::new(0);

        let err = executor
            .execute(
                "r",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Failure::permanent("bad request"))
                },
                None,
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind, FailureKind::Permanent);
        assert!(!err.exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_set_matches_codes() {
        let mut config = fixed(2);
        config.transient_errors.insert("timeout".to_string());
        let executor = RetryExecutor::new(config.clone());

        let timeout = Failure::permanent("slow").with_code("timeout");
        assert!(!RetryExecutor::is_retryable(&config, &timeout));

        let coded = Failure::new(FailureKind::Transient, "slow").with_code("timeout");
        assert!(RetryExecutor::is_retryable(&config, &coded));

        let calls = AtomicU32::new(0);
        let _ = executor
            .execute(
                "r",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(coded.clone())
                },
                None,
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_rejection_consumes_no_attempt() {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            timeout: Duration::from_secs(60),
            ..Default::default()
        }));
        let executor = RetryExecutor::new(fixed(5)).with_breaker(breaker.clone());
        let calls = AtomicU32::new(0);

        let err = executor
            .execute(
                "r",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Failure::transient("down"))
                },
                None,
            )
            .await
            .unwrap_err();

        // Two failures open the circuit; the third attempt is rejected
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(err.kind, FailureKind::CircuitOpen);
        assert_eq!(executor.stats().errors_by_kind.get("circuit_open"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_attempts_override() {
        let executor = RetryExecutor::new(fixed(5));
        let calls = AtomicU32::new(0);
        let _ = executor
            .execute(
                "r",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Failure::transient("x"))
                },
                Some(1),
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_per_resource_and_reset() {
        let executor = RetryExecutor::new(fixed(1));
        let _ = executor.execute("a", || async { Ok::<_, Failure>(()) }, None).await;
        let _ = executor
            .execute("b", || async { Err::<(), _>(Failure::permanent("x")) }, None)
            .await;

        assert_eq!(executor.stats_for("a").successful_calls, 1);
        assert_eq!(executor.stats_for("b").failed_calls, 1);
        assert_eq!(executor.stats().total_calls, 2);

        executor.reset_stats();
        assert_eq!(executor.stats(), RetryStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_equals_success_plus_failed() {
        let executor = RetryExecutor::new(fixed(2));
        for i in 0..12u32 {
            let _ = executor
                .execute(
                    "r",
                    || async move {
                        match i % 3 {
                            0 => Ok(()),
                            1 => Err(Failure::transient("t")),
                            _ => Err(Failure::permanent("p")),
                        }
                    },
                    None,
                )
                .await;
            let stats = executor.stats();
            assert_eq!(stats.total_calls, stats.successful_calls + stats.failed_calls);
        }
    }
}
