//! Composition of the four leaf components around one action.
//!
//! Order is fixed: rate limiter, bulkhead, circuit breaker, then the retry
//! loop. Cheap rejections happen before a bulkhead slot is held.

use std::future::Future;
use std::sync::Arc;
use warden_core::{Failure, WardenConfig};

use super::bulkhead::Bulkhead;
use super::circuit_breaker::CircuitBreaker;
use super::rate_limiter::RateLimiter;
use super::retry::RetryExecutor;

/// Guards outbound calls to unreliable resources.
pub struct ReliabilityPipeline {
    rate_limiter: Arc<RateLimiter>,
    bulkhead: Arc<Bulkhead>,
    circuit_breaker: Arc<CircuitBreaker>,
    retry: RetryExecutor,
}

impl ReliabilityPipeline {
    /// Assemble a pipeline from existing components.
    ///
    /// The retry executor is bound to `circuit_breaker` so every attempt is
    /// admitted by the same circuit.
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        bulkhead: Arc<Bulkhead>,
        circuit_breaker: Arc<CircuitBreaker>,
        retry: RetryExecutor,
    ) -> Self {
        let retry = retry.with_breaker(circuit_breaker.clone());
        Self {
            rate_limiter,
            bulkhead,
            circuit_breaker,
            retry,
        }
    }

    /// Build every component from one config document.
    pub fn from_config(config: &WardenConfig) -> Self {
        Self::new(
            Arc::new(RateLimiter::from_config(config)),
            Arc::new(Bulkhead::from_config(config)),
            Arc::new(CircuitBreaker::from_config(config)),
            RetryExecutor::from_config(config),
        )
    }

    /// Run `action` for `resource` behind every protection layer.
    ///
    /// Rate limiting fails fast with a `retry_after` hint instead of
    /// waiting for refill; re-entering later is up to the caller.
    pub async fn execute<F, Fut, T>(&self, resource: &str, action: F) -> Result<T, Failure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        self.rate_limiter.try_acquire(resource, 1)?;

        let _slot = self.bulkhead.acquire(resource, None).await?;

        self.circuit_breaker.check(resource)?;

        let result = self.retry.execute(resource, action, None).await;
        if let Err(failure) = &result {
            tracing::debug!(resource = %resource, kind = %failure.kind, "Pipeline call failed");
        }
        result
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn bulkhead(&self) -> &Bulkhead {
        &self.bulkhead
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }
}

impl Default for ReliabilityPipeline {
    fn default() -> Self {
        Self::from_config(&WardenConfig::default())
    }
}

impl std::fmt::Debug for ReliabilityPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliabilityPipeline")
            .field("bulkhead", &self.bulkhead)
            .finish_non_exhaustive()
    }
}
