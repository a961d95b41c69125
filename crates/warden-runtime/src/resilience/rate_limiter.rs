//! Per-resource token bucket rate limiting.
//!
//! Refill is lazy: every acquisition first credits the bucket with
//! `elapsed * refill_rate` tokens (capped at capacity), then checks and
//! subtracts the cost. Admission never suspends.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use warden_core::{Failure, RateLimitConfig, WardenConfig};

/// A single token bucket.
///
/// Invariant: `0 <= tokens <= capacity` after every operation.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(config: &RateLimitConfig, now: Instant) -> Self {
        let capacity = config.capacity as f64;
        Self {
            capacity,
            refill_rate: config.refill_rate.max(0.0),
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Credit tokens for the time elapsed since the last refill.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        self.last_refill = self.last_refill.max(now);
    }

    /// Refill, then consume `cost` tokens if available.
    pub fn try_consume(&mut self, cost: f64, now: Instant) -> bool {
        self.refill(now);
        if cost <= self.tokens {
            self.tokens = (self.tokens - cost).max(0.0);
            true
        } else {
            false
        }
    }

    /// Time until `cost` tokens will be available.
    ///
    /// `None` when the cost can never be satisfied, or the wait does not
    /// fit in a `Duration`.
    pub fn time_until(&self, cost: f64) -> Option<Duration> {
        if cost > self.capacity || self.refill_rate <= 0.0 {
            return None;
        }
        let missing = (cost - self.tokens).max(0.0);
        Duration::try_from_secs_f64(missing / self.refill_rate).ok()
    }

    /// Apply a new configuration, keeping accumulated tokens within the new cap.
    pub fn reconfigure(&mut self, config: &RateLimitConfig, now: Instant) {
        self.refill(now);
        self.capacity = config.capacity as f64;
        self.refill_rate = config.refill_rate.max(0.0);
        self.tokens = self.tokens.min(self.capacity);
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

/// Token bucket rate limiter keyed by resource.
///
/// Each resource has an independent bucket; unconfigured resources use the
/// default configuration.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    configs: RwLock<HashMap<String, RateLimitConfig>>,
    defaults: RateLimitConfig,
}

impl RateLimiter {
    /// Create a rate limiter with the given default bucket settings.
    pub fn new(defaults: RateLimitConfig) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            configs: RwLock::new(HashMap::new()),
            defaults,
        }
    }

    /// Build from a config document, registering every configured resource.
    pub fn from_config(config: &WardenConfig) -> Self {
        let limiter = Self::new(config.resolve_defaults().rate_limiter);
        for name in config.resource_names() {
            limiter.set_limit(name, config.resolve(name).rate_limiter);
        }
        limiter
    }

    /// Try to take `cost` tokens for a resource.
    ///
    /// Fails with `rate_limited`, carrying a `retry_after` hint when the
    /// cost can eventually be met. Tokens are never returned.
    pub fn try_acquire(&self, resource: &str, cost: u32) -> Result<(), Failure> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(resource.to_string())
            .or_insert_with(|| TokenBucket::new(&self.config_for(resource), now));

        if bucket.try_consume(cost as f64, now) {
            Ok(())
        } else {
            let retry_after = bucket.time_until(cost as f64);
            tracing::debug!(
                resource = %resource,
                cost,
                tokens = bucket.tokens(),
                "Rate limit exceeded"
            );
            Err(Failure::rate_limited(resource, retry_after))
        }
    }

    /// No-op: token bucket semantics do not return tokens.
    pub fn release(&self, _resource: &str) {}

    /// Tokens currently available for a resource, after refill.
    pub fn available(&self, resource: &str) -> f64 {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        match buckets.get_mut(resource) {
            Some(bucket) => {
                bucket.refill(now);
                bucket.tokens()
            }
            None => self.config_for(resource).capacity as f64,
        }
    }

    /// Configure a resource. Takes effect on the next acquisition.
    pub fn set_limit(&self, resource: &str, config: RateLimitConfig) {
        let now = Instant::now();
        if let Some(bucket) = self.buckets.lock().get_mut(resource) {
            bucket.reconfigure(&config, now);
        }
        self.configs.write().insert(resource.to_string(), config);
    }

    /// Effective configuration for a resource.
    pub fn config_for(&self, resource: &str) -> RateLimitConfig {
        self.configs
            .read()
            .get(resource)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Drop all buckets; they are recreated full on next use.
    pub fn reset(&self) {
        self.buckets.lock().clear();
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use warden_core::FailureKind;

    fn config(capacity: u32, refill_rate: f64) -> RateLimitConfig {
        RateLimitConfig {
            capacity,
            refill_rate,
            window: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_then_recovery() {
        let limiter = RateLimiter::new(config(2, 1.0));

        assert!(limiter.try_acquire("provider", 1).is_ok());
        assert!(limiter.try_acquire("provider", 1).is_ok());

        let err = limiter.try_acquire("provider", 1).unwrap_err();
        assert_eq!(err.kind, FailureKind::RateLimited);
        assert_eq!(err.retry_after, Some(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.try_acquire("provider", 1).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resources_are_independent() {
        let limiter = RateLimiter::new(config(1, 1.0));

        assert!(limiter.try_acquire("a", 1).is_ok());
        assert!(limiter.try_acquire("a", 1).is_err());
        assert!(limiter.try_acquire("b", 1).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_capped_at_capacity() {
        let limiter = RateLimiter::new(config(3, 10.0));
        assert!(limiter.try_acquire("r", 3).is_ok());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!((limiter.available("r") - 3.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cost_above_capacity_has_no_retry_hint() {
        let limiter = RateLimiter::new(config(2, 1.0));
        let err = limiter.try_acquire("r", 5).unwrap_err();
        assert_eq!(err.retry_after, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_limit_per_resource() {
        let limiter = RateLimiter::new(config(1, 1.0));
        limiter.set_limit("big", config(5, 1.0));

        for _ in 0..5 {
            assert!(limiter.try_acquire("big", 1).is_ok());
        }
        assert!(limiter.try_acquire("big", 1).is_err());
        assert_eq!(limiter.config_for("other").capacity, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanishing_refill_rate_drops_the_hint() {
        let config = WardenConfig::from_yaml(
            "defaults:\n  rate_limiter:\n    capacity: 1\n    refill_rate: 1.0e-30\n",
        )
        .unwrap();
        let limiter = RateLimiter::from_config(&config);

        assert!(limiter.try_acquire("r", 1).is_ok());
        let err = limiter.try_acquire("r", 1).unwrap_err();
        assert_eq!(err.kind, FailureKind::RateLimited);
        assert_eq!(err.retry_after, None);
    }

    #[test]
    fn test_release_is_noop() {
        let limiter = RateLimiter::new(config(1, 0.001));
        assert!(limiter.try_acquire("r", 1).is_ok());
        limiter.release("r");
        assert!(limiter.try_acquire("r", 1).is_err());
    }

    proptest! {
        #[test]
        fn prop_tokens_stay_within_bounds(
            capacity in 1u32..50,
            refill_rate in 0.0f64..20.0,
            steps in prop::collection::vec((0u64..3000, 0u32..10), 1..60),
        ) {
            let cfg = config(capacity, refill_rate);
            let mut now = Instant::now();
            let mut bucket = TokenBucket::new(&cfg, now);

            for (advance_ms, cost) in steps {
                now += Duration::from_millis(advance_ms);
                let before = bucket.tokens();
                let admitted = bucket.try_consume(cost as f64, now);

                prop_assert!(bucket.tokens() >= 0.0);
                prop_assert!(bucket.tokens() <= bucket.capacity());
                if !admitted {
                    prop_assert!(bucket.tokens() + 1e-9 >= before.min(bucket.capacity()));
                }
            }
        }
    }
}
