//! Configuration surface for warden.
//!
//! A [`WardenConfig`] holds global defaults plus per-resource overrides for
//! the four reliability components, and the workflow budget. Every field is
//! optional; [`WardenConfig::resolve`] layers built-in defaults, then the
//! `defaults` section, then the resource's own section.

mod parser;
mod schema;

pub use parser::ConfigError;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::names::is_valid_resource_key;
use crate::workflow::WorkflowConfig;

/// Serialize a `Duration` as fractional seconds.
pub(crate) mod duration_secs_f64 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        super::seconds(secs).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "duration must be between 0 and {} seconds",
                super::MAX_SECONDS
            ))
        })
    }
}

/// Upper bound for any duration given in seconds (about 31 years).
pub const MAX_SECONDS: f64 = 1e9;

/// Convert a seconds value from config, rejecting negative, non-finite and
/// out-of-range values.
fn seconds(secs: f64) -> Option<Duration> {
    if !(0.0..=MAX_SECONDS).contains(&secs) {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

/// Token bucket settings for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum tokens held by the bucket
    pub capacity: u32,

    /// Tokens added per second
    pub refill_rate: f64,

    /// Window the capacity is expressed over
    #[serde(with = "duration_secs_f64")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_rate: 10.0,
            window: Duration::from_secs(1),
        }
    }
}

/// Circuit breaker settings for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures in CLOSED before opening
    pub failure_threshold: u32,

    /// Probes admitted in HALF_OPEN, and consecutive probe failures that reopen
    pub half_open_threshold: u32,

    /// Time spent OPEN before a probe is allowed
    #[serde(with = "duration_secs_f64")]
    pub timeout: Duration,

    /// CLOSED failures older than this are forgotten
    #[serde(with = "duration_secs_f64")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            half_open_threshold: 1,
            timeout: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(300),
        }
    }
}

/// Bulkhead settings for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkheadConfig {
    /// Maximum concurrent calls
    pub limit: u32,

    /// How long to wait for a slot; zero fails fast
    #[serde(with = "duration_secs_f64")]
    pub timeout: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Constant delay
    Fixed { delay_ms: u64 },

    /// `min(base_delay_ms * (n + 1), max_delay_ms)`
    Linear { base_delay_ms: u64, max_delay_ms: u64 },

    /// `min(base_delay_ms * base^n, max_delay_ms)` plus optional jitter
    Exponential {
        base_delay_ms: u64,
        max_delay_ms: u64,
        #[serde(default = "default_exponential_base")]
        base: f64,
        #[serde(default)]
        jitter: bool,
    },
}

fn default_exponential_base() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Exponential {
            base_delay_ms: 100,
            max_delay_ms: 5000,
            base: 2.0,
            jitter: true,
        }
    }
}

/// Retry settings for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,

    /// Delay between attempts
    pub backoff: BackoffConfig,

    /// Error classes that may be retried
    pub transient_errors: BTreeSet<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffConfig::default(),
            transient_errors: ["transient".to_string()].into_iter().collect(),
        }
    }
}

/// Fully resolved settings for a single resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSettings {
    pub rate_limiter: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub bulkhead: BulkheadConfig,
    pub retry: RetryConfig,
}

/// Partial rate limiter section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitOverrides {
    pub capacity: Option<u32>,
    pub refill_rate: Option<f64>,
    pub window_seconds: Option<f64>,
}

/// Partial circuit breaker section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerOverrides {
    pub failure_threshold: Option<u32>,
    pub half_open_threshold: Option<u32>,
    pub timeout_seconds: Option<f64>,
    pub reset_timeout_seconds: Option<f64>,
}

/// Partial bulkhead section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BulkheadOverrides {
    pub limit: Option<u32>,
    pub timeout_seconds: Option<f64>,
}

/// Partial retry section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryOverrides {
    pub max_attempts: Option<u32>,
    pub backoff: Option<BackoffConfig>,
    pub transient_errors: Option<BTreeSet<String>>,
}

/// Per-resource (or default) overrides; any section may be omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceOverrides {
    #[serde(default)]
    pub rate_limiter: RateLimitOverrides,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerOverrides,
    #[serde(default)]
    pub bulkhead: BulkheadOverrides,
    #[serde(default)]
    pub retry: RetryOverrides,
}

/// Top-level warden configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WardenConfig {
    /// Applied to every resource
    #[serde(default)]
    pub defaults: ResourceOverrides,

    /// Keyed by resource name
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceOverrides>,

    /// Workflow budgets and stagnation thresholds
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

impl WardenConfig {
    /// Resolve the effective settings for a resource.
    ///
    /// Unconfigured resources get the global defaults. Out-of-range
    /// durations are skipped here and reported by [`validate`](Self::validate).
    pub fn resolve(&self, resource: &str) -> ResourceSettings {
        let layers: Vec<&ResourceOverrides> = std::iter::once(&self.defaults)
            .chain(self.resources.get(resource))
            .collect();

        let mut settings = ResourceSettings::default();
        let mut refill_rate = None;
        for layer in &layers {
            let rl = &layer.rate_limiter;
            if let Some(capacity) = rl.capacity {
                settings.rate_limiter.capacity = capacity;
            }
            if let Some(window) = rl.window_seconds.and_then(seconds) {
                settings.rate_limiter.window = window;
            }
            if rl.refill_rate.is_some() {
                refill_rate = rl.refill_rate;
            }

            let cb = &layer.circuit_breaker;
            if let Some(v) = cb.failure_threshold {
                settings.circuit_breaker.failure_threshold = v;
            }
            if let Some(v) = cb.half_open_threshold {
                settings.circuit_breaker.half_open_threshold = v;
            }
            if let Some(v) = cb.timeout_seconds.and_then(seconds) {
                settings.circuit_breaker.timeout = v;
            }
            if let Some(v) = cb.reset_timeout_seconds.and_then(seconds) {
                settings.circuit_breaker.reset_timeout = v;
            }

            let bh = &layer.bulkhead;
            if let Some(v) = bh.limit {
                settings.bulkhead.limit = v;
            }
            if let Some(v) = bh.timeout_seconds.and_then(seconds) {
                settings.bulkhead.timeout = v;
            }

            let retry = &layer.retry;
            if let Some(v) = retry.max_attempts {
                settings.retry.max_attempts = v;
            }
            if let Some(v) = &retry.backoff {
                settings.retry.backoff = v.clone();
            }
            if let Some(v) = &retry.transient_errors {
                settings.retry.transient_errors = v.clone();
            }
        }

        // Capacity per window unless a rate is given explicitly
        settings.rate_limiter.refill_rate = refill_rate.unwrap_or_else(|| {
            let window = settings.rate_limiter.window.as_secs_f64();
            if window > 0.0 {
                settings.rate_limiter.capacity as f64 / window
            } else {
                settings.rate_limiter.capacity as f64
            }
        });

        settings
    }

    /// Names of all explicitly configured resources.
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.keys().map(|k| k.as_str()).collect()
    }

    /// Semantic validation beyond the JSON schema.
    ///
    /// Returns every problem found rather than stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        for key in self.resources.keys() {
            if !is_valid_resource_key(key) {
                problems.push(format!("invalid resource key '{}'", key));
            }
        }

        check_durations("defaults", &self.defaults, &mut problems);
        for (key, overrides) in &self.resources {
            check_durations(&format!("resources.{}", key), overrides, &mut problems);
        }

        let mut scopes = vec![("defaults".to_string(), self.resolve_defaults())];
        for key in self.resources.keys() {
            scopes.push((format!("resources.{}", key), self.resolve(key)));
        }

        for (scope, settings) in &scopes {
            check_settings(scope, settings, &mut problems);
        }

        if let Err(mut workflow_problems) = self.workflow.validate() {
            problems.append(&mut workflow_problems);
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    /// Settings applied to resources without their own section.
    pub fn resolve_defaults(&self) -> ResourceSettings {
        WardenConfig {
            defaults: self.defaults.clone(),
            ..Default::default()
        }
        .resolve("")
    }
}

fn check_durations(scope: &str, overrides: &ResourceOverrides, problems: &mut Vec<String>) {
    let fields = [
        ("rate_limiter.window_seconds", overrides.rate_limiter.window_seconds),
        ("circuit_breaker.timeout_seconds", overrides.circuit_breaker.timeout_seconds),
        ("circuit_breaker.reset_timeout_seconds", overrides.circuit_breaker.reset_timeout_seconds),
        ("bulkhead.timeout_seconds", overrides.bulkhead.timeout_seconds),
    ];
    for (field, value) in fields {
        if let Some(v) = value {
            if seconds(v).is_none() {
                problems.push(format!(
                    "{}: {} ({}) must be between 0 and {} seconds",
                    scope, field, v, MAX_SECONDS
                ));
            }
        }
    }
}

fn check_settings(scope: &str, settings: &ResourceSettings, problems: &mut Vec<String>) {
    let rl = &settings.rate_limiter;
    if rl.capacity == 0 {
        problems.push(format!("{}: rate_limiter.capacity must be positive", scope));
    }
    if !(rl.refill_rate.is_finite() && rl.refill_rate > 0.0) {
        problems.push(format!("{}: rate_limiter.refill_rate must be positive", scope));
    }
    if rl.window.is_zero() {
        problems.push(format!("{}: rate_limiter.window_seconds must be positive", scope));
    }

    let cb = &settings.circuit_breaker;
    if cb.failure_threshold == 0 {
        problems.push(format!("{}: circuit_breaker.failure_threshold must be positive", scope));
    }
    if cb.half_open_threshold == 0 {
        problems.push(format!("{}: circuit_breaker.half_open_threshold must be positive", scope));
    }

    if settings.bulkhead.limit == 0 {
        problems.push(format!("{}: bulkhead.limit must be positive", scope));
    }

    let retry = &settings.retry;
    if retry.max_attempts == 0 {
        problems.push(format!("{}: retry.max_attempts must be at least 1", scope));
    }
    match &retry.backoff {
        BackoffConfig::Fixed { .. } => {}
        BackoffConfig::Linear { base_delay_ms, max_delay_ms }
        | BackoffConfig::Exponential { base_delay_ms, max_delay_ms, .. } => {
            if max_delay_ms < base_delay_ms {
                problems.push(format!(
                    "{}: retry.backoff.max_delay_ms ({}) is below base_delay_ms ({})",
                    scope, max_delay_ms, base_delay_ms
                ));
            }
        }
    }
    if let BackoffConfig::Exponential { base, .. } = &retry.backoff {
        if !(base.is_finite() && *base >= 1.0) {
            problems.push(format!("{}: retry.backoff.base must be >= 1", scope));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_resource_gets_defaults() {
        let config = WardenConfig::default();
        let settings = config.resolve("anything");
        assert_eq!(settings, ResourceSettings::default());
        assert_eq!(settings.rate_limiter.refill_rate, 10.0);
    }

    #[test]
    fn test_resource_overrides_layer_over_defaults() {
        let mut config = WardenConfig::default();
        config.defaults.bulkhead.limit = Some(4);
        config.defaults.circuit_breaker.failure_threshold = Some(7);
        config.resources.insert(
            "anthropic".to_string(),
            ResourceOverrides {
                bulkhead: BulkheadOverrides {
                    limit: Some(2),
                    timeout_seconds: None,
                },
                ..Default::default()
            },
        );

        let settings = config.resolve("anthropic");
        assert_eq!(settings.bulkhead.limit, 2);
        assert_eq!(settings.circuit_breaker.failure_threshold, 7);

        let other = config.resolve("openai");
        assert_eq!(other.bulkhead.limit, 4);
    }

    #[test]
    fn test_refill_rate_derived_from_window() {
        let mut config = WardenConfig::default();
        config.defaults.rate_limiter = RateLimitOverrides {
            capacity: Some(60),
            refill_rate: None,
            window_seconds: Some(60.0),
        };
        let settings = config.resolve("x");
        assert!((settings.rate_limiter.refill_rate - 1.0).abs() < f64::EPSILON);

        config.defaults.rate_limiter.refill_rate = Some(5.0);
        assert_eq!(config.resolve("x").rate_limiter.refill_rate, 5.0);
    }

    #[test]
    fn test_validate_reports_all_problems() {
        let mut config = WardenConfig::default();
        config.defaults.retry.max_attempts = Some(0);
        config.defaults.bulkhead.limit = Some(0);
        config
            .resources
            .insert("bad key".to_string(), ResourceOverrides::default());

        let problems = config.validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("invalid resource key")));
        assert!(problems.iter().any(|p| p.contains("max_attempts")));
        assert!(problems.iter().any(|p| p.contains("bulkhead.limit")));
    }

    #[test]
    fn test_out_of_range_durations_reported() {
        let mut config = WardenConfig::default();
        config.defaults.bulkhead.timeout_seconds = Some(1.0e20);
        config.resources.insert(
            "search".to_string(),
            ResourceOverrides {
                circuit_breaker: CircuitBreakerOverrides {
                    reset_timeout_seconds: Some(f64::NAN),
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        // Resolution keeps the built-in value instead of panicking
        assert_eq!(config.resolve("search").bulkhead.timeout, Duration::from_secs(30));

        let problems = config.validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("defaults: bulkhead.timeout_seconds")));
        assert!(problems
            .iter()
            .any(|p| p.contains("resources.search: circuit_breaker.reset_timeout_seconds")));
    }

    #[test]
    fn test_backoff_range_checked() {
        let mut config = WardenConfig::default();
        config.defaults.retry.backoff = Some(BackoffConfig::Linear {
            base_delay_ms: 500,
            max_delay_ms: 100,
        });
        let problems = config.validate().unwrap_err();
        assert!(problems[0].contains("max_delay_ms"));
    }
}
