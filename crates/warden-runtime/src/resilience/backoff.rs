//! Backoff strategies mapping a 0-based attempt index to a wait.

use rand::Rng;
use std::fmt::Debug;
use std::time::Duration;
use warden_core::BackoffConfig;

/// Fraction of the computed delay added at most as jitter.
const JITTER_FRACTION: f64 = 0.1;

/// Maps a retry attempt index to a delay.
pub trait Backoff: Send + Sync + Debug {
    /// Delay before retrying after attempt `attempt`, without jitter.
    fn base_delay(&self, attempt: u32) -> Duration;

    /// Delay actually slept. Defaults to the base delay.
    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay(attempt)
    }
}

/// Constant delay.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedBackoff {
    pub delay_ms: u64,
}

impl Backoff for FixedBackoff {
    fn base_delay(&self, _attempt: u32) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// `min(base_delay_ms * (n + 1), max_delay_ms)`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearBackoff {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Backoff for LinearBackoff {
    fn base_delay(&self, attempt: u32) -> Duration {
        let ms = self
            .base_delay_ms
            .saturating_mul(u64::from(attempt) + 1)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// `min(base_delay_ms * base^n, max_delay_ms)`, optionally jittered.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub base: f64,
    pub jitter: bool,
}

impl ExponentialBackoff {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, base: f64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            base,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

impl Backoff for ExponentialBackoff {
    fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let ms = self.base_delay_ms as f64 * self.base.powi(exponent);
        let capped = if ms.is_finite() {
            ms.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let spread = (base.as_millis() as f64 * JITTER_FRACTION) as u64;
        let extra = rand::thread_rng().gen_range(0..=spread);
        base + Duration::from_millis(extra)
    }
}

/// Build the strategy described by a config.
pub fn from_config(config: &BackoffConfig) -> Box<dyn Backoff> {
    match config {
        BackoffConfig::Fixed { delay_ms } => Box::new(FixedBackoff {
            delay_ms: *delay_ms,
        }),
        BackoffConfig::Linear {
            base_delay_ms,
            max_delay_ms,
        } => Box::new(LinearBackoff {
            base_delay_ms: *base_delay_ms,
            max_delay_ms: *max_delay_ms,
        }),
        BackoffConfig::Exponential {
            base_delay_ms,
            max_delay_ms,
            base,
            jitter,
        } => Box::new(
            ExponentialBackoff::new(*base_delay_ms, *max_delay_ms, *base).with_jitter(*jitter),
        ),
    }
}
