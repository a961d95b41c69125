//! Stagnation detection across workflow iterations.
//!
//! Three independent signals, evaluated at the end of each iteration:
//! - the same failure signature repeated `identical_failures` times in a row
//! - `stale_iterations` consecutive iterations that added no new evidence
//! - `flat_iterations` consecutive iterations whose confidence gain was
//!   below `min_confidence_gain`

use serde::{Deserialize, Serialize};

/// Thresholds for the three stagnation signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StagnationConfig {
    pub identical_failures: u32,
    pub stale_iterations: u32,
    pub flat_iterations: u32,
    pub min_confidence_gain: f64,
}

impl Default for StagnationConfig {
    fn default() -> Self {
        Self {
            identical_failures: 3,
            stale_iterations: 2,
            flat_iterations: 2,
            min_confidence_gain: 0.05,
        }
    }
}

/// Why the loop was judged stuck.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum StagnationSignal {
    RepeatedFailure { signature: String, count: u32 },
    NoNewEvidence { iterations: u32 },
    FlatConfidence { iterations: u32, last_gain: f64 },
}

/// Tracks consecutive-run counters for the stagnation signals.
#[derive(Debug, Clone)]
pub struct StagnationDetector {
    config: StagnationConfig,
    last_signature: Option<String>,
    identical_run: u32,
    failed_this_iteration: bool,
    stale_run: u32,
    flat_run: u32,
    last_confidence: f64,
}

impl StagnationDetector {
    pub fn new(config: StagnationConfig) -> Self {
        Self {
            config,
            last_signature: None,
            identical_run: 0,
            failed_this_iteration: false,
            stale_run: 0,
            flat_run: 0,
            last_confidence: 0.0,
        }
    }

    /// Record a failure signature observed during the current iteration.
    pub fn record_failure(&mut self, signature: &str) {
        if self.last_signature.as_deref() == Some(signature) {
            self.identical_run += 1;
        } else {
            self.last_signature = Some(signature.to_string());
            self.identical_run = 1;
        }
        self.failed_this_iteration = true;
    }

    /// Close out an iteration and report the first signal that fired.
    ///
    /// An iteration without failures breaks the identical-failure run.
    pub fn end_iteration(&mut self, new_evidence: usize, confidence: f64) -> Option<StagnationSignal> {
        if !self.failed_this_iteration {
            self.last_signature = None;
            self.identical_run = 0;
        }
        self.failed_this_iteration = false;

        if new_evidence == 0 {
            self.stale_run += 1;
        } else {
            self.stale_run = 0;
        }

        let gain = confidence - self.last_confidence;
        if gain < self.config.min_confidence_gain {
            self.flat_run += 1;
        } else {
            self.flat_run = 0;
        }
        self.last_confidence = confidence;

        if self.identical_run >= self.config.identical_failures {
            if let Some(signature) = &self.last_signature {
                return Some(StagnationSignal::RepeatedFailure {
                    signature: signature.clone(),
                    count: self.identical_run,
                });
            }
        }
        if self.config.stale_iterations > 0 && self.stale_run >= self.config.stale_iterations {
            return Some(StagnationSignal::NoNewEvidence {
                iterations: self.stale_run,
            });
        }
        if self.config.flat_iterations > 0 && self.flat_run >= self.config.flat_iterations {
            return Some(StagnationSignal::FlatConfidence {
                iterations: self.flat_run,
                last_gain: gain,
            });
        }
        None
    }

    /// Clear the run counters after a strategy switch.
    ///
    /// The confidence baseline is kept so gains are measured from where the
    /// loop actually is.
    pub fn reset(&mut self) {
        self.last_signature = None;
        self.identical_run = 0;
        self.failed_this_iteration = false;
        self.stale_run = 0;
        self.flat_run = 0;
    }
}

impl Default for StagnationDetector {
    fn default() -> Self {
        Self::new(StagnationConfig::default())
    }
}
