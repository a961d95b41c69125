//! Circuit breaker to prevent cascade failures.
//!
//! When calls to a resource fail repeatedly, its circuit opens and
//! subsequent calls are rejected immediately until the timeout elapses and
//! a probe call is allowed through.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use warden_core::{CircuitBreakerConfig, Failure, FailureKind, WardenConfig};

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// All calls rejected
    Open,

    /// Probe calls admitted to test recovery
    HalfOpen,
}

impl CircuitState {
    /// Whether the automatic state machine may move from `self` to `to`.
    ///
    /// Staying in the same state is always allowed; the only state changes
    /// are CLOSED->OPEN, OPEN->HALF_OPEN, HALF_OPEN->CLOSED and
    /// HALF_OPEN->OPEN.
    pub fn can_transition_to(&self, to: CircuitState) -> bool {
        use CircuitState::*;
        matches!(
            (self, to),
            (Closed, Closed)
                | (Open, Open)
                | (HalfOpen, HalfOpen)
                | (Closed, Open)
                | (Open, HalfOpen)
                | (HalfOpen, Closed)
                | (HalfOpen, Open)
        )
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of one circuit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_probe_count: u32,
    /// Set when an operator forced the circuit open
    pub forced_open: bool,
    pub since_last_failure: Option<Duration>,
}

#[derive(Debug, Clone)]
struct Circuit {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    half_open_probe_count: u32,
    half_open_failures: u32,
    forced_open: bool,
}

impl Circuit {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            opened_at: None,
            half_open_probe_count: 0,
            half_open_failures: 0,
            forced_open: false,
        }
    }

    /// Move to `to` with the bookkeeping that state implies.
    fn move_to(&mut self, to: CircuitState, now: Instant) -> Result<(), Failure> {
        if !self.state.can_transition_to(to) {
            return Err(Failure::new(
                FailureKind::InvalidTransition,
                format!("circuit transition {} -> {} is not allowed", self.state, to),
            ));
        }
        if self.state == to {
            return Ok(());
        }

        match to {
            CircuitState::Open => {
                self.opened_at = Some(now);
                self.half_open_probe_count = 0;
                self.half_open_failures = 0;
            }
            CircuitState::HalfOpen => {
                self.half_open_probe_count = 0;
                self.half_open_failures = 0;
            }
            CircuitState::Closed => {
                self.failure_count = 0;
                self.opened_at = None;
                self.half_open_probe_count = 0;
                self.half_open_failures = 0;
            }
        }
        self.state = to;
        Ok(())
    }

    fn snapshot(&self, now: Instant) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            half_open_probe_count: self.half_open_probe_count,
            forced_open: self.forced_open,
            since_last_failure: self.last_failure.map(|t| now.saturating_duration_since(t)),
        }
    }
}

/// Circuit breaker keyed by resource.
///
/// Each resource has its own circuit to allow independent recovery.
pub struct CircuitBreaker {
    circuits: Mutex<HashMap<String, Circuit>>,
    configs: RwLock<HashMap<String, CircuitBreakerConfig>>,
    defaults: CircuitBreakerConfig,
}

/// Admission granted by [`CircuitBreaker::acquire`].
///
/// Report the outcome with [`success`](Self::success) or
/// [`failure`](Self::failure). A permit dropped without an outcome (for
/// example, because the call was cancelled) gives its probe slot back.
#[must_use = "report the call outcome through the permit"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    resource: String,
    probe: bool,
    settled: bool,
}

impl<'a> CircuitPermit<'a> {
    /// Whether this call is a HALF_OPEN probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.settle(&self.resource, self.probe, true);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.settle(&self.resource, self.probe, false);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe(&self.resource);
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
            configs: RwLock::new(HashMap::new()),
            defaults,
        }
    }

    /// Build from a config document, registering every configured resource.
    pub fn from_config(config: &WardenConfig) -> Self {
        let breaker = Self::new(config.resolve_defaults().circuit_breaker);
        for name in config.resource_names() {
            breaker.set_config(name, config.resolve(name).circuit_breaker);
        }
        breaker
    }

    /// Configure a resource.
    pub fn set_config(&self, resource: &str, config: CircuitBreakerConfig) {
        self.configs.write().insert(resource.to_string(), config);
    }

    /// Effective configuration for a resource.
    pub fn config_for(&self, resource: &str) -> CircuitBreakerConfig {
        self.configs
            .read()
            .get(resource)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Admission check that does not take a probe slot.
    ///
    /// Moves OPEN to HALF_OPEN once the timeout has elapsed. Rejects when
    /// OPEN, or when every HALF_OPEN probe slot is taken.
    pub fn check(&self, resource: &str) -> Result<(), Failure> {
        self.admit(resource, false).map(|_| ())
    }

    /// Admission check that takes a probe slot in HALF_OPEN.
    pub fn acquire(&self, resource: &str) -> Result<CircuitPermit<'_>, Failure> {
        let probe = self.admit(resource, true)?;
        Ok(CircuitPermit {
            breaker: self,
            resource: resource.to_string(),
            probe,
            settled: false,
        })
    }

    /// Returns whether the admitted call is a probe.
    fn admit(&self, resource: &str, take_probe: bool) -> Result<bool, Failure> {
        let config = self.config_for(resource);
        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(resource.to_string())
            .or_insert_with(Circuit::closed);

        if circuit.state == CircuitState::Open && !circuit.forced_open {
            let opened_at = circuit.opened_at.unwrap_or(now);
            if now.saturating_duration_since(opened_at) >= config.timeout {
                circuit.move_to(CircuitState::HalfOpen, now)?;
                tracing::info!(resource = %resource, "Circuit transitioning to half-open for recovery test");
            }
        }

        match circuit.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => Err(Failure::circuit_open(resource)),
            CircuitState::HalfOpen => {
                if circuit.half_open_probe_count >= config.half_open_threshold.max(1) {
                    return Err(Failure::circuit_open(resource)
                        .with_code("half_open_probes_exhausted"));
                }
                if take_probe {
                    circuit.half_open_probe_count += 1;
                }
                Ok(take_probe)
            }
        }
    }

    fn settle(&self, resource: &str, probe: bool, success: bool) {
        if probe {
            self.release_probe(resource);
        }
        if success {
            self.record_success(resource);
        } else {
            self.record_failure(resource);
        }
    }

    fn release_probe(&self, resource: &str) {
        if let Some(circuit) = self.circuits.lock().get_mut(resource) {
            if circuit.state == CircuitState::HalfOpen {
                circuit.half_open_probe_count = circuit.half_open_probe_count.saturating_sub(1);
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self, resource: &str) {
        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(resource.to_string())
            .or_insert_with(Circuit::closed);

        match circuit.state {
            CircuitState::HalfOpen => {
                if circuit.move_to(CircuitState::Closed, now).is_ok() {
                    tracing::info!(resource = %resource, "Circuit closed after successful recovery");
                }
            }
            CircuitState::Closed => {
                circuit.failure_count = 0;
            }
            // A call admitted before the circuit opened; the open state stands
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, resource: &str) {
        let config = self.config_for(resource);
        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(resource.to_string())
            .or_insert_with(Circuit::closed);

        match circuit.state {
            CircuitState::Closed => {
                let stale = circuit
                    .last_failure
                    .map(|t| now.saturating_duration_since(t) >= config.reset_timeout)
                    .unwrap_or(false);
                if stale {
                    circuit.failure_count = 0;
                }
                circuit.failure_count += 1;
                circuit.last_failure = Some(now);

                if circuit.failure_count >= config.failure_threshold
                    && circuit.move_to(CircuitState::Open, now).is_ok()
                {
                    tracing::warn!(
                        resource = %resource,
                        failures = circuit.failure_count,
                        "Circuit opened after repeated failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                circuit.last_failure = Some(now);
                circuit.half_open_failures += 1;
                if circuit.half_open_failures >= config.half_open_threshold.max(1)
                    && circuit.move_to(CircuitState::Open, now).is_ok()
                {
                    tracing::warn!(resource = %resource, "Circuit reopened after failed recovery attempt");
                }
            }
            CircuitState::Open => {
                circuit.last_failure = Some(now);
            }
        }
    }

    /// Apply a state change, enforcing the legal-edge table.
    pub fn transition(&self, resource: &str, to: CircuitState) -> Result<(), Failure> {
        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(resource.to_string())
            .or_insert_with(Circuit::closed);
        let from = circuit.state;
        circuit.move_to(to, now)?;
        if from != to {
            tracing::info!(resource = %resource, from = %from, to = %to, "Circuit transition");
        }
        Ok(())
    }

    /// Force the circuit open. Stays open until [`close`](Self::close).
    pub fn open(&self, resource: &str) {
        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(resource.to_string())
            .or_insert_with(Circuit::closed);
        if circuit.forced_open {
            return;
        }
        circuit.state = CircuitState::Open;
        circuit.opened_at = Some(now);
        circuit.half_open_probe_count = 0;
        circuit.half_open_failures = 0;
        circuit.forced_open = true;
        tracing::warn!(resource = %resource, "Circuit manually opened");
    }

    /// Force the circuit closed and clear its failure history.
    pub fn close(&self, resource: &str) {
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(resource.to_string())
            .or_insert_with(Circuit::closed);
        if circuit.state == CircuitState::Closed && !circuit.forced_open && circuit.failure_count == 0 {
            return;
        }
        *circuit = Circuit::closed();
        tracing::info!(resource = %resource, "Circuit manually closed");
    }

    /// Current state of a circuit.
    pub fn state(&self, resource: &str) -> CircuitState {
        self.circuits
            .lock()
            .get(resource)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Detailed view of a circuit.
    pub fn snapshot(&self, resource: &str) -> CircuitSnapshot {
        let now = Instant::now();
        self.circuits
            .lock()
            .get(resource)
            .map(|c| c.snapshot(now))
            .unwrap_or_else(|| Circuit::closed().snapshot(now))
    }

    /// Reset all circuits to closed.
    pub fn reset(&self) {
        self.circuits.lock().clear();
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config(failure_threshold: u32, timeout_secs: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            timeout: Duration::from_secs(timeout_secs),
            ..Default::default()
        }
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::default();
        assert!(cb.check("anthropic").is_ok());
        assert_eq!(cb.state("anthropic"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold() {
        let cb = CircuitBreaker::new(config(3, 30));

        cb.record_failure("anthropic");
        cb.record_failure("anthropic");
        assert!(cb.check("anthropic").is_ok());

        cb.record_failure("anthropic");
        let err = cb.check("anthropic").unwrap_err();
        assert_eq!(err.kind, FailureKind::CircuitOpen);
        assert_eq!(cb.state("anthropic"), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_failures() {
        let cb = CircuitBreaker::new(config(3, 30));

        cb.record_failure("r");
        cb.record_failure("r");
        cb.record_success("r");

        cb.record_failure("r");
        cb.record_failure("r");
        assert_eq!(cb.state("r"), CircuitState::Closed);
    }

    #[test]
    fn test_resources_are_independent() {
        let cb = CircuitBreaker::new(config(2, 30));

        cb.record_failure("dignity");
        cb.record_failure("dignity");

        assert!(cb.check("dignity").is_err());
        assert!(cb.check("boundaries").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_timeout_then_close() {
        let cb = CircuitBreaker::new(config(1, 10));
        cb.record_failure("r");
        assert!(cb.check("r").is_err());

        tokio::time::advance(Duration::from_secs(10)).await;
        let permit = cb.acquire("r").unwrap();
        assert!(permit.is_probe());
        assert_eq!(cb.state("r"), CircuitState::HalfOpen);

        // Only one probe at a time with the default threshold
        assert!(cb.acquire("r").is_err());

        permit.success();
        assert_eq!(cb.state("r"), CircuitState::Closed);
        assert_eq!(cb.snapshot("r").failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens_and_resets_clock() {
        let cb = CircuitBreaker::new(config(1, 10));
        cb.record_failure("r");

        tokio::time::advance(Duration::from_secs(10)).await;
        cb.acquire("r").unwrap().failure();
        assert_eq!(cb.state("r"), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cb.check("r").is_err());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cb.check("r").is_ok());
        assert_eq!(cb.state("r"), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_releases_slot() {
        let cb = CircuitBreaker::new(config(1, 1));
        cb.record_failure("r");
        tokio::time::advance(Duration::from_secs(1)).await;

        {
            let _permit = cb.acquire("r").unwrap();
            assert_eq!(cb.snapshot("r").half_open_probe_count, 1);
        }
        assert_eq!(cb.snapshot("r").half_open_probe_count, 0);
        assert!(cb.acquire("r").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_threshold_bounds_probe_failures() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            half_open_threshold: 2,
            timeout: Duration::from_secs(1),
            ..Default::default()
        });
        cb.record_failure("r");
        tokio::time::advance(Duration::from_secs(1)).await;

        cb.acquire("r").unwrap().failure();
        assert_eq!(cb.state("r"), CircuitState::HalfOpen);
        cb.acquire("r").unwrap().failure();
        assert_eq!(cb.state("r"), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_failures_forgotten() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            ..Default::default()
        });
        cb.record_failure("r");
        tokio::time::advance(Duration::from_secs(61)).await;
        cb.record_failure("r");
        assert_eq!(cb.state("r"), CircuitState::Closed);
        assert_eq!(cb.snapshot("r").failure_count, 1);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let cb = CircuitBreaker::default();

        let err = cb.transition("r", CircuitState::HalfOpen).unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidTransition);
        assert_eq!(cb.state("r"), CircuitState::Closed);

        cb.transition("r", CircuitState::Open).unwrap();
        assert!(cb.transition("r", CircuitState::Closed).is_err());
        assert_eq!(cb.state("r"), CircuitState::Open);

        cb.transition("r", CircuitState::HalfOpen).unwrap();
        cb.transition("r", CircuitState::Closed).unwrap();
    }

    #[test]
    fn test_manual_overrides_are_idempotent() {
        let cb = CircuitBreaker::default();

        cb.open("r");
        cb.open("r");
        assert_eq!(cb.state("r"), CircuitState::Open);
        assert!(cb.snapshot("r").forced_open);

        cb.close("r");
        cb.close("r");
        assert_eq!(cb.state("r"), CircuitState::Closed);
        assert!(cb.check("r").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_open_ignores_timeout() {
        let cb = CircuitBreaker::new(config(5, 1));
        cb.open("r");
        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(cb.check("r").is_err());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Success,
        Failure,
        Acquire,
        Advance(u64),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Success),
            Just(Op::Failure),
            Just(Op::Acquire),
            (0u64..20).prop_map(Op::Advance),
        ]
    }

    proptest! {
        #[test]
        fn prop_only_legal_edges_occur(ops in prop::collection::vec(arb_op(), 1..80)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            runtime.block_on(async {
                let cb = CircuitBreaker::new(CircuitBreakerConfig {
                    failure_threshold: 2,
                    half_open_threshold: 1,
                    timeout: Duration::from_secs(5),
                    reset_timeout: Duration::from_secs(30),
                });

                let mut previous = cb.state("r");
                for op in ops {
                    match op {
                        Op::Success => cb.record_success("r"),
                        Op::Failure => cb.record_failure("r"),
                        Op::Acquire => {
                            if let Ok(permit) = cb.acquire("r") {
                                drop(permit);
                            }
                        }
                        Op::Advance(secs) => tokio::time::advance(Duration::from_secs(secs)).await,
                    }
                    let current = cb.state("r");
                    prop_assert!(
                        previous.can_transition_to(current),
                        "illegal edge {} -> {}", previous, current
                    );
                    previous = current;
                }
                Ok(())
            })?;
        }
    }
}
