//! Failure taxonomy shared by every warden component.
//!
//! Every failure carries a machine-readable [`FailureKind`] and a
//! human-readable reason. Leaf rejections (`rate_limited`, `circuit_open`,
//! `bulkhead_timeout`) are never retried by the pipeline itself.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Machine-readable classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Token bucket had insufficient tokens
    RateLimited,

    /// Circuit breaker is open for the resource
    CircuitOpen,

    /// No bulkhead slot freed up within the timeout
    BulkheadTimeout,

    /// Retryable failure, bounded by `max_attempts`
    Transient,

    /// Never retried
    Permanent,

    /// FSM transition not in the adjacency map
    InvalidTransition,

    /// FSM guard refused or failed
    GuardRejected,

    /// State store write failed
    Persistence,

    /// Invalid configuration
    Config,
}

impl FailureKind {
    /// Stable snake_case name, used as the default error class.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::CircuitOpen => "circuit_open",
            Self::BulkheadTimeout => "bulkhead_timeout",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::InvalidTransition => "invalid_transition",
            Self::GuardRejected => "guard_rejected",
            Self::Persistence => "persistence",
            Self::Config => "config",
        }
    }

    /// Leaf-component rejections. These never consume a retry attempt.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::CircuitOpen | Self::BulkheadTimeout
        )
    }

    /// Whether this kind may ever be retried by a retry loop.
    ///
    /// Rejections, permanent failures and FSM-level failures are excluded
    /// regardless of the configured transient set.
    pub fn may_retry(&self) -> bool {
        !self.is_rejection()
            && !matches!(
                self,
                Self::Permanent
                    | Self::InvalidTransition
                    | Self::GuardRejected
                    | Self::Config
            )
    }

    /// Default retryability when no transient set is configured.
    pub fn is_retryable_by_default(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    /// Machine-readable kind
    pub kind: FailureKind,

    /// Human-readable reason
    pub reason: String,

    /// Finer-grained error class (e.g. "timeout", "http_503")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Attempts made before this failure was propagated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    /// Set when the retry loop gave up
    #[serde(default)]
    pub exhausted: bool,

    /// Hint for callers that may re-enter later
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
}

impl Failure {
    /// Create a failure of the given kind.
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            code: None,
            attempts: None,
            exhausted: false,
            retry_after: None,
        }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, reason)
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, reason)
    }

    pub fn rate_limited(resource: &str, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(
                FailureKind::RateLimited,
                format!("rate limit exceeded for '{}'", resource),
            )
        }
    }

    pub fn circuit_open(resource: &str) -> Self {
        Self::new(
            FailureKind::CircuitOpen,
            format!("circuit open for '{}'", resource),
        )
    }

    pub fn bulkhead_timeout(resource: &str, waited: Duration) -> Self {
        Self::new(
            FailureKind::BulkheadTimeout,
            format!("no bulkhead slot for '{}' within {:?}", resource, waited),
        )
    }

    pub fn invalid_transition(from: &str, to: &str) -> Self {
        Self::new(
            FailureKind::InvalidTransition,
            format!("transition {} -> {} is not allowed", from, to),
        )
    }

    pub fn guard_rejected(from: &str, to: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            FailureKind::GuardRejected,
            format!("guard rejected {} -> {}: {}", from, to, reason),
        )
    }

    /// Attach a finer-grained error class.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Mark the failure as the last one of an exhausted retry loop.
    pub fn exhausted_after(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self.exhausted = true;
        self
    }

    /// The class matched against a configured transient set.
    ///
    /// Falls back to the kind name when no code is attached.
    pub fn error_class(&self) -> &str {
        self.code.as_deref().unwrap_or(self.kind.as_str())
    }

    /// Stable signature used for stagnation detection.
    pub fn signature(&self) -> String {
        format!("{}:{}", self.error_class(), self.reason)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)?;
        if let Some(code) = &self.code {
            write!(f, " [{}]", code)?;
        }
        if self.exhausted {
            if let Some(attempts) = self.attempts {
                write!(f, " (attempts exhausted after {})", attempts)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for Failure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_never_retry() {
        for kind in [
            FailureKind::RateLimited,
            FailureKind::CircuitOpen,
            FailureKind::BulkheadTimeout,
        ] {
            assert!(kind.is_rejection());
            assert!(!kind.may_retry());
        }
        assert!(FailureKind::Transient.may_retry());
        assert!(!FailureKind::Permanent.may_retry());
    }

    #[test]
    fn test_error_class_prefers_code() {
        let failure = Failure::transient("socket reset").with_code("connection");
        assert_eq!(failure.error_class(), "connection");
        assert_eq!(Failure::permanent("bad input").error_class(), "permanent");
    }

    #[test]
    fn test_display_includes_exhaustion() {
        let failure = Failure::transient("upstream 503").exhausted_after(3);
        let text = failure.to_string();
        assert!(text.starts_with("transient: upstream 503"));
        assert!(text.contains("attempts exhausted after 3"));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::BulkheadTimeout).unwrap();
        assert_eq!(json, "\"bulkhead_timeout\"");
    }
}
