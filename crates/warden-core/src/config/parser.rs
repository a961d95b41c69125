//! Config parsing from YAML/JSON.

use std::fs;
use std::path::Path;
use thiserror::Error;

use super::schema;
use super::WardenConfig;
use crate::failure::{Failure, FailureKind};

/// Errors that can occur when loading a config.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Schema validation failed: {}", .0.join("; "))]
    Schema(Vec<String>),

    #[error("Config schema unavailable: {0}")]
    SchemaUnavailable(String),

    #[error("Invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

impl From<ConfigError> for Failure {
    fn from(err: ConfigError) -> Self {
        Failure::new(FailureKind::Config, err.to_string())
    }
}

impl WardenConfig {
    /// Parse a config from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_yaml::from_str(yaml)?;
        Self::from_value(value)
    }

    /// Parse a config from JSON.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Load a config file, choosing the format by extension.
    ///
    /// `.json` is parsed as JSON; anything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        // An empty YAML document is a valid, all-defaults config
        let value = if value.is_null() {
            serde_json::json!({})
        } else {
            value
        };

        schema::check(&value)?;

        let config: WardenConfig = serde_json::from_value(value)?;
        config.validate().map_err(ConfigError::Invalid)?;

        tracing::debug!(
            resources = config.resources.len(),
            "Loaded warden config"
        );

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use std::time::Duration;

    const SAMPLE: &str = r#"
defaults:
  rate_limiter:
    capacity: 20
    window_seconds: 10
  retry:
    max_attempts: 4
    backoff:
      kind: exponential
      base_delay_ms: 100
      max_delay_ms: 5000
      base: 2
      jitter: false
    transient_errors: [transient, timeout]
resources:
  anthropic:
    circuit_breaker:
      failure_threshold: 3
      timeout_seconds: 15
    bulkhead:
      limit: 2
      timeout_seconds: 0.5
workflow:
  budget:
    max_iterations: 6
    max_subagent_calls: 12
    max_wall_time: 5m
"#;

    #[test]
    fn test_parse_yaml() {
        let config = WardenConfig::from_yaml(SAMPLE).unwrap();
        let settings = config.resolve("anthropic");

        assert_eq!(settings.rate_limiter.capacity, 20);
        assert!((settings.rate_limiter.refill_rate - 2.0).abs() < 1e-9);
        assert_eq!(settings.circuit_breaker.failure_threshold, 3);
        assert_eq!(settings.circuit_breaker.timeout, Duration::from_secs(15));
        assert_eq!(settings.bulkhead.limit, 2);
        assert_eq!(settings.bulkhead.timeout, Duration::from_millis(500));
        assert_eq!(settings.retry.max_attempts, 4);
        assert!(settings.retry.transient_errors.contains("timeout"));
        assert!(matches!(
            settings.retry.backoff,
            BackoffConfig::Exponential { jitter: false, .. }
        ));
        assert_eq!(config.workflow.budget.max_wall_time, Duration::from_secs(300));
    }

    #[test]
    fn test_empty_document_is_defaults() {
        let config = WardenConfig::from_yaml("").unwrap();
        assert_eq!(config, WardenConfig::default());
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{"resources": {"search": {"bulkhead": {"limit": 3}}}}"#;
        let config = WardenConfig::from_json(json).unwrap();
        assert_eq!(config.resolve("search").bulkhead.limit, 3);
    }

    #[test]
    fn test_unknown_field_rejected_by_schema() {
        let yaml = "defaults:\n  rate_limiter:\n    burst: 4\n";
        let result = WardenConfig::from_yaml(yaml);
        assert!(matches!(result, Err(ConfigError::Schema(_))));
    }

    #[test]
    fn test_semantic_validation_runs() {
        let yaml = "defaults:\n  bulkhead:\n    limit: 0\n";
        let err = WardenConfig::from_yaml(yaml).unwrap_err();
        match err {
            ConfigError::Invalid(problems) => {
                assert!(problems.iter().any(|p| p.contains("bulkhead.limit")))
            }
            ConfigError::Schema(_) => {}
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_huge_timeout_is_an_error_not_a_panic() {
        let yaml = "defaults:\n  bulkhead:\n    timeout_seconds: 1.0e20\n";
        assert!(matches!(
            WardenConfig::from_yaml(yaml),
            Err(ConfigError::Schema(_))
        ));
    }

    #[test]
    fn test_config_error_into_failure() {
        let err = WardenConfig::from_yaml("defaults: [").unwrap_err();
        let failure: Failure = err.into();
        assert_eq!(failure.kind, FailureKind::Config);
    }
}
