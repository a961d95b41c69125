//! Structural checks for raw config documents.
//!
//! The embedded schema (schema/warden.schema.json) is applied to the parsed
//! YAML/JSON value before deserialization, so unknown keys and out-of-range
//! numbers are reported with their location instead of as serde errors.

use lazy_static::lazy_static;
use serde_json::Value;

use super::ConfigError;

const SCHEMA_SOURCE: &str = include_str!("../../../../schema/warden.schema.json");

lazy_static! {
    static ref VALIDATOR: Result<jsonschema::Validator, String> = compile();
}

fn compile() -> Result<jsonschema::Validator, String> {
    let schema: Value = serde_json::from_str(SCHEMA_SOURCE)
        .map_err(|e| format!("embedded schema is not valid JSON: {}", e))?;
    jsonschema::validator_for(&schema)
        .map_err(|e| format!("embedded schema does not compile: {}", e))
}

/// Check a raw document against the config schema.
///
/// Every violation is collected, ordered by location.
pub(crate) fn check(document: &Value) -> Result<(), ConfigError> {
    let validator = VALIDATOR
        .as_ref()
        .map_err(|reason| ConfigError::SchemaUnavailable(reason.clone()))?;

    let mut violations: Vec<(String, String)> = validator
        .iter_errors(document)
        .map(|error| (error.instance_path.to_string(), error.to_string()))
        .collect();
    if violations.is_empty() {
        return Ok(());
    }

    violations.sort();
    Err(ConfigError::Schema(
        violations
            .into_iter()
            .map(|(location, message)| match location.as_str() {
                "" => message,
                _ => format!("{} at {}", message, location),
            })
            .collect(),
    ))
}
