//! JSON Schema validation for gateway configuration.
//!
//! Configuration documents are checked against `schema/gateway.schema.json`
//! before they are deserialized, so structural mistakes are reported with
//! the offending path instead of a serde error.

use std::sync::OnceLock;
use thiserror::Error;

/// Embedded configuration schema (loaded at compile time).
const GATEWAY_SCHEMA_JSON: &str = include_str!("../../schema/gateway.schema.json");

/// Compiled JSON Schema validator (initialized once, reused).
static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Failed to load schema: {0}")]
    LoadError(String),
}

fn get_validator() -> Result<&'static jsonschema::Validator, SchemaError> {
    let result = COMPILED_SCHEMA.get_or_init(|| {
        let schema_value: serde_json::Value = match serde_json::from_str(GATEWAY_SCHEMA_JSON) {
            Ok(v) => v,
            Err(e) => return Err(format!("Invalid schema JSON: {}", e)),
        };

        match jsonschema::options().build(&schema_value) {
            Ok(v) => Ok(v),
            Err(e) => Err(format!("Failed to compile schema: {}", e)),
        }
    });

    match result {
        Ok(v) => Ok(v),
        Err(e) => Err(SchemaError::LoadError(e.clone())),
    }
}

/// Validate a configuration document.
///
/// Returns every violation, each suffixed with its JSON pointer.
pub fn validate_config_schema(config_json: &serde_json::Value) -> Result<(), Vec<String>> {
    let validator = get_validator().map_err(|e| vec![e.to_string()])?;

    let errors: Vec<String> = validator
        .iter_errors(config_json)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// The raw embedded schema.
pub fn schema_source() -> &'static str {
    GATEWAY_SCHEMA_JSON
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schema_compiles() {
        assert!(get_validator().is_ok());
    }

    #[test]
    fn test_empty_document_is_valid() {
        assert!(validate_config_schema(&json!({})).is_ok());
    }

    #[test]
    fn test_unknown_top_level_section_rejected() {
        let errors = validate_config_schema(&json!({"bogus": {}})).unwrap_err();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_out_of_range_values_reported_with_path() {
        let errors = validate_config_schema(&json!({
            "cache": {"semantic": {"promotion_threshold": 1.5}},
            "resilience": {"retry": {"max_attempts": 0}}
        }))
        .unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("/cache/semantic/promotion_threshold")));
    }

    #[test]
    fn test_duration_must_be_human_readable() {
        assert!(validate_config_schema(&json!({"alerts": {"cooldown": "5m"}})).is_ok());
        assert!(validate_config_schema(&json!({"alerts": {"cooldown": "1m 30s"}})).is_ok());
        assert!(validate_config_schema(&json!({"alerts": {"cooldown": 300}})).is_err());
    }
}
