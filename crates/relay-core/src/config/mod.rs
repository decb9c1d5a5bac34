//! Gateway configuration.
//!
//! A single YAML or JSON document configures the whole gateway. Loading is
//! two-pass: the raw document is checked against the embedded JSON Schema,
//! then the typed [`GatewayConfig`] is validated semantically.

mod parser;
pub mod schema;
mod sections;

pub use parser::{ConfigError, GatewayConfig};
pub use schema::validate_config_schema;
pub use sections::{
    AdaptiveTrialConfig, CacheConfig, CircuitBreakerConfig, CompressionConfig, PoolConfig,
    ProviderConfig, ResilienceConfig, RetryConfig, RoutingConfig, SemanticCacheConfig,
    TenantOverride,
};

/// Serde adapter writing [`std::time::Duration`] as a human-readable string
/// (`"30s"`, `"1m 30s"`, `"250ms"`).
pub mod duration_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Serialize, Deserialize)]
    struct Holder {
        #[serde(with = "duration_format")]
        timeout: Duration,
    }

    #[test]
    fn test_duration_format_round_trip() {
        let holder: Holder = serde_json::from_str(r#"{"timeout": "1m 30s"}"#).unwrap();
        assert_eq!(holder.timeout, Duration::from_secs(90));

        let json = serde_json::to_string(&Holder { timeout: Duration::from_millis(250) }).unwrap();
        assert_eq!(json, r#"{"timeout":"250ms"}"#);
    }

    #[test]
    fn test_duration_format_rejects_garbage() {
        assert!(serde_json::from_str::<Holder>(r#"{"timeout": "soon"}"#).is_err());
    }
}
