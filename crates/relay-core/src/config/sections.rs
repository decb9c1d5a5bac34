//! Typed configuration sections owned by the runtime.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::duration_format;

/// Two-tier cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Exact-key tier.
    pub enabled: bool,
    #[serde(with = "duration_format")]
    pub ttl: Duration,
    pub max_entries: u64,
    pub semantic: SemanticCacheConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(3600),
            max_entries: 10_000,
            semantic: SemanticCacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticCacheConfig {
    pub enabled: bool,
    /// Score hits without serving them unless promoted.
    pub shadow_mode: bool,
    pub promotion_enabled: bool,
    /// Minimum cosine similarity for a scored hit.
    pub similarity_threshold: f64,
    /// Minimum similarity for a shadow hit to be served.
    pub promotion_threshold: f64,
    pub max_entries_per_namespace: usize,
    pub embedding_dim: usize,
    #[serde(with = "duration_format")]
    pub ttl: Duration,
}

impl Default for SemanticCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            shadow_mode: true,
            promotion_enabled: false,
            similarity_threshold: 0.85,
            promotion_threshold: 0.9,
            max_entries_per_namespace: 1_000,
            embedding_dim: 256,
            ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Upper bound on one outbound attempt.
    #[serde(with = "duration_format")]
    pub request_timeout: Duration,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub pool: PoolConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    #[serde(with = "duration_format")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    /// Total attempts, including the first.
    pub max_attempts: u32,
    #[serde(with = "duration_format")]
    pub base_delay: Duration,
    #[serde(with = "duration_format")]
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Symmetric jitter as a fraction of the computed delay.
    pub jitter: f64,
    pub retry_on_status: Vec<u16>,
    pub retry_on_timeout: bool,
    pub retry_on_connection: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.1,
            retry_on_status: vec![429, 500, 502, 503, 504],
            retry_on_timeout: true,
            retry_on_connection: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub enabled: bool,
    pub max_connections_per_host: usize,
    #[serde(with = "duration_format")]
    pub idle_timeout: Duration,
    /// Route states kept warm for reuse.
    pub object_pool_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_connections_per_host: 16,
            idle_timeout: Duration::from_secs(90),
            object_pool_size: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Learning domain model selection is recorded under.
    pub domain: String,
    pub default_model: String,
    pub candidates: Vec<String>,
    /// Run batches concurrently.
    pub async_enabled: bool,
    pub max_concurrency: usize,
    /// Completion tokens assumed when pricing a request up front.
    pub expected_output_tokens: u32,
    pub adaptive_trials: AdaptiveTrialConfig,
    pub compression: CompressionConfig,
    pub tenants: BTreeMap<String, TenantOverride>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            domain: "model_routing".to_string(),
            default_model: "openai/gpt-4o-mini".to_string(),
            candidates: Vec::new(),
            async_enabled: true,
            max_concurrency: 8,
            expected_output_tokens: 0,
            adaptive_trials: AdaptiveTrialConfig::default(),
            compression: CompressionConfig::default(),
            tenants: BTreeMap::new(),
        }
    }
}

/// Per-tenant routing and pricing overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantOverride {
    /// Preferred candidates, placed ahead of the defaults.
    pub candidates: Vec<String>,
    /// When non-empty, the only models this tenant may use.
    pub allowed_models: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    pub prices: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_per_request: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveTrialConfig {
    pub enabled: bool,
    /// Every n-th request of a task type explores the next candidate.
    pub every_n: u64,
}

impl Default for AdaptiveTrialConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            every_n: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub max_prompt_tokens: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_prompt_tokens: 4_000,
        }
    }
}

/// Outbound provider settings.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: String,
    pub base_url: String,
    /// Inline key; prefer `api_key_env`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub api_key_env: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(with = "duration_format")]
    pub timeout: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Passed through as the request's `provider` object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_preferences: Option<serde_json::Value>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: "openrouter".to_string(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key: None,
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            referer: None,
            title: None,
            timeout: Duration::from_secs(60),
            max_tokens: None,
            provider_preferences: None,
        }
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_key_env", &self.api_key_env)
            .field("referer", &self.referer)
            .field("title", &self.title)
            .field("timeout", &self.timeout)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_debug_redacts_key() {
        let config = ProviderConfig {
            api_key: Some("sk-or-secret".to_string()),
            ..Default::default()
        };
        let debug = format!("{:?}", config);
        assert!(!debug.contains("sk-or-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_retry_defaults_cover_throttling_and_5xx() {
        let retry = RetryConfig::default();
        assert!(retry.retry_on_status.contains(&429));
        assert!(retry.retry_on_status.contains(&503));
        assert!(!retry.retry_on_status.contains(&400));
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let cache: CacheConfig = serde_yaml::from_str("semantic:\n  enabled: true\n").unwrap();
        assert!(cache.enabled);
        assert!(cache.semantic.enabled);
        assert_eq!(cache.semantic.promotion_threshold, 0.9);
    }
}
