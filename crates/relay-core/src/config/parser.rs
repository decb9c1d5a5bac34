//! Configuration loading from YAML/JSON.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

use super::schema::validate_config_schema;
use super::sections::{CacheConfig, ProviderConfig, ResilienceConfig, RoutingConfig};
use crate::budget::{AlertConfig, BudgetConfig, PriceTable};
use crate::experiment::ExperimentsConfig;
use crate::learning::LearningConfig;
use crate::policy::PolicyRegistry;

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Config does not match schema: {}", .0.join("; "))]
    Schema(Vec<String>),

    #[error("Config validation failed: {0}")]
    ValidationError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// The full gateway configuration. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub learning: LearningConfig,
    pub experiments: ExperimentsConfig,
    pub budget: BudgetConfig,
    pub alerts: AlertConfig,
    pub cache: CacheConfig,
    pub resilience: ResilienceConfig,
    pub routing: RoutingConfig,
    pub pricing: PriceTable,
    pub provider: ProviderConfig,
}

impl GatewayConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Self::from_value(serde_json::Value::Null);
        }
        let raw: serde_json::Value = serde_yaml::from_str(yaml)?;
        Self::from_value(raw)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let raw: serde_json::Value = serde_json::from_str(json)?;
        Self::from_value(raw)
    }

    /// Parse configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Parse a file, choosing the format from its extension (YAML unless `.json`).
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_file(path),
            _ => Self::from_yaml_file(path),
        }
    }

    fn from_value(raw: serde_json::Value) -> Result<Self, ConfigError> {
        // An empty YAML document parses to null.
        let raw = if raw.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            raw
        };
        validate_config_schema(&raw).map_err(ConfigError::Schema)?;
        let config: GatewayConfig = serde_json::from_value(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Semantic checks the schema cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.routing.default_model.trim().is_empty() {
            return Err(ConfigError::MissingField("routing.default_model".to_string()));
        }
        if self.routing.domain.trim().is_empty() {
            return Err(ConfigError::MissingField("routing.domain".to_string()));
        }

        let weights = &self.learning.reward_weights;
        for (name, w) in [
            ("quality", weights.quality),
            ("groundedness", weights.groundedness),
            ("cost", weights.cost),
            ("latency", weights.latency),
            ("safety", weights.safety),
            ("privacy", weights.privacy),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "learning.reward_weights.{name} must be a non-negative number"
                )));
            }
        }

        let alerts = &self.alerts;
        if !(alerts.warning_pct <= alerts.critical_pct && alerts.critical_pct <= alerts.emergency_pct) {
            return Err(ConfigError::ValidationError(format!(
                "alert thresholds must be ordered warning <= critical <= emergency (got {} / {} / {})",
                alerts.warning_pct, alerts.critical_pct, alerts.emergency_pct
            )));
        }

        let semantic = &self.cache.semantic;
        if semantic.promotion_threshold < semantic.similarity_threshold {
            return Err(ConfigError::ValidationError(format!(
                "cache.semantic.promotion_threshold {} is below similarity_threshold {}",
                semantic.promotion_threshold, semantic.similarity_threshold
            )));
        }

        let dr = &self.learning.params.doubly_robust;
        if dr.min_importance_weight > dr.max_importance_weight {
            return Err(ConfigError::ValidationError(format!(
                "learning.params.doubly_robust.min_importance_weight {} exceeds max_importance_weight {}",
                dr.min_importance_weight, dr.max_importance_weight
            )));
        }

        let retry = &self.resilience.retry;
        if retry.base_delay > retry.max_delay {
            return Err(ConfigError::ValidationError(
                "resilience.retry.base_delay exceeds max_delay".to_string(),
            ));
        }

        for (id, experiment) in &self.experiments.definitions {
            experiment
                .validate(id)
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        }

        for (tenant, overrides) in &self.routing.tenants {
            if let Some(default) = &overrides.default_model {
                if !overrides.allowed_models.is_empty() && !overrides.allowed_models.contains(default) {
                    return Err(ConfigError::ValidationError(format!(
                        "tenant '{tenant}' default model '{default}' is not in its allowed_models"
                    )));
                }
            }
        }

        let registry = PolicyRegistry::with_builtins();
        if !registry.contains(&self.learning.policy) {
            warn!(
                policy = %self.learning.policy,
                "unknown learning policy, domains will fall back to epsilon_greedy"
            );
        }

        Ok(())
    }

    /// Global prices with the tenant's overrides layered on top.
    pub fn effective_prices(&self, tenant: Option<&str>) -> PriceTable {
        match tenant.and_then(|t| self.routing.tenants.get(t)) {
            Some(overrides) if !overrides.prices.is_empty() => self.pricing.overlay(&overrides.prices),
            _ => self.pricing.clone(),
        }
    }

    /// Default model, honouring a tenant override.
    pub fn effective_default_model(&self, tenant: Option<&str>) -> &str {
        tenant
            .and_then(|t| self.routing.tenants.get(t))
            .and_then(|o| o.default_model.as_deref())
            .unwrap_or(&self.routing.default_model)
    }

    /// Candidate models for a tenant: its own list ahead of the defaults,
    /// deduplicated. Falls back to the default model when both are empty.
    pub fn effective_candidates(&self, tenant: Option<&str>) -> Vec<String> {
        let overrides = tenant.and_then(|t| self.routing.tenants.get(t));
        let mut candidates: Vec<String> = Vec::new();
        let tenant_list = overrides.map(|o| o.candidates.as_slice()).unwrap_or(&[]);
        for model in tenant_list.iter().chain(self.routing.candidates.iter()) {
            if !candidates.contains(model) {
                candidates.push(model.clone());
            }
        }
        if candidates.is_empty() {
            candidates.push(self.effective_default_model(tenant).to_string());
        }
        candidates
    }

    /// The tenant's allow-list, if it has a non-empty one.
    pub fn allowed_models(&self, tenant: Option<&str>) -> Option<&[String]> {
        tenant
            .and_then(|t| self.routing.tenants.get(t))
            .map(|o| o.allowed_models.as_slice())
            .filter(|list| !list.is_empty())
    }

    /// Per-request ceiling, honouring a tenant override.
    pub fn max_per_request(&self, tenant: Option<&str>) -> f64 {
        tenant
            .and_then(|t| self.routing.tenants.get(t))
            .and_then(|o| o.max_per_request)
            .unwrap_or(self.budget.limits.max_per_request)
    }
}
