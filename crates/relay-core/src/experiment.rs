//! Experiments and shadow evaluation.
//!
//! An experiment splits traffic between a control arm and weighted
//! variants by hashing a stable key. Experiments start in
//! [`Phase::Shadow`]: allocation is still computed, so a key maps to the
//! same variant once the experiment goes live, but control is what gets
//! served. Shadow experiments flip to [`Phase::Active`] on their own once
//! control has collected `auto_activate_after` pulls.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::policy::AdvancedDiagnostics;

/// Errors from the experiment manager.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExperimentError {
    #[error("Experiment not found: {0}")]
    NotFound(String),

    #[error("Experiment already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid experiment '{id}': {message}")]
    Invalid { id: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Shadow,
    Active,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantConfig {
    pub name: String,
    /// Share of traffic in `[0, 1]`.
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub control: String,
    #[serde(default)]
    pub variants: Vec<VariantConfig>,
    #[serde(default)]
    pub phase: Phase,
    /// Control pulls after which a shadow experiment activates itself.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_activate_after: Option<u64>,
    /// Arm regret is measured against; defaults to control.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline: Option<String>,
}

impl ExperimentConfig {
    pub fn new(control: impl Into<String>) -> Self {
        Self {
            control: control.into(),
            variants: Vec::new(),
            phase: Phase::Shadow,
            auto_activate_after: None,
            baseline: None,
        }
    }

    pub fn variant(mut self, name: impl Into<String>, weight: f64) -> Self {
        self.variants.push(VariantConfig {
            name: name.into(),
            weight,
        });
        self
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    pub fn auto_activate_after(mut self, pulls: u64) -> Self {
        self.auto_activate_after = Some(pulls);
        self
    }

    pub fn validate(&self, id: &str) -> Result<(), ExperimentError> {
        let invalid = |message: String| ExperimentError::Invalid {
            id: id.to_string(),
            message,
        };
        if self.control.is_empty() {
            return Err(invalid("control arm name is empty".into()));
        }
        let mut total = 0.0;
        for v in &self.variants {
            if !(0.0..=1.0).contains(&v.weight) {
                return Err(invalid(format!("variant '{}' weight {} outside [0, 1]", v.name, v.weight)));
            }
            total += v.weight;
        }
        if total > 1.0 + 1e-9 {
            return Err(invalid(format!("variant weights sum to {total} > 1")));
        }
        Ok(())
    }
}

/// Experiment section of the gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentsConfig {
    pub enabled: bool,
    pub definitions: BTreeMap<String, ExperimentConfig>,
}

/// Running means of advanced-policy statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvancedVariantStats {
    pub reward_model_mse_sum: f64,
    pub tree_depth_sum: f64,
    pub importance_weight_sum: f64,
    pub ci_width_sum: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantStats {
    pub pulls: u64,
    pub reward_sum: f64,
    pub last_reward: Option<f64>,
    pub regret_sum: f64,
    pub advanced: AdvancedVariantStats,
}

impl VariantStats {
    pub fn mean_reward(&self) -> f64 {
        self.per_pull(self.reward_sum)
    }

    pub fn mean_regret(&self) -> f64 {
        self.per_pull(self.regret_sum)
    }

    pub fn mean_reward_model_mse(&self) -> f64 {
        self.per_pull(self.advanced.reward_model_mse_sum)
    }

    pub fn mean_tree_depth(&self) -> f64 {
        self.per_pull(self.advanced.tree_depth_sum)
    }

    pub fn mean_importance_weight(&self) -> f64 {
        self.per_pull(self.advanced.importance_weight_sum)
    }

    pub fn mean_ci_width(&self) -> f64 {
        self.per_pull(self.advanced.ci_width_sum)
    }

    fn per_pull(&self, sum: f64) -> f64 {
        if self.pulls == 0 {
            0.0
        } else {
            sum / self.pulls as f64
        }
    }
}

#[derive(Debug, Clone)]
struct Experiment {
    config: ExperimentConfig,
    /// Variants sorted by weight (descending, ties by name).
    boundaries: Vec<(String, f64)>,
    stats: BTreeMap<String, VariantStats>,
}

impl Experiment {
    fn new(config: ExperimentConfig) -> Self {
        let mut sorted = config.variants.clone();
        sorted.sort_by(|a, b| b.weight.total_cmp(&a.weight).then_with(|| a.name.cmp(&b.name)));
        let mut cumulative = 0.0;
        let boundaries = sorted
            .into_iter()
            .map(|v| {
                cumulative += v.weight;
                (v.name, cumulative)
            })
            .collect();
        Self {
            config,
            boundaries,
            stats: BTreeMap::new(),
        }
    }

    fn hashed_choice(&self, id: &str, key: &str) -> &str {
        let point = unit_interval(&format!("{}:{}", id, key));
        self.boundaries
            .iter()
            .find(|(_, bound)| point < *bound)
            .map(|(name, _)| name.as_str())
            .unwrap_or(self.config.control.as_str())
    }

    fn baseline(&self) -> &str {
        self.config
            .baseline
            .as_deref()
            .unwrap_or(self.config.control.as_str())
    }
}

/// Summary of one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub id: String,
    pub phase: Phase,
    pub control: String,
    pub total_pulls: u64,
    pub variants: BTreeMap<String, VariantStats>,
}

/// Thread-safe registry of experiments.
#[derive(Debug, Default)]
pub struct ExperimentManager {
    experiments: RwLock<BTreeMap<String, Experiment>>,
}

impl ExperimentManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager pre-populated from configuration.
    pub fn from_config(config: &ExperimentsConfig) -> Result<Self, ExperimentError> {
        let manager = Self::new();
        if config.enabled {
            for (id, definition) in &config.definitions {
                manager.create(id, definition.clone())?;
            }
        }
        Ok(manager)
    }

    pub fn create(&self, id: &str, config: ExperimentConfig) -> Result<(), ExperimentError> {
        config.validate(id)?;
        let mut experiments = self.experiments.write();
        if experiments.contains_key(id) {
            return Err(ExperimentError::AlreadyExists(id.to_string()));
        }
        info!(experiment = id, phase = ?config.phase, variants = config.variants.len(), "experiment created");
        experiments.insert(id.to_string(), Experiment::new(config));
        Ok(())
    }

    /// The arm to serve for `key`: the hashed choice when active, control in shadow.
    pub fn allocate(&self, id: &str, key: &str) -> Option<String> {
        let experiments = self.experiments.read();
        let experiment = experiments.get(id)?;
        let hashed = experiment.hashed_choice(id, key);
        match experiment.config.phase {
            Phase::Active => Some(hashed.to_string()),
            Phase::Shadow => {
                debug!(experiment = id, shadow_choice = hashed, "shadow allocation");
                Some(experiment.config.control.clone())
            }
        }
    }

    /// The arm `key` hashes to, regardless of phase.
    pub fn allocate_hashed(&self, id: &str, key: &str) -> Option<String> {
        let experiments = self.experiments.read();
        experiments
            .get(id)
            .map(|e| e.hashed_choice(id, key).to_string())
    }

    /// The arm an observed `action` counts against: the variant of that name, else control.
    pub fn arm_for(&self, id: &str, action: &str) -> Option<String> {
        let experiments = self.experiments.read();
        let experiment = experiments.get(id)?;
        if experiment.config.variants.iter().any(|v| v.name == action) {
            Some(action.to_string())
        } else {
            Some(experiment.config.control.clone())
        }
    }

    /// Record a reward for `variant`. Returns the phase after recording.
    pub fn record(&self, id: &str, variant: &str, reward: f64) -> Result<Phase, ExperimentError> {
        self.record_inner(id, variant, reward, None)
    }

    /// Like [`record`](Self::record), also accumulating advanced-policy statistics.
    pub fn record_advanced(
        &self,
        id: &str,
        variant: &str,
        reward: f64,
        diagnostics: &AdvancedDiagnostics,
    ) -> Result<Phase, ExperimentError> {
        self.record_inner(id, variant, reward, Some(diagnostics))
    }

    fn record_inner(
        &self,
        id: &str,
        variant: &str,
        reward: f64,
        diagnostics: Option<&AdvancedDiagnostics>,
    ) -> Result<Phase, ExperimentError> {
        let mut experiments = self.experiments.write();
        let experiment = experiments
            .get_mut(id)
            .ok_or_else(|| ExperimentError::NotFound(id.to_string()))?;

        // Regret uses the baseline mean before this observation; no estimate, no regret.
        let regret = experiment
            .stats
            .get(experiment.baseline())
            .filter(|s| s.pulls > 0)
            .map(|s| (s.mean_reward() - reward).max(0.0))
            .unwrap_or(0.0);

        let stats = experiment.stats.entry(variant.to_string()).or_default();
        stats.pulls += 1;
        stats.reward_sum += reward;
        stats.last_reward = Some(reward);
        stats.regret_sum += regret;
        if let Some(d) = diagnostics {
            let adv = &mut stats.advanced;
            adv.reward_model_mse_sum += d.reward_model_mse.unwrap_or(0.0);
            adv.tree_depth_sum += d.tree_depth.unwrap_or(0.0);
            adv.importance_weight_sum += d.importance_weight.unwrap_or(0.0);
            adv.ci_width_sum += d.ci_width.unwrap_or(0.0);
        }

        if experiment.config.phase == Phase::Shadow {
            if let Some(threshold) = experiment.config.auto_activate_after {
                let control_pulls = experiment
                    .stats
                    .get(&experiment.config.control)
                    .map(|s| s.pulls)
                    .unwrap_or(0);
                if control_pulls >= threshold {
                    experiment.config.phase = Phase::Active;
                    info!(experiment = id, control_pulls, "experiment auto-activated");
                }
            }
        }
        Ok(experiment.config.phase)
    }

    pub fn phase(&self, id: &str) -> Option<Phase> {
        self.experiments.read().get(id).map(|e| e.config.phase)
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.phase(id) == Some(Phase::Active)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.experiments.read().contains_key(id)
    }

    pub fn activate(&self, id: &str) -> Result<(), ExperimentError> {
        let mut experiments = self.experiments.write();
        let experiment = experiments
            .get_mut(id)
            .ok_or_else(|| ExperimentError::NotFound(id.to_string()))?;
        experiment.config.phase = Phase::Active;
        info!(experiment = id, "experiment activated");
        Ok(())
    }

    pub fn remove(&self, id: &str) -> bool {
        self.experiments.write().remove(id).is_some()
    }

    pub fn ids(&self) -> Vec<String> {
        self.experiments.read().keys().cloned().collect()
    }

    pub fn summary(&self, id: &str) -> Option<ExperimentSummary> {
        let experiments = self.experiments.read();
        let experiment = experiments.get(id)?;
        Some(ExperimentSummary {
            id: id.to_string(),
            phase: experiment.config.phase,
            control: experiment.config.control.clone(),
            total_pulls: experiment.stats.values().map(|s| s.pulls).sum(),
            variants: experiment.stats.clone(),
        })
    }
}

/// Deterministic 64-bit hash: FNV-1a followed by a SplitMix64 finaliser.
pub fn stable_hash64(s: &str) -> u64 {
    splitmix64(crate::features::fnv1a(s.as_bytes()))
}

/// [`stable_hash64`] mapped into `[0, 1)` using its top 53 bits.
pub fn unit_interval(s: &str) -> f64 {
    (stable_hash64(s) >> 11) as f64 / (1u64 << 53) as f64
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn manager_with(config: ExperimentConfig) -> ExperimentManager {
        let manager = ExperimentManager::new();
        manager.create("exp", config).unwrap();
        manager
    }

    #[test]
    fn test_shadow_serves_control_but_hashes() {
        let manager = manager_with(ExperimentConfig::new("control").variant("fast", 1.0));
        assert_eq!(manager.allocate("exp", "user-1").as_deref(), Some("control"));
        assert_eq!(manager.allocate_hashed("exp", "user-1").as_deref(), Some("fast"));

        manager.activate("exp").unwrap();
        assert_eq!(manager.allocate("exp", "user-1").as_deref(), Some("fast"));
    }

    #[test]
    fn test_unassigned_mass_stays_with_control() {
        let manager = manager_with(
            ExperimentConfig::new("control")
                .variant("a", 0.2)
                .variant("b", 0.1)
                .phase(Phase::Active),
        );
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for i in 0..10_000 {
            let arm = manager.allocate("exp", &format!("key-{i}")).unwrap();
            *counts.entry(arm).or_default() += 1;
        }
        let share = |name: &str| counts.get(name).copied().unwrap_or(0) as f64 / 10_000.0;
        assert!((share("a") - 0.2).abs() < 0.03);
        assert!((share("b") - 0.1).abs() < 0.03);
        assert!((share("control") - 0.7).abs() < 0.03);
    }

    #[test]
    fn test_auto_activation_exactly_at_threshold() {
        let manager = manager_with(ExperimentConfig::new("control").variant("v", 0.5).auto_activate_after(3));
        assert_eq!(manager.record("exp", "control", 0.5).unwrap(), Phase::Shadow);
        assert_eq!(manager.record("exp", "v", 0.5).unwrap(), Phase::Shadow);
        assert_eq!(manager.record("exp", "control", 0.5).unwrap(), Phase::Shadow);
        assert_eq!(manager.record("exp", "control", 0.5).unwrap(), Phase::Active);
    }

    #[test]
    fn test_regret_against_control_mean() {
        let manager = manager_with(ExperimentConfig::new("control").variant("v", 0.5));
        manager.record("exp", "control", 0.8).unwrap();
        manager.record("exp", "v", 0.5).unwrap();
        manager.record("exp", "v", 0.9).unwrap();

        let summary = manager.summary("exp").unwrap();
        let v = &summary.variants["v"];
        assert_eq!(v.pulls, 2);
        assert!((v.regret_sum - 0.3).abs() < 1e-12);
        assert_eq!(v.last_reward, Some(0.9));
        assert!((v.mean_reward() - 0.7).abs() < 1e-12);
        assert_eq!(summary.total_pulls, 3);
    }

    #[test]
    fn test_advanced_stats_are_running_means() {
        let manager = manager_with(ExperimentConfig::new("control"));
        let diag = |mse: f64, w: f64| AdvancedDiagnostics {
            reward_model_mse: Some(mse),
            tree_depth: Some(2.0),
            importance_weight: Some(w),
            ci_width: None,
        };
        manager.record_advanced("exp", "control", 1.0, &diag(0.1, 2.0)).unwrap();
        manager.record_advanced("exp", "control", 1.0, &diag(0.3, 4.0)).unwrap();
        let stats = &manager.summary("exp").unwrap().variants["control"];
        assert!((stats.mean_reward_model_mse() - 0.2).abs() < 1e-12);
        assert!((stats.mean_importance_weight() - 3.0).abs() < 1e-12);
        assert!((stats.mean_tree_depth() - 2.0).abs() < 1e-12);
        assert_eq!(stats.mean_ci_width(), 0.0);
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let manager = ExperimentManager::new();
        let err = manager
            .create("bad", ExperimentConfig::new("c").variant("a", 0.7).variant("b", 0.6))
            .unwrap_err();
        assert!(matches!(err, ExperimentError::Invalid { .. }));
        assert!(manager.record("missing", "a", 1.0).is_err());
    }

    #[test]
    fn test_stable_hash_known_properties() {
        assert_eq!(stable_hash64("abc"), stable_hash64("abc"));
        assert_ne!(stable_hash64("abc"), stable_hash64("abd"));
        let u = unit_interval("anything");
        assert!((0.0..1.0).contains(&u));
    }

    proptest! {
        #[test]
        fn prop_allocation_is_stable(key in "[a-z0-9]{1,24}", w in 0.0f64..1.0) {
            let config = ExperimentConfig::new("control").variant("v", w).phase(Phase::Active);
            let first = manager_with(config.clone()).allocate("exp", &key);
            let second = manager_with(config).allocate("exp", &key);
            prop_assert_eq!(first.clone(), second);
            let manager = manager_with(ExperimentConfig::new("control").variant("v", w).phase(Phase::Active));
            for _ in 0..3 {
                prop_assert_eq!(manager.allocate("exp", &key), first.clone());
            }
        }
    }
}
