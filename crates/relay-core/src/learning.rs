//! Per-domain online learning.
//!
//! The engine keeps one bandit policy per domain. Each policy sits behind
//! its own mutex, so requests in different domains never contend, and the
//! domain map itself is only write-locked when a domain is first seen.
//!
//! When an experiment named `policy::{domain}` is active, allocation is
//! delegated to it; a variant that is not among the request's candidates
//! (for example a control arm named after the policy) falls through to the
//! registered policy.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::experiment::ExperimentManager;
use crate::features::Context;
use crate::policy::{BanditPolicy, PolicyError, PolicyParams, PolicyRegistry, PolicySnapshot};
use crate::reward::RewardWeights;

/// Context key used as the experiment allocation key when present.
pub const ALLOCATION_KEY: &str = "allocation_key";

/// Context key naming the tenant, used for advanced rollout gating.
pub const TENANT_KEY: &str = "tenant";

#[derive(Error, Debug)]
pub enum LearningError {
    #[error("No candidates supplied for domain '{0}'")]
    NoCandidates(String),

    #[error("Policy error in domain '{domain}': {source}")]
    Policy {
        domain: String,
        #[source]
        source: PolicyError,
    },

    #[error("Invalid learning snapshot: {0}")]
    Snapshot(String),
}

/// Forced-variant flags; the first set flag in priority order wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForcedPolicies {
    pub offset_tree: bool,
    pub doubly_robust: bool,
    pub lin_ts: bool,
    pub lin_ucb: bool,
    pub thompson: bool,
    pub ucb1: bool,
}

/// Gate for the advanced policies (doubly robust, offset tree).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedRollout {
    /// Share of (domain, tenant) pairs admitted, 0-100.
    pub percentage: f64,
    /// Allowed domains; empty admits all.
    pub domains: Vec<String>,
    /// Allowed tenants; empty admits all.
    pub tenants: Vec<String>,
}

impl Default for AdvancedRollout {
    fn default() -> Self {
        Self {
            percentage: 100.0,
            domains: Vec::new(),
            tenants: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub policy: String,
    pub params: PolicyParams,
    pub force: ForcedPolicies,
    pub rollout: AdvancedRollout,
    pub reward_weights: RewardWeights,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            policy: "epsilon_greedy".to_string(),
            params: PolicyParams::default(),
            force: ForcedPolicies::default(),
            rollout: AdvancedRollout::default(),
            reward_weights: RewardWeights::default(),
        }
    }
}

/// Prior belief about one arm, worth `weight` observations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArmPrior {
    pub mean: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationSource {
    Policy,
    Experiment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub action: String,
    pub source: RecommendationSource,
}

/// Persisted form: `{domain: {policy, version, ...state}}`.
pub type LearningSnapshot = BTreeMap<String, PolicySnapshot>;

/// Result of applying a [`LearningSnapshot`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreReport {
    pub restored: Vec<String>,
    pub skipped: Vec<String>,
}

type SharedPolicy = Arc<Mutex<Box<dyn BanditPolicy>>>;

pub struct LearningEngine {
    config: LearningConfig,
    registry: PolicyRegistry,
    experiments: Option<Arc<ExperimentManager>>,
    domains: RwLock<HashMap<String, SharedPolicy>>,
}

impl std::fmt::Debug for LearningEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LearningEngine")
            .field("policy", &self.config.policy)
            .field("domains", &self.domains())
            .finish()
    }
}

impl LearningEngine {
    pub fn new(config: LearningConfig) -> Self {
        Self::with_registry(config, PolicyRegistry::with_builtins())
    }

    pub fn with_registry(config: LearningConfig, registry: PolicyRegistry) -> Self {
        Self {
            config,
            registry,
            experiments: None,
            domains: RwLock::new(HashMap::new()),
        }
    }

    /// Attach an experiment manager for `policy::{domain}` experiments.
    pub fn with_experiments(mut self, experiments: Arc<ExperimentManager>) -> Self {
        self.experiments = Some(experiments);
        self
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    pub fn experiments(&self) -> Option<&Arc<ExperimentManager>> {
        self.experiments.as_ref()
    }

    /// Experiment id consulted for `domain`.
    pub fn experiment_id(domain: &str) -> String {
        format!("policy::{}", domain)
    }

    /// Register `domain`, replacing any existing policy. Returns the policy name used.
    ///
    /// With `policy = None` the name is resolved from configuration.
    pub fn register_domain(&self, domain: &str, policy: Option<&str>) -> String {
        self.register_domain_with_priors(domain, policy, &BTreeMap::new())
    }

    pub fn register_domain_with_priors(
        &self,
        domain: &str,
        policy: Option<&str>,
        priors: &BTreeMap<String, ArmPrior>,
    ) -> String {
        let mut instance = self.build_policy(domain, policy, None);
        for (action, prior) in priors {
            instance.set_prior(action, prior.mean, prior.weight);
        }
        let name = instance.name().to_string();
        self.domains
            .write()
            .insert(domain.to_string(), Arc::new(Mutex::new(instance)));
        info!(domain, policy = %name, priors = priors.len(), "domain registered");
        name
    }

    fn build_policy(&self, domain: &str, policy: Option<&str>, tenant: Option<&str>) -> Box<dyn BanditPolicy> {
        let name = match policy {
            Some(name) => name.to_string(),
            None => self.registry.resolve_name(&self.config, domain, tenant),
        };
        self.registry.create_or_default(&name, &self.config.params)
    }

    fn policy_for(&self, domain: &str, context: &Context) -> SharedPolicy {
        if let Some(policy) = self.domains.read().get(domain) {
            return policy.clone();
        }
        let mut domains = self.domains.write();
        domains
            .entry(domain.to_string())
            .or_insert_with(|| {
                let policy = self.build_policy(domain, None, context.text(TENANT_KEY));
                debug!(domain, policy = policy.name(), "domain registered lazily");
                Arc::new(Mutex::new(policy))
            })
            .clone()
    }

    /// Choose an action for `domain` among `candidates`.
    pub fn recommend(
        &self,
        domain: &str,
        context: &Context,
        candidates: &[String],
    ) -> Result<Recommendation, LearningError> {
        if candidates.is_empty() {
            return Err(LearningError::NoCandidates(domain.to_string()));
        }

        if let Some(experiments) = &self.experiments {
            let id = Self::experiment_id(domain);
            if experiments.is_active(&id) {
                let key = context
                    .text(ALLOCATION_KEY)
                    .map(str::to_string)
                    .unwrap_or_else(|| context.canonical_key());
                match experiments.allocate(&id, &key) {
                    Some(variant) if candidates.contains(&variant) => {
                        debug!(domain, variant = %variant, "experiment allocation");
                        return Ok(Recommendation {
                            action: variant,
                            source: RecommendationSource::Experiment,
                        });
                    }
                    Some(variant) => {
                        debug!(domain, variant = %variant, "experiment arm not a candidate, using policy");
                    }
                    None => {}
                }
            }
        }

        let policy = self.policy_for(domain, context);
        let action = policy
            .lock()
            .recommend(context, candidates)
            .map_err(|source| LearningError::Policy {
                domain: domain.to_string(),
                source,
            })?;
        Ok(Recommendation {
            action,
            source: RecommendationSource::Policy,
        })
    }

    /// Feed `reward` for `action` back to the domain's policy and experiment.
    pub fn record(&self, domain: &str, context: &Context, action: &str, reward: f64) {
        let policy = self.policy_for(domain, context);
        let diagnostics = {
            let mut policy = policy.lock();
            policy.update(action, reward, context);
            policy.diagnostics()
        };

        let Some(experiments) = &self.experiments else {
            return;
        };
        let id = Self::experiment_id(domain);
        let Some(arm) = experiments.arm_for(&id, action) else {
            return;
        };
        let result = match diagnostics {
            Some(d) => experiments.record_advanced(&id, &arm, reward, &d),
            None => experiments.record(&id, &arm, reward),
        };
        if let Err(e) = result {
            warn!(domain, error = %e, "failed to record experiment reward");
        }
    }

    /// Export every domain's policy state.
    pub fn snapshot(&self) -> LearningSnapshot {
        self.domains
            .read()
            .iter()
            .map(|(domain, policy)| (domain.clone(), policy.lock().export_state()))
            .collect()
    }

    /// Apply a snapshot. Entries that do not apply are skipped, never partially imported.
    pub fn restore(&self, snapshot: &LearningSnapshot) -> RestoreReport {
        let mut report = RestoreReport::default();
        for (domain, state) in snapshot {
            let existing = self.domains.read().get(domain).cloned();
            let applied = match existing {
                Some(policy) => policy.lock().import_state(state),
                None => {
                    let mut policy = self.registry.create_or_default(&state.policy, &self.config.params);
                    if policy.import_state(state) {
                        self.domains
                            .write()
                            .insert(domain.clone(), Arc::new(Mutex::new(policy)));
                        true
                    } else {
                        false
                    }
                }
            };
            if applied {
                report.restored.push(domain.clone());
            } else {
                warn!(domain = %domain, policy = %state.policy, version = state.version, "snapshot entry ignored");
                report.skipped.push(domain.clone());
            }
        }
        report
    }

    pub fn snapshot_json(&self) -> Result<String, LearningError> {
        serde_json::to_string_pretty(&self.snapshot()).map_err(|e| LearningError::Snapshot(e.to_string()))
    }

    pub fn restore_json(&self, json: &str) -> Result<RestoreReport, LearningError> {
        let snapshot: LearningSnapshot =
            serde_json::from_str(json).map_err(|e| LearningError::Snapshot(e.to_string()))?;
        Ok(self.restore(&snapshot))
    }

    pub fn domains(&self) -> Vec<String> {
        let mut names: Vec<String> = self.domains.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn policy_name(&self, domain: &str) -> Option<String> {
        self.domains
            .read()
            .get(domain)
            .map(|p| p.lock().name().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{ExperimentConfig, Phase};
    use std::collections::BTreeSet;

    fn candidates(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn seeded(policy: &str) -> LearningConfig {
        let mut config = LearningConfig {
            policy: policy.to_string(),
            ..Default::default()
        };
        config.params.seed = Some(42);
        config
    }

    #[test]
    fn test_empty_candidates_is_an_error() {
        let engine = LearningEngine::new(seeded("ucb1"));
        let err = engine.recommend("d", &Context::new(), &[]).unwrap_err();
        assert!(matches!(err, LearningError::NoCandidates(_)));
    }

    #[test]
    fn test_ucb1_domain_explores_all_arms_first() {
        let engine = LearningEngine::new(seeded("ucb1"));
        let ctx = Context::new();
        let arms = candidates(&["a", "b", "c"]);
        let mut seen = BTreeSet::new();
        for _ in 0..3 {
            let rec = engine.recommend("routing", &ctx, &arms).unwrap();
            engine.record("routing", &ctx, &rec.action, 0.5);
            seen.insert(rec.action);
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(engine.policy_name("routing").as_deref(), Some("ucb1"));
    }

    #[test]
    fn test_unknown_policy_registers_epsilon_greedy() {
        let engine = LearningEngine::new(seeded("mystery"));
        assert_eq!(engine.register_domain("d", None), "epsilon_greedy");
        assert_eq!(engine.register_domain("e", Some("nope")), "epsilon_greedy");
    }

    #[test]
    fn test_replay_is_deterministic() {
        let run = || {
            let engine = LearningEngine::new(seeded("thompson"));
            let ctx = Context::new().with("tokens", 120.0);
            let arms = candidates(&["a", "b", "c"]);
            for i in 0..50 {
                let rec = engine.recommend("d", &ctx, &arms).unwrap();
                engine.record("d", &ctx, &rec.action, (i % 5) as f64 / 4.0);
            }
            serde_json::to_value(engine.snapshot()).unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_priors_bias_initial_choice() {
        let engine = LearningEngine::new(LearningConfig {
            policy: "epsilon_greedy".into(),
            params: PolicyParams {
                epsilon: 0.0,
                ..Default::default()
            },
            ..Default::default()
        });
        let mut priors = BTreeMap::new();
        priors.insert("b".to_string(), ArmPrior { mean: 0.9, weight: 5.0 });
        engine.register_domain_with_priors("d", None, &priors);
        let rec = engine.recommend("d", &Context::new(), &candidates(&["a", "b"])).unwrap();
        assert_eq!(rec.action, "b");
    }

    #[test]
    fn test_active_experiment_overrides_policy() {
        let experiments = Arc::new(ExperimentManager::new());
        experiments
            .create(
                "policy::d",
                ExperimentConfig::new("policy").variant("b", 1.0).phase(Phase::Active),
            )
            .unwrap();
        let engine = LearningEngine::new(seeded("ucb1")).with_experiments(experiments.clone());
        let ctx = Context::new().with(ALLOCATION_KEY, "user-7");

        let rec = engine.recommend("d", &ctx, &candidates(&["a", "b"])).unwrap();
        assert_eq!(rec.action, "b");
        assert_eq!(rec.source, RecommendationSource::Experiment);

        // variant not offered: the policy decides
        let rec = engine.recommend("d", &ctx, &candidates(&["a", "c"])).unwrap();
        assert_eq!(rec.source, RecommendationSource::Policy);

        engine.record("d", &ctx, "b", 0.7);
        let summary = experiments.summary("policy::d").unwrap();
        assert_eq!(summary.variants["b"].pulls, 1);
    }

    #[test]
    fn test_shadow_experiment_counts_control_and_activates() {
        let experiments = Arc::new(ExperimentManager::new());
        experiments
            .create(
                "policy::d",
                ExperimentConfig::new("policy").variant("b", 1.0).auto_activate_after(2),
            )
            .unwrap();
        let engine = LearningEngine::new(seeded("epsilon_greedy")).with_experiments(experiments.clone());
        let ctx = Context::new();

        // shadow: policy serves, rewards land on control
        let rec = engine.recommend("d", &ctx, &candidates(&["a", "b"])).unwrap();
        assert_eq!(rec.source, RecommendationSource::Policy);
        engine.record("d", &ctx, "a", 0.5);
        assert_eq!(experiments.phase("policy::d"), Some(Phase::Shadow));
        engine.record("d", &ctx, "a", 0.5);
        assert_eq!(experiments.phase("policy::d"), Some(Phase::Active));
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let engine = LearningEngine::new(seeded("ucb1"));
        let ctx = Context::new();
        engine.record("d", &ctx, "a", 1.0);
        engine.record("d", &ctx, "b", 0.0);
        let json = engine.snapshot_json().unwrap();

        let restored = LearningEngine::new(seeded("ucb1"));
        let report = restored.restore_json(&json).unwrap();
        assert_eq!(report.restored, vec!["d".to_string()]);
        assert_eq!(
            serde_json::to_value(restored.snapshot()).unwrap(),
            serde_json::to_value(engine.snapshot()).unwrap()
        );
    }

    #[test]
    fn test_future_version_is_ignored() {
        let engine = LearningEngine::new(seeded("ucb1"));
        let ctx = Context::new();
        engine.record("d", &ctx, "a", 1.0);
        let before = serde_json::to_value(engine.snapshot()).unwrap();

        let json = r#"{"d": {"policy": "ucb1", "version": 99, "arms": {}}}"#;
        let report = engine.restore_json(json).unwrap();
        assert_eq!(report.skipped, vec!["d".to_string()]);
        assert_eq!(serde_json::to_value(engine.snapshot()).unwrap(), before);
    }

    #[test]
    fn test_malformed_snapshot_is_an_error_not_a_panic() {
        let engine = LearningEngine::new(LearningConfig::default());
        assert!(matches!(
            engine.restore_json("not json"),
            Err(LearningError::Snapshot(_))
        ));
    }
}
