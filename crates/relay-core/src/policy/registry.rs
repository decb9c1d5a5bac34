//! Name → constructor table for bandit policies.
//!
//! The table is filled once at startup; resolving a policy afterwards is a
//! map lookup.
//!
//! ```ignore
//! let registry = PolicyRegistry::with_builtins();
//! let name = registry.resolve_name(&learning_config, "model_routing", Some("acme"));
//! let policy = registry.create_or_default(&name, &learning_config.params);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{
    doubly_robust, epsilon_greedy, linear, offset_tree, thompson, ucb1, BanditPolicy,
    DoublyRobust, EpsilonGreedy, LinThompson, LinUcb, OffsetTree, PolicyError, PolicyParams,
    ThompsonSampling, Ucb1,
};
use crate::experiment::unit_interval;
use crate::learning::LearningConfig;

/// Builds a fresh policy from shared parameters.
pub type PolicyConstructor = Arc<dyn Fn(&PolicyParams) -> Box<dyn BanditPolicy> + Send + Sync>;

/// Policies gated behind the advanced rollout settings.
pub const ADVANCED_POLICIES: &[&str] = &[doubly_robust::NAME, offset_tree::NAME];

#[derive(Default, Clone)]
pub struct PolicyRegistry {
    constructors: BTreeMap<String, PolicyConstructor>,
}

impl std::fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyRegistry")
            .field("policies", &self.names())
            .finish()
    }
}

impl PolicyRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in policy.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(epsilon_greedy::NAME, |p| {
            Box::new(EpsilonGreedy::new(p.epsilon, p.seed))
        });
        registry.register(ucb1::NAME, |_| Box::new(Ucb1::new()));
        registry.register(thompson::NAME, |p| Box::new(ThompsonSampling::new(p.seed)));
        registry.register(linear::LIN_UCB, |p| Box::new(LinUcb::new(&p.linear)));
        registry.register(linear::LIN_TS, |p| Box::new(LinThompson::new(&p.linear, p.seed)));
        registry.register(doubly_robust::NAME, |p| {
            Box::new(DoublyRobust::new(p.doubly_robust.clone(), p.seed))
        });
        registry.register(offset_tree::NAME, |p| {
            Box::new(OffsetTree::new(p.offset_tree.clone(), p.seed))
        });
        registry
    }

    /// Register (or replace) a constructor.
    ///
    /// External learners are added this way, typically under the name
    /// `"external"` wrapping an [`super::ExternalPolicyAdapter`].
    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&PolicyParams) -> Box<dyn BanditPolicy> + Send + Sync + 'static,
    {
        self.constructors.insert(name.to_string(), Arc::new(constructor));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(|s| s.as_str()).collect()
    }

    /// Construct a policy by name.
    pub fn create(&self, name: &str, params: &PolicyParams) -> Result<Box<dyn BanditPolicy>, PolicyError> {
        self.constructors
            .get(name)
            .map(|ctor| ctor(params))
            .ok_or_else(|| PolicyError::UnknownPolicy(name.to_string()))
    }

    /// Construct a policy by name, falling back to epsilon-greedy.
    pub fn create_or_default(&self, name: &str, params: &PolicyParams) -> Box<dyn BanditPolicy> {
        match self.create(name, params) {
            Ok(policy) => policy,
            Err(e) => {
                tracing::warn!(policy = name, error = %e, "falling back to epsilon_greedy");
                Box::new(EpsilonGreedy::new(params.epsilon, params.seed))
            }
        }
    }

    /// Decide which policy name a domain should run.
    ///
    /// Forced flags win in the order offset tree, doubly robust, linear
    /// Thompson, LinUCB, Thompson, UCB1. Otherwise the configured name is
    /// used. Advanced policies that fail the rollout gate run Thompson
    /// sampling instead.
    pub fn resolve_name(&self, config: &LearningConfig, domain: &str, tenant: Option<&str>) -> String {
        let force = &config.force;
        let forced = [
            (force.offset_tree, offset_tree::NAME),
            (force.doubly_robust, doubly_robust::NAME),
            (force.lin_ts, linear::LIN_TS),
            (force.lin_ucb, linear::LIN_UCB),
            (force.thompson, thompson::NAME),
            (force.ucb1, ucb1::NAME),
        ]
        .into_iter()
        .find(|(flag, _)| *flag)
        .map(|(_, name)| name);

        let name = forced.unwrap_or(config.policy.as_str());

        if ADVANCED_POLICIES.contains(&name) && !advanced_allowed(config, domain, tenant) {
            tracing::debug!(policy = name, domain, "advanced policy outside rollout, using thompson");
            return thompson::NAME.to_string();
        }
        if !self.contains(name) {
            tracing::warn!(policy = name, domain, "unknown policy, using epsilon_greedy");
            return epsilon_greedy::NAME.to_string();
        }
        name.to_string()
    }
}

fn advanced_allowed(config: &LearningConfig, domain: &str, tenant: Option<&str>) -> bool {
    let rollout = &config.rollout;
    if !rollout.domains.is_empty() && !rollout.domains.iter().any(|d| d == domain) {
        return false;
    }
    if !rollout.tenants.is_empty() {
        match tenant {
            Some(t) if rollout.tenants.iter().any(|allowed| allowed == t) => {}
            _ => return false,
        }
    }
    let key = format!("rollout:{}:{}", domain, tenant.unwrap_or(""));
    unit_interval(&key) * 100.0 < rollout.percentage
}
