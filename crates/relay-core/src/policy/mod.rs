//! Bandit policies for online model selection.
//!
//! Every policy implements [`BanditPolicy`]. Policies are plain synchronous
//! state machines: callers own the mutual exclusion (see the learning
//! engine), and every source of randomness is a seedable [`StdRng`] so a
//! replayed update sequence reproduces the same statistics.
//!
//! ## State snapshots
//!
//! Policies export a [`PolicySnapshot`] tagged with their name and
//! [`STATE_VERSION`]. Import is all-or-nothing: a snapshot from another
//! policy, from a newer version, or with state that does not decode is
//! ignored and the policy keeps its current statistics.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::features::Context;

mod adapter;
mod doubly_robust;
mod epsilon_greedy;
mod linear;
mod offset_tree;
mod registry;
mod thompson;
mod ucb1;

pub use adapter::{ExternalLearner, ExternalPolicyAdapter};
pub use doubly_robust::{DoublyRobust, DoublyRobustConfig};
pub use epsilon_greedy::EpsilonGreedy;
pub use linear::{LinThompson, LinUcb, LinearConfig};
pub use offset_tree::{LeafPolicy, OffsetTree, OffsetTreeConfig, SplitCriterion};
pub use registry::{PolicyConstructor, PolicyRegistry, ADVANCED_POLICIES};
pub use thompson::ThompsonSampling;
pub use ucb1::Ucb1;

/// Version written into every exported snapshot.
pub const STATE_VERSION: u32 = 1;

/// Errors raised by policies.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("No candidates supplied")]
    NoCandidates,

    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    #[error("Policy unavailable: {0}")]
    Unavailable(String),
}

/// Serialized policy state: `{policy, version, <policy-specific fields>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub policy: String,
    pub version: u32,
    #[serde(flatten)]
    pub state: Map<String, Value>,
}

impl PolicySnapshot {
    /// Snapshot of `state` at the current version.
    ///
    /// Non-object state is stored under a `state` key.
    pub fn new<S: Serialize>(policy: &str, state: &S) -> Self {
        let state = match serde_json::to_value(state) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                let mut map = Map::new();
                map.insert("state".to_string(), other);
                map
            }
            Err(_) => Map::new(),
        };
        Self {
            policy: policy.to_string(),
            version: STATE_VERSION,
            state,
        }
    }

    /// Decode the state if it belongs to `policy` and is not from a newer version.
    pub fn decode<S: DeserializeOwned>(&self, policy: &str) -> Option<S> {
        if self.policy != policy || self.version > STATE_VERSION {
            return None;
        }
        serde_json::from_value(Value::Object(self.state.clone())).ok()
    }
}

/// Per-update statistics exposed by the advanced policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvancedDiagnostics {
    pub reward_model_mse: Option<f64>,
    pub tree_depth: Option<f64>,
    pub importance_weight: Option<f64>,
    pub ci_width: Option<f64>,
}

/// A multi-armed bandit policy over string-named actions.
///
/// Arms are created lazily the first time they appear in a candidate list
/// or an update, so the candidate set may change between calls.
pub trait BanditPolicy: Send {
    /// Registered policy name (e.g. `"thompson"`).
    fn name(&self) -> &'static str;

    /// Choose one of `candidates` for `context`.
    fn recommend(&mut self, context: &Context, candidates: &[String])
        -> Result<String, PolicyError>;

    /// Feed back the reward observed for `action`.
    fn update(&mut self, action: &str, reward: f64, context: &Context);

    /// Export internal statistics.
    fn export_state(&self) -> PolicySnapshot;

    /// Replace internal statistics from a snapshot.
    ///
    /// Returns `false` (state untouched) when the snapshot is not applicable.
    fn import_state(&mut self, snapshot: &PolicySnapshot) -> bool;

    /// Seed an arm with a prior mean worth `weight` observations.
    fn set_prior(&mut self, _action: &str, _mean: f64, _weight: f64) {}

    /// Statistics from the most recent update, for advanced policies.
    fn diagnostics(&self) -> Option<AdvancedDiagnostics> {
        None
    }
}

/// Construction parameters shared by the built-in policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyParams {
    /// Exploration probability for epsilon-greedy style policies.
    pub epsilon: f64,

    /// Seed for the policy random source; entropy-seeded when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    pub linear: LinearConfig,
    pub doubly_robust: DoublyRobustConfig,
    pub offset_tree: OffsetTreeConfig,
}

impl Default for PolicyParams {
    fn default() -> Self {
        Self {
            epsilon: 0.1,
            seed: None,
            linear: LinearConfig::default(),
            doubly_robust: DoublyRobustConfig::default(),
            offset_tree: OffsetTreeConfig::default(),
        }
    }
}

pub(crate) fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

pub(crate) fn ensure_candidates(candidates: &[String]) -> Result<(), PolicyError> {
    if candidates.is_empty() {
        Err(PolicyError::NoCandidates)
    } else {
        Ok(())
    }
}

/// Running mean with a pull count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ArmStats {
    pub pulls: u64,
    pub mean: f64,
}

impl ArmStats {
    pub fn update(&mut self, reward: f64) {
        self.pulls += 1;
        self.mean += (reward - self.mean) / self.pulls as f64;
    }
}

/// Index of the first maximum; ties go to the earliest candidate.
pub(crate) fn argmax<I: IntoIterator<Item = f64>>(scores: I) -> usize {
    let mut best = 0;
    let mut best_score = f64::NEG_INFINITY;
    for (i, score) in scores.into_iter().enumerate() {
        if score > best_score {
            best = i;
            best_score = score;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_round_trip_through_json() {
        let stats = ArmStats { pulls: 3, mean: 0.5 };
        let snapshot = PolicySnapshot::new("demo", &stats);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["policy"], "demo");
        assert_eq!(json["version"], 1);
        assert_eq!(json["pulls"], 3);

        let back: PolicySnapshot = serde_json::from_value(json).unwrap();
        let decoded: ArmStats = back.decode("demo").unwrap();
        assert_eq!(decoded, stats);
    }

    #[test]
    fn test_snapshot_rejects_newer_version_and_other_policy() {
        let mut snapshot = PolicySnapshot::new("demo", &ArmStats::default());
        assert!(snapshot.decode::<ArmStats>("other").is_none());
        snapshot.version = STATE_VERSION + 1;
        assert!(snapshot.decode::<ArmStats>("demo").is_none());
    }

    #[test]
    fn test_argmax_prefers_first_tie() {
        assert_eq!(argmax([0.2, 0.7, 0.7, 0.1]), 1);
        assert_eq!(argmax([f64::NEG_INFINITY]), 0);
    }
}
