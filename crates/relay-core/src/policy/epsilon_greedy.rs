//! Epsilon-greedy: explore uniformly with probability ε, otherwise exploit
//! the best running mean.

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{argmax, ensure_candidates, make_rng, ArmStats, BanditPolicy, PolicyError, PolicySnapshot};
use crate::features::Context;

pub(crate) const NAME: &str = "epsilon_greedy";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct State {
    epsilon: f64,
    arms: BTreeMap<String, ArmStats>,
}

#[derive(Debug)]
pub struct EpsilonGreedy {
    state: State,
    rng: StdRng,
}

impl EpsilonGreedy {
    pub fn new(epsilon: f64, seed: Option<u64>) -> Self {
        Self {
            state: State {
                epsilon: epsilon.clamp(0.0, 1.0),
                arms: BTreeMap::new(),
            },
            rng: make_rng(seed),
        }
    }

    pub fn epsilon(&self) -> f64 {
        self.state.epsilon
    }

    pub fn arm(&self, action: &str) -> Option<&ArmStats> {
        self.state.arms.get(action)
    }

    /// Candidate with the highest running mean; unseen arms count as 0.
    pub fn greedy(&self, candidates: &[String]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let idx = argmax(candidates.iter().map(|c| {
            self.state.arms.get(c).map(|a| a.mean).unwrap_or(0.0)
        }));
        Some(candidates[idx].clone())
    }
}

impl BanditPolicy for EpsilonGreedy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn recommend(&mut self, _context: &Context, candidates: &[String]) -> Result<String, PolicyError> {
        ensure_candidates(candidates)?;
        if self.state.epsilon > 0.0 && self.rng.gen::<f64>() < self.state.epsilon {
            let idx = self.rng.gen_range(0..candidates.len());
            return Ok(candidates[idx].clone());
        }
        self.greedy(candidates).ok_or(PolicyError::NoCandidates)
    }

    fn update(&mut self, action: &str, reward: f64, _context: &Context) {
        if !reward.is_finite() {
            return;
        }
        self.state.arms.entry(action.to_string()).or_default().update(reward);
    }

    fn export_state(&self) -> PolicySnapshot {
        PolicySnapshot::new(NAME, &self.state)
    }

    fn import_state(&mut self, snapshot: &PolicySnapshot) -> bool {
        match snapshot.decode::<State>(NAME) {
            Some(state) => {
                self.state = state;
                true
            }
            None => false,
        }
    }

    fn set_prior(&mut self, action: &str, mean: f64, weight: f64) {
        let arm = self.state.arms.entry(action.to_string()).or_default();
        arm.mean = mean;
        arm.pulls = weight.max(0.0).round() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arms(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_zero_epsilon_returns_argmax_mean() {
        let mut policy = EpsilonGreedy::new(0.0, Some(1));
        let ctx = Context::new();
        let candidates = arms(&["a", "b", "c"]);

        policy.update("a", 0.2, &ctx);
        policy.update("b", 0.9, &ctx);
        policy.update("c", 0.5, &ctx);

        for _ in 0..20 {
            assert_eq!(policy.recommend(&ctx, &candidates).unwrap(), "b");
        }
    }

    #[test]
    fn test_zero_epsilon_ties_follow_candidate_order() {
        let mut policy = EpsilonGreedy::new(0.0, Some(1));
        let ctx = Context::new();
        assert_eq!(policy.recommend(&ctx, &arms(&["x", "y"])).unwrap(), "x");
        assert_eq!(policy.recommend(&ctx, &arms(&["y", "x"])).unwrap(), "y");
    }

    #[test]
    fn test_incremental_mean() {
        let mut policy = EpsilonGreedy::new(0.1, Some(1));
        let ctx = Context::new();
        for r in [1.0, 0.0, 0.5] {
            policy.update("a", r, &ctx);
        }
        let arm = policy.arm("a").unwrap();
        assert_eq!(arm.pulls, 3);
        assert!((arm.mean - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_empty_candidates_error() {
        let mut policy = EpsilonGreedy::new(0.1, Some(1));
        assert_eq!(
            policy.recommend(&Context::new(), &[]),
            Err(PolicyError::NoCandidates)
        );
    }

    #[test]
    fn test_full_exploration_visits_every_arm() {
        let mut policy = EpsilonGreedy::new(1.0, Some(42));
        let ctx = Context::new();
        let candidates = arms(&["a", "b", "c"]);
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..200 {
            seen.insert(policy.recommend(&ctx, &candidates).unwrap());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_import_other_policy_is_ignored() {
        let mut policy = EpsilonGreedy::new(0.1, Some(1));
        policy.update("a", 1.0, &Context::new());
        let foreign = PolicySnapshot::new("ucb1", &serde_json::json!({"arms": {}}));
        assert!(!policy.import_state(&foreign));
        assert_eq!(policy.arm("a").unwrap().pulls, 1);
    }
}
