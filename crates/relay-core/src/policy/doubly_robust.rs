//! Doubly-robust off-policy bandit.
//!
//! Each arm carries a linear reward model `q̂(x)` and a running mean of the
//! importance-weighted residual `w·(r − q̂(x))`. The value estimate of an arm
//! is `q̂(x) + correction`, with an upper-confidence term built from an
//! exponentially-smoothed variance of the doubly-robust estimates.
//!
//! Actions are chosen ε-greedily over those scores so every choice has a
//! known propensity; the propensity of the last recommendation is reused
//! to weight its update.

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{
    argmax, ensure_candidates, make_rng, AdvancedDiagnostics, BanditPolicy, PolicyError,
    PolicySnapshot,
};
use crate::features::{context_vector, Context};

pub(crate) const NAME: &str = "doubly_robust";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DoublyRobustConfig {
    pub dim: usize,
    pub epsilon: f64,
    pub learning_rate: f64,
    pub learning_rate_decay: f64,
    pub min_learning_rate: f64,
    pub min_importance_weight: f64,
    pub max_importance_weight: f64,
    /// Smoothing factor for the per-arm variance, in `(0, 1]`.
    pub variance_smoothing: f64,
    pub confidence_scale: f64,
}

impl Default for DoublyRobustConfig {
    fn default() -> Self {
        Self {
            dim: 8,
            epsilon: 0.1,
            learning_rate: 0.1,
            learning_rate_decay: 0.999,
            min_learning_rate: 0.01,
            min_importance_weight: 0.1,
            max_importance_weight: 10.0,
            variance_smoothing: 0.1,
            confidence_scale: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DrArm {
    weights: Vec<f64>,
    correction: f64,
    variance: f64,
    pulls: u64,
}

impl DrArm {
    fn new(dim: usize) -> Self {
        Self {
            weights: vec![0.0; dim],
            correction: 0.0,
            variance: 0.0,
            pulls: 0,
        }
    }

    fn predict(&self, x: &[f64]) -> f64 {
        self.weights.iter().zip(x).map(|(w, xi)| w * xi).sum()
    }

    fn ci_width(&self, scale: f64) -> f64 {
        scale * (self.variance / (self.pulls as f64 + 1.0)).sqrt()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct State {
    dim: usize,
    learning_rate: f64,
    arms: BTreeMap<String, DrArm>,
    /// Propensity of the most recent recommendation per action.
    propensities: BTreeMap<String, f64>,
}

#[derive(Debug)]
pub struct DoublyRobust {
    config: DoublyRobustConfig,
    state: State,
    last: Option<AdvancedDiagnostics>,
    rng: StdRng,
}

impl DoublyRobust {
    pub fn new(config: DoublyRobustConfig, seed: Option<u64>) -> Self {
        let state = State {
            dim: config.dim.max(1),
            learning_rate: config.learning_rate,
            arms: BTreeMap::new(),
            propensities: BTreeMap::new(),
        };
        Self {
            config,
            state,
            last: None,
            rng: make_rng(seed),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.state.learning_rate
    }

    /// Doubly-robust value estimate of `action` in `context`.
    pub fn estimate(&self, action: &str, context: &Context) -> f64 {
        let x = context_vector(context, self.state.dim);
        self.state
            .arms
            .get(action)
            .map(|arm| arm.predict(&x) + arm.correction)
            .unwrap_or(0.0)
    }

    fn score(&self, action: &str, x: &[f64]) -> f64 {
        match self.state.arms.get(action) {
            Some(arm) if arm.pulls > 0 => {
                arm.predict(x) + arm.correction + arm.ci_width(self.config.confidence_scale)
            }
            _ => f64::INFINITY,
        }
    }

    /// Inverted bounds are treated as the same interval, never a panic.
    fn clamp_weight(&self, w: f64) -> f64 {
        let (a, b) = (self.config.min_importance_weight, self.config.max_importance_weight);
        w.clamp(a.min(b), a.max(b))
    }
}

impl BanditPolicy for DoublyRobust {
    fn name(&self) -> &'static str {
        NAME
    }

    fn recommend(&mut self, context: &Context, candidates: &[String]) -> Result<String, PolicyError> {
        ensure_candidates(candidates)?;
        let x = context_vector(context, self.state.dim);
        let greedy = argmax(candidates.iter().map(|c| self.score(c, &x)));

        let k = candidates.len() as f64;
        let eps = self.config.epsilon.clamp(0.0, 1.0);
        let chosen = if eps > 0.0 && self.rng.gen::<f64>() < eps {
            self.rng.gen_range(0..candidates.len())
        } else {
            greedy
        };

        let propensity = if chosen == greedy {
            (1.0 - eps) + eps / k
        } else {
            eps / k
        };
        let action = candidates[chosen].clone();
        self.state.propensities.insert(action.clone(), propensity);
        Ok(action)
    }

    fn update(&mut self, action: &str, reward: f64, context: &Context) {
        if !reward.is_finite() {
            return;
        }
        let x = context_vector(context, self.state.dim);
        let known = self.state.arms.len().max(1) as f64;
        let propensity = self
            .state
            .propensities
            .remove(action)
            .filter(|p| *p > 0.0)
            .unwrap_or(1.0 / known);
        let weight = self.clamp_weight(1.0 / propensity);

        let dim = self.state.dim;
        let lr = self.state.learning_rate;
        let smoothing = self.config.variance_smoothing.clamp(f64::EPSILON, 1.0);
        let scale = self.config.confidence_scale;

        let arm = self
            .state
            .arms
            .entry(action.to_string())
            .or_insert_with(|| DrArm::new(dim));

        let predicted = arm.predict(&x);
        let residual = reward - predicted;
        let dr_estimate = predicted + weight * residual;

        arm.pulls += 1;
        arm.correction += (weight * residual - arm.correction) / arm.pulls as f64;
        let deviation = dr_estimate - (predicted + arm.correction);
        arm.variance = (1.0 - smoothing) * arm.variance + smoothing * deviation * deviation;
        for (w, xi) in arm.weights.iter_mut().zip(&x) {
            *w += lr * residual * xi;
        }
        let ci_width = arm.ci_width(scale);

        self.state.learning_rate = (lr * self.config.learning_rate_decay).max(self.config.min_learning_rate);
        self.last = Some(AdvancedDiagnostics {
            reward_model_mse: Some(residual * residual),
            tree_depth: None,
            importance_weight: Some(weight),
            ci_width: Some(ci_width),
        });
    }

    fn export_state(&self) -> PolicySnapshot {
        PolicySnapshot::new(NAME, &self.state)
    }

    fn import_state(&mut self, snapshot: &PolicySnapshot) -> bool {
        match snapshot.decode::<State>(NAME) {
            Some(state) if state.arms.values().all(|a| a.weights.len() == state.dim) => {
                self.state = state;
                true
            }
            _ => false,
        }
    }

    fn set_prior(&mut self, action: &str, mean: f64, weight: f64) {
        let dim = self.state.dim;
        let arm = self
            .state
            .arms
            .entry(action.to_string())
            .or_insert_with(|| DrArm::new(dim));
        // Bias weight carries the prior mean.
        arm.weights[0] = mean;
        arm.pulls = weight.max(0.0).round() as u64;
    }

    fn diagnostics(&self) -> Option<AdvancedDiagnostics> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(seed: u64) -> DoublyRobust {
        DoublyRobust::new(
            DoublyRobustConfig {
                dim: 2,
                epsilon: 0.0,
                ..Default::default()
            },
            Some(seed),
        )
    }

    #[test]
    fn test_untried_arms_first() {
        let mut p = policy(1);
        let ctx = Context::new();
        let candidates: Vec<String> = vec!["a".into(), "b".into()];
        let first = p.recommend(&ctx, &candidates).unwrap();
        p.update(&first, 0.5, &ctx);
        let second = p.recommend(&ctx, &candidates).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_importance_weight_is_clamped() {
        let mut p = DoublyRobust::new(
            DoublyRobustConfig {
                dim: 2,
                epsilon: 1.0,
                max_importance_weight: 3.0,
                ..Default::default()
            },
            Some(5),
        );
        let ctx = Context::new();
        let candidates: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
        let action = p.recommend(&ctx, &candidates).unwrap();
        p.update(&action, 1.0, &ctx);
        let diag = p.diagnostics().unwrap();
        // propensity 1/10 would give weight 10
        assert_eq!(diag.importance_weight, Some(3.0));
    }

    #[test]
    fn test_inverted_weight_bounds_do_not_panic() {
        let mut p = DoublyRobust::new(
            DoublyRobustConfig {
                dim: 2,
                epsilon: 1.0,
                min_importance_weight: 5.0,
                max_importance_weight: 1.0,
                ..Default::default()
            },
            Some(5),
        );
        let ctx = Context::new();
        let candidates: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
        let action = p.recommend(&ctx, &candidates).unwrap();
        p.update(&action, 1.0, &ctx);
        assert_eq!(p.diagnostics().unwrap().importance_weight, Some(5.0));
    }

    #[test]
    fn test_learning_rate_decays_to_floor() {
        let mut p = DoublyRobust::new(
            DoublyRobustConfig {
                dim: 2,
                learning_rate: 0.5,
                learning_rate_decay: 0.5,
                min_learning_rate: 0.1,
                ..Default::default()
            },
            Some(1),
        );
        let ctx = Context::new();
        for _ in 0..10 {
            p.update("a", 1.0, &ctx);
        }
        assert!((p.learning_rate() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_estimate_moves_toward_reward() {
        let mut p = policy(2);
        let ctx = Context::new();
        for _ in 0..200 {
            p.update("a", 0.8, &ctx);
        }
        let est = p.estimate("a", &ctx);
        assert!((est - 0.8).abs() < 0.1, "estimate {est}");
        let diag = p.diagnostics().unwrap();
        assert!(diag.reward_model_mse.unwrap() < 0.01);
    }

    #[test]
    fn test_prefers_higher_reward_arm() {
        let mut p = policy(3);
        let ctx = Context::new();
        for _ in 0..100 {
            p.update("good", 0.9, &ctx);
            p.update("bad", 0.2, &ctx);
        }
        let candidates: Vec<String> = vec!["bad".into(), "good".into()];
        assert_eq!(p.recommend(&ctx, &candidates).unwrap(), "good");
    }
}
