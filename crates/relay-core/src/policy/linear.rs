//! Linear contextual bandits with a diagonal precision approximation.
//!
//! Each arm keeps a precision vector `A` (initialised to 1) and a weighted
//! reward vector `b` (initialised to 0). The per-arm estimate is
//! `θ = b / A` elementwise, so no matrix inversion is needed.

use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{argmax, ensure_candidates, make_rng, BanditPolicy, PolicyError, PolicySnapshot};
use crate::features::{context_vector, Context};

pub(crate) const LIN_UCB: &str = "lin_ucb";
pub(crate) const LIN_TS: &str = "lin_ts";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearConfig {
    /// Context vector dimension, bias included.
    pub dim: usize,
    /// LinUCB exploration width.
    pub alpha: f64,
    /// LinThompson posterior scale.
    pub sigma: f64,
}

impl Default for LinearConfig {
    fn default() -> Self {
        Self {
            dim: 8,
            alpha: 1.0,
            sigma: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LinearArm {
    a: Vec<f64>,
    b: Vec<f64>,
}

impl LinearArm {
    fn new(dim: usize) -> Self {
        Self {
            a: vec![1.0; dim],
            b: vec![0.0; dim],
        }
    }

    fn theta(&self) -> impl Iterator<Item = f64> + '_ {
        self.a.iter().zip(&self.b).map(|(a, b)| b / a)
    }

    fn observe(&mut self, x: &[f64], reward: f64) {
        for ((a, b), xi) in self.a.iter_mut().zip(self.b.iter_mut()).zip(x) {
            *a += xi * xi;
            *b += reward * xi;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct State {
    dim: usize,
    arms: BTreeMap<String, LinearArm>,
}

impl State {
    fn new(dim: usize) -> Self {
        Self {
            dim: dim.max(1),
            arms: BTreeMap::new(),
        }
    }

    fn arm(&self, action: &str) -> LinearArm {
        self.arms
            .get(action)
            .cloned()
            .unwrap_or_else(|| LinearArm::new(self.dim))
    }

    fn update(&mut self, action: &str, reward: f64, context: &Context) {
        if !reward.is_finite() {
            return;
        }
        let x = context_vector(context, self.dim);
        let dim = self.dim;
        self.arms
            .entry(action.to_string())
            .or_insert_with(|| LinearArm::new(dim))
            .observe(&x, reward);
    }

    fn import(&mut self, snapshot: &PolicySnapshot, name: &str) -> bool {
        match snapshot.decode::<State>(name) {
            Some(state) if state.arms.values().all(|a| a.a.len() == state.dim && a.b.len() == state.dim) => {
                *self = state;
                true
            }
            _ => false,
        }
    }
}

/// LinUCB: score = `x·θ + α·sqrt(Σ xᵢ²/Aᵢ)`.
#[derive(Debug)]
pub struct LinUcb {
    alpha: f64,
    state: State,
}

impl LinUcb {
    pub fn new(config: &LinearConfig) -> Self {
        Self {
            alpha: config.alpha,
            state: State::new(config.dim),
        }
    }

    /// Score of `action` for a dense context vector.
    pub fn score(&self, action: &str, x: &[f64]) -> f64 {
        let arm = self.state.arm(action);
        let mean: f64 = arm.theta().zip(x).map(|(t, xi)| t * xi).sum();
        let width: f64 = x.iter().zip(&arm.a).map(|(xi, a)| xi * xi / a).sum();
        mean + self.alpha * width.sqrt()
    }
}

impl BanditPolicy for LinUcb {
    fn name(&self) -> &'static str {
        LIN_UCB
    }

    fn recommend(&mut self, context: &Context, candidates: &[String]) -> Result<String, PolicyError> {
        ensure_candidates(candidates)?;
        let x = context_vector(context, self.state.dim);
        let idx = argmax(candidates.iter().map(|c| self.score(c, &x)));
        Ok(candidates[idx].clone())
    }

    fn update(&mut self, action: &str, reward: f64, context: &Context) {
        self.state.update(action, reward, context);
    }

    fn export_state(&self) -> PolicySnapshot {
        PolicySnapshot::new(LIN_UCB, &self.state)
    }

    fn import_state(&mut self, snapshot: &PolicySnapshot) -> bool {
        self.state.import(snapshot, LIN_UCB)
    }
}

/// Linear Thompson sampling: `θᵢ ~ Normal(bᵢ/Aᵢ, σ/√Aᵢ)`.
#[derive(Debug)]
pub struct LinThompson {
    sigma: f64,
    state: State,
    rng: StdRng,
}

impl LinThompson {
    pub fn new(config: &LinearConfig, seed: Option<u64>) -> Self {
        Self {
            sigma: config.sigma.max(0.0),
            state: State::new(config.dim),
            rng: make_rng(seed),
        }
    }

    fn sample_score(&mut self, action: &str, x: &[f64]) -> f64 {
        let arm = self.state.arm(action);
        let mut score = 0.0;
        for ((a, b), xi) in arm.a.iter().zip(&arm.b).zip(x) {
            let mean = b / a;
            let theta = match Normal::new(mean, self.sigma / a.sqrt()) {
                Ok(dist) => dist.sample(&mut self.rng),
                Err(_) => mean,
            };
            score += theta * xi;
        }
        score
    }
}

impl BanditPolicy for LinThompson {
    fn name(&self) -> &'static str {
        LIN_TS
    }

    fn recommend(&mut self, context: &Context, candidates: &[String]) -> Result<String, PolicyError> {
        ensure_candidates(candidates)?;
        let x = context_vector(context, self.state.dim);
        let scores: Vec<f64> = candidates.iter().map(|c| self.sample_score(c, &x)).collect();
        Ok(candidates[argmax(scores)].clone())
    }

    fn update(&mut self, action: &str, reward: f64, context: &Context) {
        self.state.update(action, reward, context);
    }

    fn export_state(&self) -> PolicySnapshot {
        PolicySnapshot::new(LIN_TS, &self.state)
    }

    fn import_state(&mut self, snapshot: &PolicySnapshot) -> bool {
        self.state.import(snapshot, LIN_TS)
    }
}
