//! Beta-Bernoulli Thompson sampling.
//!
//! Rewards are clamped into `[0, 1]` and treated as fractional successes.

use rand::rngs::StdRng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{argmax, ensure_candidates, make_rng, BanditPolicy, PolicyError, PolicySnapshot};
use crate::features::Context;

pub(crate) const NAME: &str = "thompson";

/// Beta posterior for one arm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BetaArm {
    pub alpha: f64,
    pub beta: f64,
}

impl Default for BetaArm {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
        }
    }
}

impl BetaArm {
    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    pub fn observe(&mut self, reward: f64) {
        let r = reward.clamp(0.0, 1.0);
        self.alpha += r;
        self.beta += 1.0 - r;
    }

    /// One posterior draw; falls back to the mean if the parameters are degenerate.
    pub fn sample(&self, rng: &mut StdRng) -> f64 {
        match Beta::new(self.alpha, self.beta) {
            Ok(dist) => dist.sample(rng),
            Err(_) => self.mean(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct State {
    arms: BTreeMap<String, BetaArm>,
}

#[derive(Debug)]
pub struct ThompsonSampling {
    state: State,
    rng: StdRng,
}

impl ThompsonSampling {
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            state: State::default(),
            rng: make_rng(seed),
        }
    }

    pub fn arm(&self, action: &str) -> Option<&BetaArm> {
        self.state.arms.get(action)
    }
}

impl BanditPolicy for ThompsonSampling {
    fn name(&self) -> &'static str {
        NAME
    }

    fn recommend(&mut self, _context: &Context, candidates: &[String]) -> Result<String, PolicyError> {
        ensure_candidates(candidates)?;
        let draws: Vec<f64> = candidates
            .iter()
            .map(|c| {
                let arm = self.state.arms.get(c).copied().unwrap_or_default();
                arm.sample(&mut self.rng)
            })
            .collect();
        Ok(candidates[argmax(draws)].clone())
    }

    fn update(&mut self, action: &str, reward: f64, _context: &Context) {
        if !reward.is_finite() {
            return;
        }
        self.state.arms.entry(action.to_string()).or_default().observe(reward);
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
        let mean = mean.clamp(0.0, 1.0);
        let weight = weight.max(0.0);
        self.state.arms.insert(
            action.to_string(),
            BetaArm {
                alpha: 1.0 + mean * weight,
                beta: 1.0 + (1.0 - mean) * weight,
            },
        );
    }
}
