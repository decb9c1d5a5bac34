//! UCB1: play every arm once, then maximize `mean + sqrt(2 ln N / n)`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{argmax, ensure_candidates, ArmStats, BanditPolicy, PolicyError, PolicySnapshot};
use crate::features::Context;

pub(crate) const NAME: &str = "ucb1";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct State {
    arms: BTreeMap<String, ArmStats>,
}

/// Deterministic upper-confidence-bound policy.
#[derive(Debug, Default)]
pub struct Ucb1 {
    state: State,
}

impl Ucb1 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self, action: &str) -> Option<&ArmStats> {
        self.state.arms.get(action)
    }

    fn pulls(&self, action: &str) -> u64 {
        self.state.arms.get(action).map(|a| a.pulls).unwrap_or(0)
    }
}

impl BanditPolicy for Ucb1 {
    fn name(&self) -> &'static str {
        NAME
    }

    fn recommend(&mut self, _context: &Context, candidates: &[String]) -> Result<String, PolicyError> {
        ensure_candidates(candidates)?;

        if let Some(untried) = candidates.iter().find(|c| self.pulls(c) == 0) {
            return Ok(untried.clone());
        }

        let total: u64 = candidates.iter().map(|c| self.pulls(c)).sum();
        let ln_total = (total.max(1) as f64).ln();
        let idx = argmax(candidates.iter().map(|c| {
            let arm = self.state.arms.get(c).copied().unwrap_or_default();
            arm.mean + (2.0 * ln_total / arm.pulls as f64).sqrt()
        }));
        Ok(candidates[idx].clone())
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
