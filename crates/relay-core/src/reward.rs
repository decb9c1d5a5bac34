//! Reward computation.
//!
//! ```text
//! reward = w_q·quality + w_g·groundedness
//!        − w_c·cost − w_l·latency − w_s·safety_penalty − w_p·privacy_penalty
//! ```
//!
//! Computing a reward has no side effects; feeding it back into a policy is
//! the learning engine's job.

use serde::{Deserialize, Serialize};

use crate::features::Context;
use crate::signals::ResponseSignals;

/// Weights of the six reward terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardWeights {
    pub quality: f64,
    pub groundedness: f64,
    pub cost: f64,
    pub latency: f64,
    pub safety: f64,
    pub privacy: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            quality: 1.0,
            groundedness: 1.0,
            cost: 1.0,
            latency: 1.0,
            safety: 1.0,
            privacy: 1.0,
        }
    }
}

/// What a request cost and how it went.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// USD
    pub cost: f64,
    /// Seconds
    pub latency: f64,
    pub success: bool,
}

/// Judgements about a response, each nominally in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardSignals {
    pub quality: f64,
    pub groundedness: f64,
    pub safety_penalty: f64,
    pub privacy_penalty: f64,
}

impl RewardSignals {
    /// Signals for a response with the privacy penalty derived from its text.
    pub fn from_response(text: &str, quality: f64, groundedness: f64) -> Self {
        Self {
            quality,
            groundedness,
            safety_penalty: 0.0,
            privacy_penalty: ResponseSignals::inspect(text).privacy_penalty(),
        }
    }
}

/// Stateless reward calculator.
#[derive(Debug, Clone, Copy, Default)]
pub struct RewardPipeline {
    defaults: RewardWeights,
}

impl RewardPipeline {
    pub fn new(defaults: RewardWeights) -> Self {
        Self { defaults }
    }

    pub fn weights(&self) -> &RewardWeights {
        &self.defaults
    }

    /// Compute the scalar reward.
    ///
    /// `weights` overrides the pipeline defaults for this call. The formula
    /// does not currently read `domain` or `context`.
    pub fn compute(
        &self,
        _domain: &str,
        _context: &Context,
        outcome: &Outcome,
        signals: &RewardSignals,
        weights: Option<&RewardWeights>,
    ) -> f64 {
        let w = weights.unwrap_or(&self.defaults);
        w.quality * signals.quality + w.groundedness * signals.groundedness
            - w.cost * outcome.cost
            - w.latency * outcome.latency
            - w.safety * signals.safety_penalty
            - w.privacy * signals.privacy_penalty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights_are_unit() {
        let pipeline = RewardPipeline::default();
        let outcome = Outcome {
            cost: 0.1,
            latency: 0.2,
            success: true,
        };
        let signals = RewardSignals {
            quality: 0.9,
            groundedness: 0.8,
            safety_penalty: 0.05,
            privacy_penalty: 0.15,
        };
        let reward = pipeline.compute("d", &Context::new(), &outcome, &signals, None);
        assert!((reward - (0.9 + 0.8 - 0.1 - 0.2 - 0.05 - 0.15)).abs() < 1e-12);
    }

    #[test]
    fn test_override_single_weight() {
        let pipeline = RewardPipeline::default();
        let outcome = Outcome {
            cost: 1.0,
            latency: 0.0,
            success: true,
        };
        let signals = RewardSignals {
            quality: 1.0,
            ..Default::default()
        };
        let weights = RewardWeights {
            cost: 0.25,
            ..Default::default()
        };
        let reward = pipeline.compute("d", &Context::new(), &outcome, &signals, Some(&weights));
        assert!((reward - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_privacy_penalty_from_response() {
        let signals = RewardSignals::from_response("mail me at a@b.io", 1.0, 0.0);
        assert!((signals.privacy_penalty - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_compute_is_pure() {
        let pipeline = RewardPipeline::default();
        let outcome = Outcome::default();
        let signals = RewardSignals {
            quality: 0.5,
            ..Default::default()
        };
        let a = pipeline.compute("d", &Context::new(), &outcome, &signals, None);
        let b = pipeline.compute("d", &Context::new(), &outcome, &signals, None);
        assert_eq!(a, b);
    }
}
