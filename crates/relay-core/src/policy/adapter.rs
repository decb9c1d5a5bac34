//! Adapter for learners that live outside this crate.

use serde_json::Value;

use super::epsilon_greedy::EpsilonGreedy;
use super::{BanditPolicy, PolicyError, PolicySnapshot};
use crate::features::Context;

pub(crate) const NAME: &str = "external";

/// A learner backed by an external library or service.
pub trait ExternalLearner: Send {
    /// Whether the learner can currently serve predictions.
    fn is_available(&self) -> bool;

    fn predict(&mut self, context: &Context, candidates: &[String]) -> Result<String, PolicyError>;

    fn learn(&mut self, action: &str, reward: f64, context: &Context);

    /// Opaque learner state for snapshots.
    fn save(&self) -> Option<Value> {
        None
    }

    /// Restore opaque state; `false` when it was not accepted.
    fn load(&mut self, _state: &Value) -> bool {
        false
    }
}

/// Wraps an [`ExternalLearner`], serving from an epsilon-greedy fallback
/// whenever the learner is unavailable or fails to predict.
///
/// Both sides receive every update so the fallback stays warm.
pub struct ExternalPolicyAdapter {
    learner: Box<dyn ExternalLearner>,
    fallback: EpsilonGreedy,
}

impl ExternalPolicyAdapter {
    pub fn new(learner: Box<dyn ExternalLearner>, epsilon: f64, seed: Option<u64>) -> Self {
        Self {
            learner,
            fallback: EpsilonGreedy::new(epsilon, seed),
        }
    }
}

impl BanditPolicy for ExternalPolicyAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn recommend(&mut self, context: &Context, candidates: &[String]) -> Result<String, PolicyError> {
        if candidates.is_empty() {
            return Err(PolicyError::NoCandidates);
        }
        if self.learner.is_available() {
            match self.learner.predict(context, candidates) {
                Ok(action) if candidates.contains(&action) => return Ok(action),
                Ok(action) => {
                    tracing::warn!(%action, "external learner chose a non-candidate, using fallback");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "external learner failed, using fallback");
                }
            }
        }
        self.fallback.recommend(context, candidates)
    }

    fn update(&mut self, action: &str, reward: f64, context: &Context) {
        if self.learner.is_available() {
            self.learner.learn(action, reward, context);
        }
        self.fallback.update(action, reward, context);
    }

    fn export_state(&self) -> PolicySnapshot {
        let fallback = self.fallback.export_state();
        let state = serde_json::json!({
            "learner": self.learner.save(),
            "fallback": fallback.state,
        });
        PolicySnapshot::new(NAME, &state)
    }

    fn import_state(&mut self, snapshot: &PolicySnapshot) -> bool {
        if snapshot.policy != NAME || snapshot.version > super::STATE_VERSION {
            return false;
        }
        let Some(Value::Object(fallback_state)) = snapshot.state.get("fallback") else {
            return false;
        };
        let fallback = PolicySnapshot {
            policy: self.fallback.name().to_string(),
            version: snapshot.version,
            state: fallback_state.clone(),
        };
        // Nothing is committed until both halves are accepted.
        let mut staged = EpsilonGreedy::new(self.fallback.epsilon(), None);
        if !staged.import_state(&fallback) {
            return false;
        }
        if let Some(learner_state) = snapshot.state.get("learner").filter(|v| !v.is_null()) {
            if !self.learner.load(learner_state) {
                tracing::warn!("external learner rejected its snapshot state");
                return false;
            }
        }
        self.fallback.import_state(&fallback)
    }

    fn set_prior(&mut self, action: &str, mean: f64, weight: f64) {
        self.fallback.set_prior(action, mean, weight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FixedLearner {
        available: Arc<AtomicBool>,
        choice: String,
        learned: usize,
    }

    impl ExternalLearner for FixedLearner {
        fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }

        fn predict(&mut self, _context: &Context, _candidates: &[String]) -> Result<String, PolicyError> {
            Ok(self.choice.clone())
        }

        fn learn(&mut self, _action: &str, _reward: f64, _context: &Context) {
            self.learned += 1;
        }
    }

    /// Saves state it can never load back.
    struct StrictLearner;

    impl ExternalLearner for StrictLearner {
        fn is_available(&self) -> bool {
            false
        }

        fn predict(&mut self, _context: &Context, _candidates: &[String]) -> Result<String, PolicyError> {
            Err(PolicyError::NoCandidates)
        }

        fn learn(&mut self, _action: &str, _reward: f64, _context: &Context) {}

        fn save(&self) -> Option<Value> {
            Some(serde_json::json!({ "weights": [] }))
        }
    }

    #[test]
    fn test_uses_learner_when_available() {
        let available = Arc::new(AtomicBool::new(true));
        let mut adapter = ExternalPolicyAdapter::new(
            Box::new(FixedLearner {
                available: available.clone(),
                choice: "b".into(),
                learned: 0,
            }),
            0.0,
            Some(1),
        );
        let candidates: Vec<String> = vec!["a".into(), "b".into()];
        let ctx = Context::new();
        assert_eq!(adapter.recommend(&ctx, &candidates).unwrap(), "b");

        available.store(false, Ordering::SeqCst);
        // fallback is greedy with no data, so first candidate
        assert_eq!(adapter.recommend(&ctx, &candidates).unwrap(), "a");
    }

    #[test]
    fn test_non_candidate_prediction_falls_back() {
        let mut adapter = ExternalPolicyAdapter::new(
            Box::new(FixedLearner {
                available: Arc::new(AtomicBool::new(true)),
                choice: "zzz".into(),
                learned: 0,
            }),
            0.0,
            Some(1),
        );
        let candidates: Vec<String> = vec!["a".into(), "b".into()];
        assert_eq!(adapter.recommend(&Context::new(), &candidates).unwrap(), "a");
    }

    #[test]
    fn test_snapshot_restores_fallback() {
        let learner = || {
            Box::new(FixedLearner {
                available: Arc::new(AtomicBool::new(false)),
                choice: "a".into(),
                learned: 0,
            })
        };
        let mut adapter = ExternalPolicyAdapter::new(learner(), 0.0, Some(1));
        adapter.update("b", 1.0, &Context::new());
        let snapshot = adapter.export_state();

        let mut restored = ExternalPolicyAdapter::new(learner(), 0.0, Some(1));
        assert!(restored.import_state(&snapshot));
        let candidates: Vec<String> = vec!["a".into(), "b".into()];
        assert_eq!(restored.recommend(&Context::new(), &candidates).unwrap(), "b");
    }

    #[test]
    fn test_rejected_learner_state_leaves_fallback_untouched() {
        let mut source = ExternalPolicyAdapter::new(Box::new(StrictLearner), 0.0, Some(1));
        source.update("b", 1.0, &Context::new());
        let snapshot = source.export_state();

        let mut target = ExternalPolicyAdapter::new(Box::new(StrictLearner), 0.0, Some(1));
        target.update("a", 0.5, &Context::new());
        let before = target.fallback.export_state();

        assert!(!target.import_state(&snapshot));
        assert_eq!(target.fallback.export_state().state, before.state);
        let candidates: Vec<String> = vec!["a".into(), "b".into()];
        assert_eq!(target.recommend(&Context::new(), &candidates).unwrap(), "a");
    }
}
