//! Scheduled exploration outside the learning policy.
//!
//! Every Nth request of a task type is sent to the next candidate in a
//! per-task rotation, so every model keeps receiving fresh observations even
//! when the policy has converged.

use parking_lot::Mutex;
use std::collections::HashMap;

use relay_core::config::AdaptiveTrialConfig;

#[derive(Debug, Default, Clone, Copy)]
struct Rotation {
    seen: u64,
    cursor: usize,
}

#[derive(Debug, Default)]
pub struct AdaptiveTrials {
    config: AdaptiveTrialConfig,
    rotations: Mutex<HashMap<String, Rotation>>,
}

impl AdaptiveTrials {
    pub fn new(config: AdaptiveTrialConfig) -> Self {
        Self {
            config,
            rotations: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request for `task_type`; on every Nth, the trial model.
    pub fn suggest(&self, task_type: &str, candidates: &[String]) -> Option<String> {
        if !self.config.enabled || self.config.every_n == 0 || candidates.is_empty() {
            return None;
        }
        let mut rotations = self.rotations.lock();
        let rotation = rotations.entry(task_type.to_string()).or_default();
        rotation.seen += 1;
        if rotation.seen % self.config.every_n != 0 {
            return None;
        }
        let model = candidates[rotation.cursor % candidates.len()].clone();
        rotation.cursor = (rotation.cursor + 1) % candidates.len();
        tracing::debug!(task_type, model = %model, "adaptive trial");
        Some(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn models() -> Vec<String> {
        vec!["a".into(), "b".into(), "c".into()]
    }

    #[test]
    fn test_every_nth_request_rotates() {
        let trials = AdaptiveTrials::new(AdaptiveTrialConfig {
            enabled: true,
            every_n: 2,
        });
        let picks: Vec<Option<String>> = (0..6).map(|_| trials.suggest("qa", &models())).collect();
        assert_eq!(
            picks,
            vec![None, Some("a".into()), None, Some("b".into()), None, Some("c".into())]
        );
    }

    #[test]
    fn test_task_types_counted_separately() {
        let trials = AdaptiveTrials::new(AdaptiveTrialConfig {
            enabled: true,
            every_n: 2,
        });
        assert_eq!(trials.suggest("qa", &models()), None);
        assert_eq!(trials.suggest("summarize", &models()), None);
        assert_eq!(trials.suggest("qa", &models()), Some("a".into()));
    }

    #[test]
    fn test_disabled_never_suggests() {
        let trials = AdaptiveTrials::default();
        assert!((0..20).all(|_| trials.suggest("qa", &models()).is_none()));
    }
}
