//! Cumulative spend limits for one pipeline run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::BudgetError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineLimits {
    /// USD ceiling for the whole run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overall: Option<f64>,
    /// USD ceilings per task type.
    pub per_task: BTreeMap<String, f64>,
}

/// Running totals for a pipeline run, checked against [`PipelineLimits`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineBudget {
    limits: PipelineLimits,
    total: f64,
    by_task: BTreeMap<String, f64>,
    charges: u64,
}

impl PipelineBudget {
    pub fn new(limits: PipelineLimits) -> Self {
        Self {
            limits,
            ..Default::default()
        }
    }

    /// Whether charging `cost` to `task` stays within the overall and task limits.
    pub fn can_charge(&self, task: &str, cost: f64) -> Result<(), BudgetError> {
        if let Some(limit) = self.limits.overall {
            if self.total + cost > limit {
                return Err(BudgetError::PipelineExceeded {
                    task: None,
                    cost,
                    spent: self.total,
                    limit,
                });
            }
        }
        if let Some(limit) = self.limits.per_task.get(task) {
            let spent = self.task_total(task);
            if spent + cost > *limit {
                return Err(BudgetError::PipelineExceeded {
                    task: Some(task.to_string()),
                    cost,
                    spent,
                    limit: *limit,
                });
            }
        }
        Ok(())
    }

    pub fn charge(&mut self, task: &str, cost: f64) {
        let cost = cost.max(0.0);
        self.total += cost;
        *self.by_task.entry(task.to_string()).or_default() += cost;
        self.charges += 1;
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn task_total(&self, task: &str) -> f64 {
        self.by_task.get(task).copied().unwrap_or(0.0)
    }

    pub fn by_task(&self) -> &BTreeMap<String, f64> {
        &self.by_task
    }

    pub fn charges(&self) -> u64 {
        self.charges
    }

    pub fn limits(&self) -> &PipelineLimits {
        &self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_limit() {
        let mut budget = PipelineBudget::new(PipelineLimits {
            overall: Some(1.0),
            per_task: BTreeMap::new(),
        });
        assert!(budget.can_charge("summarize", 0.6).is_ok());
        budget.charge("summarize", 0.6);
        let err = budget.can_charge("classify", 0.5).unwrap_err();
        assert!(matches!(err, BudgetError::PipelineExceeded { task: None, .. }));
    }

    #[test]
    fn test_task_limit() {
        let mut per_task = BTreeMap::new();
        per_task.insert("summarize".to_string(), 0.1);
        let mut budget = PipelineBudget::new(PipelineLimits {
            overall: None,
            per_task,
        });
        budget.charge("summarize", 0.08);
        assert!(budget.can_charge("summarize", 0.05).is_err());
        assert!(budget.can_charge("classify", 5.0).is_ok());
        assert_eq!(budget.charges(), 1);
        assert!((budget.task_total("summarize") - 0.08).abs() < 1e-12);
    }

    #[test]
    fn test_unlimited_by_default() {
        let budget = PipelineBudget::default();
        assert!(budget.can_charge("anything", 1e9).is_ok());
    }
}
