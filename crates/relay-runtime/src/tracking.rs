//! Cumulative cost tracking for a multi-step pipeline.
//!
//! [`track_pipeline`] installs a task-local [`PipelineBudget`] for the
//! duration of a future. Every gateway call made inside that future is
//! checked against and charged to it. Outside a scope all functions are
//! no-ops, so single requests pay nothing for the feature.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;

use relay_core::{BudgetError, PipelineBudget};

tokio::task_local! {
    static PIPELINE: Arc<Mutex<PipelineBudget>>;
}

/// Totals of the active pipeline scope.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PipelineTotals {
    pub total: f64,
    pub charges: u64,
    pub by_task: std::collections::BTreeMap<String, f64>,
}

/// Run `fut` with `budget` as the active pipeline scope.
///
/// The budget is shared, so the caller can keep a handle and read totals
/// after the pipeline finishes.
pub async fn track_pipeline<F>(budget: Arc<Mutex<PipelineBudget>>, fut: F) -> F::Output
where
    F: Future,
{
    PIPELINE.scope(budget, fut).await
}

pub fn is_active() -> bool {
    PIPELINE.try_with(|_| ()).is_ok()
}

/// Check `cost` for `task` against the active scope.
pub fn can_charge(task: &str, cost: f64) -> Result<(), BudgetError> {
    PIPELINE
        .try_with(|budget| budget.lock().can_charge(task, cost))
        .unwrap_or(Ok(()))
}

/// Add `cost` for `task` to the active scope.
pub fn charge(task: &str, cost: f64) {
    let _ = PIPELINE.try_with(|budget| budget.lock().charge(task, cost));
}

impl From<&PipelineBudget> for PipelineTotals {
    fn from(budget: &PipelineBudget) -> Self {
        Self {
            total: budget.total(),
            charges: budget.charges(),
            by_task: budget.by_task().clone(),
        }
    }
}

pub fn current_totals() -> Option<PipelineTotals> {
    PIPELINE
        .try_with(|budget| PipelineTotals::from(&*budget.lock()))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::PipelineLimits;
    use std::collections::BTreeMap;

    fn budget(overall: f64) -> Arc<Mutex<PipelineBudget>> {
        Arc::new(Mutex::new(PipelineBudget::new(PipelineLimits {
            overall: Some(overall),
            per_task: BTreeMap::new(),
        })))
    }

    #[test]
    fn test_noop_outside_scope() {
        assert!(!is_active());
        assert!(can_charge("qa", 1e9).is_ok());
        charge("qa", 5.0);
        assert!(current_totals().is_none());
    }

    #[tokio::test]
    async fn test_scope_accumulates_and_limits() {
        let shared = budget(1.0);
        let result = track_pipeline(Arc::clone(&shared), async {
            assert!(is_active());
            assert!(can_charge("plan", 0.6).is_ok());
            charge("plan", 0.6);
            let over = can_charge("answer", 0.5);
            charge("answer", 0.3);
            over
        })
        .await;

        assert!(matches!(result, Err(BudgetError::PipelineExceeded { .. })));
        let budget = shared.lock();
        assert!((budget.total() - 0.9).abs() < 1e-12);
        assert_eq!(budget.charges(), 2);
    }

    #[tokio::test]
    async fn test_scopes_are_isolated_per_task() {
        let a = budget(10.0);
        let b = budget(10.0);
        let (ta, tb) = tokio::join!(
            track_pipeline(Arc::clone(&a), async {
                charge("x", 1.0);
                current_totals()
            }),
            track_pipeline(Arc::clone(&b), async {
                charge("x", 2.0);
                current_totals()
            }),
        );
        assert_eq!(ta.map(|t| t.total), Some(1.0));
        assert_eq!(tb.map(|t| t.total), Some(2.0));
    }
}
