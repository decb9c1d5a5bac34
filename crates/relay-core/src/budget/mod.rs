//! Budget and cost governance.
//!
//! - [`TokenMeter`]: token estimates, per-model pricing, affordability
//! - [`BudgetManager`]: per-request and daily ceilings
//! - [`PipelineBudget`]: cumulative limits for one pipeline run
//! - [`CostOptimizer`]: bounded cost history and spend analysis
//! - [`CostAlertManager`]: threshold, spike and anomaly alerts with cooldowns

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod alerts;
mod manager;
mod meter;
mod optimizer;
mod pipeline;

pub use alerts::{
    AlertConfig, AlertSeverity, AlertSink, AlertType, ChargeEvent, CostAlert, CostAlertManager,
    TracingAlertSink, MIN_MODEL_SAMPLES, MIN_SPIKE_SAMPLES,
};
pub use manager::{BudgetLimits, BudgetManager, BudgetStatus};
pub use meter::{PriceTable, TokenMeter, CHARS_PER_TOKEN};
pub use optimizer::{
    CostAnalysis, CostBreakdown, CostLeader, CostOptimizer, CostRecord, DEFAULT_MAX_HISTORY,
};
pub use pipeline::{PipelineBudget, PipelineLimits};

/// Admission-control failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BudgetError {
    #[error("Request cost ${cost:.6} exceeds per-request limit ${limit:.6}")]
    PerRequestExceeded { cost: f64, limit: f64 },

    #[error("Request cost ${cost:.6} would exceed daily budget ${limit:.2} (spent ${spent:.6})")]
    DailyExceeded { cost: f64, spent: f64, limit: f64 },

    #[error("Request cost ${cost:.6} would exceed pipeline limit ${limit:.6} (task: {task:?}, spent ${spent:.6})")]
    PipelineExceeded {
        task: Option<String>,
        cost: f64,
        spent: f64,
        limit: f64,
    },
}

/// Budget section of the gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    #[serde(flatten)]
    pub limits: BudgetLimits,
    pub pipeline: PipelineLimits,
}
