//! # relay-core
//!
//! Deterministic decision engine for the relay LLM routing gateway.
//!
//! This crate answers, for every inference request:
//! - Which model should serve it?
//! - Can we afford it?
//! - What did we learn from how it went?
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: seeded policies replay identically
//! 2. **No I/O**: nothing here touches the network; only config files are read
//! 3. **Per-domain locking**: concurrent requests in one domain never corrupt policy state
//! 4. **Version-gated state**: snapshots from a newer build are ignored, never half-applied
//!
//! ## Example
//!
//! ```rust,ignore
//! use relay_core::{Context, GatewayConfig, LearningEngine};
//!
//! let config = GatewayConfig::from_yaml_file("relay.yaml")?;
//! let engine = LearningEngine::new(config.learning.clone());
//! let candidates = config.effective_candidates(Some("acme"));
//! let context = Context::new().with("tenant", "acme").with("prompt_tokens", 120u32);
//!
//! let choice = engine.recommend("model_routing", &context, &candidates)?;
//! engine.record("model_routing", &context, &choice.action, 0.8);
//! ```

pub mod budget;
pub mod config;
pub mod experiment;
pub mod features;
pub mod learning;
pub mod policy;
pub mod reward;
pub mod signals;

// Re-export main types at crate root
pub use budget::{
    AlertConfig, AlertSink, AlertType, BudgetConfig, BudgetError, BudgetLimits, BudgetManager,
    BudgetStatus, ChargeEvent, CostAlert, CostAlertManager, CostAnalysis, CostOptimizer,
    PipelineBudget, PipelineLimits, PriceTable, TokenMeter,
};
pub use config::{ConfigError, GatewayConfig};
pub use experiment::{
    ExperimentConfig, ExperimentError, ExperimentManager, ExperimentSummary, ExperimentsConfig,
    Phase, VariantStats,
};
pub use features::{Context, ContextValue, FeatureExtractor, SlidingWindow};
pub use learning::{
    ArmPrior, LearningConfig, LearningEngine, LearningError, LearningSnapshot, Recommendation,
    RecommendationSource, RestoreReport,
};
pub use policy::{BanditPolicy, PolicyError, PolicyParams, PolicyRegistry, PolicySnapshot};
pub use reward::{Outcome, RewardPipeline, RewardSignals, RewardWeights};
pub use signals::ResponseSignals;
