//! Request routing: which model serves a request, and what it should cost.

mod compression;
mod router;
mod state;
mod trials;

pub use compression::{CompressionInfo, PromptCompressor};
pub use router::{
    ExternalRouter, RouteDecision, RouteStateBuilder, Router, MEAN_COST_KEY, MEAN_LATENCY_KEY,
};
pub use state::{RouteState, SelectionSource};
pub use trials::AdaptiveTrials;
