//! # relay-runtime
//!
//! Async execution layer for the relay LLM routing gateway.
//!
//! `relay-core` decides; this crate acts on those decisions against a real
//! backend:
//! - Route state assembly, compression and external routing hooks
//! - Exact and semantic response caching
//! - Timeouts, retries with backoff, per-model circuit breaking
//! - Budget admission and charging, including pipeline-scoped budgets
//! - OpenRouter-compatible chat completions over a pooled HTTP client
//!
//! ## Example
//!
//! ```rust,ignore
//! use relay_core::GatewayConfig;
//! use relay_runtime::{Gateway, RouteRequest};
//!
//! let config = GatewayConfig::from_yaml_file("relay.yaml")?;
//! let gateway = Gateway::builder(config).build()?;
//!
//! let response = gateway
//!     .route(RouteRequest::new("Summarize this ticket", "summarize").tenant("acme", None))
//!     .await;
//! println!("{:?} via {} cost ${:.6}", response.status, response.model, response.cost);
//! ```

pub mod cache;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod pool;
pub mod providers;
pub mod resilience;
pub mod routing;
pub mod tracking;

pub use cache::{CacheInfo, CacheLayer, CacheLookup, CacheStats, CacheTier, Embedder, HashingEmbedder};
pub use error::{ErrorKind, GatewayError};
pub use gateway::{
    BuildError, ErrorBody, Gateway, GatewayBuilder, RouteRequest, RouteResponse, RouteStatus,
    TokenReport,
};
pub use metrics::{GatewayMetrics, MetricsSnapshot};
pub use pool::{ConnectionPool, ObjectPool, PoolError};
pub use providers::{
    ChatMessage, CompletionConfig, CompletionResponse, LlmProvider, OpenRouterProvider,
    ProviderError, ProviderRegistry, TokenUsage,
};
pub use resilience::{CircuitBreaker, CircuitState, RetryStrategy};
pub use routing::{CompressionInfo, ExternalRouter, RouteState, SelectionSource};
pub use tracking::{track_pipeline, PipelineTotals};
