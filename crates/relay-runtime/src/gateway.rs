//! Execution engine for routed completions.
//!
//! One call to [`Gateway::route`] runs the whole request lifecycle:
//! 1. Assemble route state (candidates, model, token and cost estimates)
//! 2. Serve from cache when possible
//! 3. Admission control: pipeline scope, per-request and daily budget
//! 4. Circuit breaker check for the chosen `provider:model`
//! 5. Provider call under timeout and retry
//! 6. Charge, alert, learn, cache
//!
//! Budget and breaker rejections come back immediately as typed errors.
//! Cache and telemetry problems never fail a request.

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use relay_core::{
    AlertSink, BudgetManager, BudgetStatus, ChargeEvent, Context, CostAlertManager,
    CostAnalysis, CostOptimizer, ExperimentError, ExperimentManager, GatewayConfig,
    LearningEngine, LearningSnapshot, Outcome, PipelineBudget, RestoreReport, RewardPipeline,
    RewardSignals,
};

use crate::cache::{
    CacheInfo, CacheLayer, CacheLookup, CacheRequest, CacheStats, CacheStore, CacheTier, Embedder,
    HashingEmbedder,
};
use crate::error::{ErrorKind, GatewayError};
use crate::metrics::{GatewayMetrics, MetricsSnapshot};
use crate::pool::{ConnectionPool, ObjectPool, PoolError};
use crate::providers::{
    ChatMessage, CompletionConfig, CompletionResponse, LlmProvider, OpenRouterProvider,
    ProviderError, ProviderRegistry, OPENROUTER_PROVIDER,
};
use crate::resilience::{CircuitBreaker, RetryStrategy};
use crate::routing::{CompressionInfo, ExternalRouter, RouteState, RouteStateBuilder, SelectionSource};
use crate::tracking::{self, PipelineTotals};

/// Reward recorded for a model whose call failed after all retries.
const FAILURE_REWARD: f64 = -1.0;

/// Inbound request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteRequest {
    pub prompt: String,
    pub task_type: String,
    /// Empty means the configured candidates for the tenant.
    pub candidates: Vec<String>,
    /// Forwarded as the outbound request's `provider` field.
    pub provider_options: Option<Value>,
    /// Bypasses selection entirely.
    pub model: Option<String>,
    pub tenant: Option<String>,
    pub workspace: Option<String>,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    /// Extra features for contextual policies.
    pub context: Context,
    pub use_cache: bool,
}

impl Default for RouteRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            task_type: String::new(),
            candidates: Vec::new(),
            provider_options: None,
            model: None,
            tenant: None,
            workspace: None,
            system_prompt: None,
            max_tokens: None,
            context: Context::new(),
            use_cache: true,
        }
    }
}

impl RouteRequest {
    pub fn new(prompt: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            task_type: task_type.into(),
            ..Default::default()
        }
    }

    pub fn candidates(mut self, candidates: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.candidates = candidates.into_iter().map(Into::into).collect();
        self
    }

    pub fn provider_options(mut self, options: Value) -> Self {
        self.provider_options = Some(options);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn tenant(mut self, tenant: impl Into<String>, workspace: Option<&str>) -> Self {
        self.tenant = Some(tenant.into());
        self.workspace = workspace.map(str::to_string);
        self
    }

    pub fn system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    Success,
    Error,
}

/// Failure details returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    pub model: Option<String>,
    pub task_type: Option<String>,
    pub projected_cost: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenReport {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total: u32,
    /// Counts come from the local estimate, not the backend.
    pub estimated: bool,
}

/// Outbound contract of [`Gateway::route`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteResponse {
    pub request_id: String,
    pub status: RouteStatus,
    pub model: String,
    pub response: Option<String>,
    pub error: Option<ErrorBody>,
    pub tokens: TokenReport,
    pub provider: String,
    pub cached: bool,
    pub cache_info: Option<CacheInfo>,
    pub compression_info: Option<CompressionInfo>,
    pub selection: SelectionSource,
    pub projected_cost: f64,
    /// Amount charged; zero for cache hits and failures.
    pub cost: f64,
    pub latency_ms: u64,
}

impl RouteResponse {
    pub fn is_success(&self) -> bool {
        self.status == RouteStatus::Success
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Provider setup failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Connection pool setup failed: {0}")]
    Pool(#[from] PoolError),

    #[error("Experiment setup failed: {0}")]
    Experiments(#[from] ExperimentError),
}

struct Executed {
    completion: CompletionResponse,
    tokens: TokenReport,
    cost: f64,
    cached: bool,
    cache_info: Option<CacheInfo>,
}

pub struct Gateway {
    config: Arc<GatewayConfig>,
    provider: Arc<dyn LlmProvider>,
    learning: Arc<LearningEngine>,
    routes: RouteStateBuilder,
    states: ObjectPool<RouteState>,
    cache: CacheLayer,
    breaker: CircuitBreaker,
    retry: RetryStrategy,
    budget: BudgetManager,
    alerts: CostAlertManager,
    optimizer: CostOptimizer,
    rewards: RewardPipeline,
    metrics: GatewayMetrics,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("provider", &self.provider.name())
            .field("domain", &self.config.routing.domain)
            .field("budget", &self.budget)
            .finish()
    }
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Route and execute one request. Never panics on backend failure;
    /// every outcome is described by the response.
    pub async fn route(&self, request: RouteRequest) -> RouteResponse {
        let started = Instant::now();
        self.metrics.request();
        let mut state = self.states.checkout();
        state.request_id = Uuid::new_v4().to_string();

        let result = self.execute(&mut state, &request, started).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(done) => RouteResponse {
                request_id: state.request_id.clone(),
                status: RouteStatus::Success,
                model: state.model.clone(),
                response: Some(done.completion.content),
                error: None,
                tokens: done.tokens,
                provider: self.provider.name().to_string(),
                cached: done.cached,
                cache_info: done.cache_info,
                compression_info: state.compression.take(),
                selection: state.source,
                projected_cost: state.projected_cost,
                cost: done.cost,
                latency_ms,
            },
            Err(err) => {
                self.metrics.failure();
                tracing::warn!(
                    request_id = %state.request_id,
                    task_type = %request.task_type,
                    kind = err.kind().as_str(),
                    error = %err,
                    "route failed"
                );
                RouteResponse {
                    request_id: state.request_id.clone(),
                    status: RouteStatus::Error,
                    model: state.model.clone(),
                    response: None,
                    error: Some(ErrorBody {
                        kind: err.kind(),
                        message: err.to_string(),
                        model: err
                            .model()
                            .map(str::to_string)
                            .or_else(|| (!state.model.is_empty()).then(|| state.model.clone())),
                        task_type: Some(request.task_type.clone()),
                        projected_cost: state.projected_cost,
                    }),
                    tokens: TokenReport {
                        prompt_tokens: state.tokens_in,
                        completion_tokens: 0,
                        total: state.tokens_in,
                        estimated: true,
                    },
                    provider: self.provider.name().to_string(),
                    cached: false,
                    cache_info: None,
                    compression_info: state.compression.take(),
                    selection: state.source,
                    projected_cost: state.projected_cost,
                    cost: 0.0,
                    latency_ms,
                }
            }
        }
    }

    /// Run `fut` inside a pipeline scope limited by `budget.pipeline`.
    ///
    /// Every route made inside `fut` is checked against and charged to
    /// one shared scope; its totals come back with the output.
    pub async fn track_pipeline<F>(&self, fut: F) -> (F::Output, PipelineTotals)
    where
        F: Future,
    {
        let budget = Arc::new(Mutex::new(PipelineBudget::new(self.config.budget.pipeline.clone())));
        let output = tracking::track_pipeline(Arc::clone(&budget), fut).await;
        let totals = PipelineTotals::from(&*budget.lock());
        tracing::debug!(total = totals.total, charges = totals.charges, "pipeline finished");
        (output, totals)
    }

    /// Route several requests, concurrently up to `routing.max_concurrency`
    /// when async routing is enabled. Responses keep the input order.
    pub async fn route_many(&self, requests: Vec<RouteRequest>) -> Vec<RouteResponse> {
        if self.config.routing.async_enabled {
            stream::iter(requests)
                .map(|r| self.route(r))
                .buffered(self.config.routing.max_concurrency.max(1))
                .collect()
                .await
        } else {
            let mut responses = Vec::with_capacity(requests.len());
            for request in requests {
                responses.push(self.route(request).await);
            }
            responses
        }
    }

    async fn execute(
        &self,
        state: &mut RouteState,
        request: &RouteRequest,
        started: Instant,
    ) -> Result<Executed, GatewayError> {
        if request.prompt.trim().is_empty() {
            return Err(GatewayError::Validation("prompt must not be empty".to_string()));
        }
        if request.task_type.trim().is_empty() {
            return Err(GatewayError::Validation("task_type must not be empty".to_string()));
        }

        self.routes.prepare_route_state(state, request)?;
        tracing::debug!(
            request_id = %state.request_id,
            task_type = %state.task_type,
            model = %state.model,
            source = ?state.source,
            projected_cost = state.projected_cost,
            "route prepared"
        );

        let namespace = state.namespace();
        let cache_request = CacheRequest {
            task_type: &state.task_type,
            prompt: &state.prompt,
            provider_options: request.provider_options.as_ref(),
            namespace: &namespace,
            system_prompt: request.system_prompt.as_deref(),
            model: &state.model,
        };
        let use_cache = request.use_cache && self.cache.is_enabled();
        let mut cache_info = None;
        if use_cache {
            match self.cache.lookup(&cache_request).await {
                CacheLookup::Hit { response, info } => {
                    match info.tier {
                        Some(CacheTier::Semantic) => self.metrics.semantic_hit(),
                        _ => self.metrics.exact_hit(),
                    }
                    self.optimizer.record_usage(
                        "gateway",
                        &state.task_type,
                        &state.model,
                        response.usage.total(),
                        true,
                    );
                    self.metrics.success(0.0);
                    let tokens = token_report(&response, state);
                    return Ok(Executed {
                        completion: response,
                        tokens,
                        cost: 0.0,
                        cached: true,
                        cache_info: Some(info),
                    });
                }
                CacheLookup::ShadowHit { info } => {
                    self.metrics.shadow_hit();
                    cache_info = Some(info);
                }
                CacheLookup::Miss { info } => cache_info = Some(info),
            }
        }

        self.admit(state)?;

        let dependency = format!("{}:{}", self.provider.name(), state.model);
        if self.breaker.check(&dependency).is_err() {
            self.metrics.breaker_rejection();
            tracing::warn!(dependency = %dependency, task_type = %state.task_type, "circuit open, rejecting");
            return Err(GatewayError::CircuitOpen {
                dependency,
                model: state.model.clone(),
                task_type: state.task_type.clone(),
            });
        }

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system_prompt.as_deref() {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(state.prompt.clone()));
        let timeout = self.config.resilience.request_timeout;
        let completion = CompletionConfig {
            model: state.model.clone(),
            max_tokens: request.max_tokens,
            temperature: None,
            timeout,
            provider_options: request.provider_options.clone(),
        };

        let provider = Arc::clone(&self.provider);
        let outcome = self
            .retry
            .execute(|| {
                let provider = Arc::clone(&provider);
                let messages = messages.clone();
                let completion = completion.clone();
                async move {
                    match tokio::time::timeout(timeout, provider.complete(messages, &completion)).await {
                        Ok(result) => result,
                        Err(_) => Err(ProviderError::Timeout(timeout)),
                    }
                }
            })
            .await;
        self.metrics.retries(outcome.retries());
        let latency = started.elapsed().as_secs_f64();

        let response = match outcome.result {
            Ok(response) => response,
            Err(error) => {
                // Caller errors say nothing about backend health.
                let retryable = self.retry.should_retry(&error);
                if retryable {
                    self.breaker.record_failure(&dependency);
                }
                self.learning.record(
                    &self.config.routing.domain,
                    &state.context,
                    &state.model,
                    FAILURE_REWARD,
                );
                return Err(GatewayError::from_provider(
                    error,
                    &state.model,
                    &state.task_type,
                    outcome.attempts,
                    retryable,
                ));
            }
        };
        self.breaker.record_success(&dependency);

        let cost = if response.usage.is_reported() {
            state.cost_of(response.usage.total())
        } else {
            state.projected_cost
        };
        self.settle(state, cost);
        self.optimizer
            .record_usage("gateway", &state.task_type, &state.model, token_report(&response, state).total, false);

        let signals = RewardSignals::from_response(&response.content, response_quality(&response), 0.0);
        let reward = self.rewards.compute(
            &self.config.routing.domain,
            &state.context,
            &Outcome {
                cost,
                latency,
                success: true,
            },
            &signals,
            None,
        );
        self.learning
            .record(&self.config.routing.domain, &state.context, &state.model, reward);
        self.routes.observe(cost, latency);

        if use_cache {
            let stored = self.cache.store(&cache_request, &response).await;
            if let Some(info) = cache_info.as_mut() {
                info.stored_tiers = stored;
            }
        }
        self.metrics.success(cost);
        tracing::info!(
            request_id = %state.request_id,
            model = %state.model,
            task_type = %state.task_type,
            cost,
            reward,
            latency_ms = (latency * 1000.0) as u64,
            "route completed"
        );

        let tokens = token_report(&response, state);
        Ok(Executed {
            completion: response,
            tokens,
            cost,
            cached: false,
            cache_info,
        })
    }

    /// Pipeline scope, then per-request and daily budget.
    fn admit(&self, state: &RouteState) -> Result<(), GatewayError> {
        let ceiling = self.config.max_per_request(state.tenant.as_deref());
        let check = tracking::can_charge(&state.task_type, state.projected_cost)
            .and_then(|()| self.budget.preflight_with_ceiling(state.projected_cost, ceiling));
        check.map_err(|source| {
            self.metrics.budget_rejection();
            GatewayError::BudgetExceeded {
                model: state.model.clone(),
                task_type: state.task_type.clone(),
                projected_cost: state.projected_cost,
                source,
            }
        })
    }

    /// Charge once to the daily ledger and the pipeline scope, then alert.
    fn settle(&self, state: &RouteState, cost: f64) {
        let spent_today = self.budget.charge(cost);
        tracking::charge(&state.task_type, cost);
        let limits = self.budget.limits();
        self.alerts.evaluate(&ChargeEvent {
            tenant: state.tenant.clone(),
            workspace: state.workspace.clone(),
            model: state.model.clone(),
            cost,
            spent_today,
            daily_budget: limits.daily_budget,
            max_per_request: self.config.max_per_request(state.tenant.as_deref()),
        });
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn emit_metrics(&self) -> MetricsSnapshot {
        self.metrics.emit()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn budget_status(&self) -> BudgetStatus {
        self.budget.status()
    }

    pub fn budget(&self) -> &BudgetManager {
        &self.budget
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn learning(&self) -> &Arc<LearningEngine> {
        &self.learning
    }

    pub fn cost_analysis(&self) -> CostAnalysis {
        self.optimizer.analyze_cost_patterns()
    }

    pub fn snapshot_learning(&self) -> LearningSnapshot {
        self.learning.snapshot()
    }

    pub fn restore_learning(&self, snapshot: &LearningSnapshot) -> RestoreReport {
        self.learning.restore(snapshot)
    }
}

fn token_report(response: &CompletionResponse, state: &RouteState) -> TokenReport {
    if response.usage.is_reported() {
        TokenReport {
            prompt_tokens: response.usage.prompt_tokens,
            completion_tokens: response.usage.completion_tokens,
            total: response.usage.total(),
            estimated: false,
        }
    } else {
        let completion_tokens = relay_core::TokenMeter::estimate_tokens(&response.content);
        TokenReport {
            prompt_tokens: state.tokens_in,
            completion_tokens,
            total: state.tokens_in + completion_tokens,
            estimated: true,
        }
    }
}

/// Quality proxy available without a judge model.
fn response_quality(response: &CompletionResponse) -> f64 {
    if response.content.trim().is_empty() {
        0.0
    } else if response.finish_reason.as_deref() == Some("length") {
        0.5
    } else {
        1.0
    }
}

type Clock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

pub struct GatewayBuilder {
    config: GatewayConfig,
    provider: Option<Arc<dyn LlmProvider>>,
    external_router: Option<Arc<dyn ExternalRouter>>,
    embedder: Option<Arc<dyn Embedder>>,
    cache_store: Option<Arc<dyn CacheStore>>,
    alert_sink: Option<Arc<dyn AlertSink>>,
    clock: Option<Clock>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            provider: None,
            external_router: None,
            embedder: None,
            cache_store: None,
            alert_sink: None,
            clock: None,
        }
    }

    /// Use `provider` instead of building one from the provider section.
    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn external_router(mut self, router: Arc<dyn ExternalRouter>) -> Self {
        self.external_router = Some(router);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = Some(sink);
        self
    }

    /// Source of "today" for the daily budget.
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Gateway, BuildError> {
        let config = Arc::new(self.config);

        let provider = match self.provider {
            Some(provider) => provider,
            None if config.provider.kind == OPENROUTER_PROVIDER => {
                let pool = ConnectionPool::new(&config.resilience.pool, config.provider.timeout)?;
                Arc::new(OpenRouterProvider::new(&config.provider, Arc::new(pool))?)
            }
            None => ProviderRegistry::with_defaults().create_from(&config.provider)?,
        };

        let experiments = Arc::new(ExperimentManager::from_config(&config.experiments)?);
        let learning = Arc::new(
            LearningEngine::new(config.learning.clone()).with_experiments(experiments),
        );

        let mut routes = RouteStateBuilder::new(Arc::clone(&config), Arc::clone(&learning));
        if let Some(external) = self.external_router {
            routes = routes.with_external(external);
        }

        let embedder = self
            .embedder
            .unwrap_or_else(|| Arc::new(HashingEmbedder::new(config.cache.semantic.embedding_dim)));
        let cache = match self.cache_store {
            Some(store) => CacheLayer::with_store(config.cache.clone(), store, embedder),
            None => CacheLayer::with_embedder(config.cache.clone(), embedder),
        };

        let budget = match self.clock {
            Some(clock) => BudgetManager::with_clock(config.budget.limits, clock),
            None => BudgetManager::new(config.budget.limits),
        };
        let alerts = match self.alert_sink {
            Some(sink) => CostAlertManager::with_sink(config.alerts.clone(), sink),
            None => CostAlertManager::new(config.alerts.clone()),
        };

        let pool_size = config.resilience.pool.object_pool_size;
        let states = ObjectPool::new(pool_size, RouteState::default, RouteState::clear);

        tracing::info!(
            provider = provider.name(),
            policy = %config.learning.policy,
            domain = %config.routing.domain,
            "gateway ready"
        );

        Ok(Gateway {
            provider,
            routes,
            states,
            cache,
            breaker: CircuitBreaker::new(config.resilience.circuit_breaker.clone()),
            retry: RetryStrategy::new(config.resilience.retry.clone()),
            budget,
            alerts,
            optimizer: CostOptimizer::new(config.pricing.clone()),
            rewards: RewardPipeline::new(config.learning.reward_weights),
            metrics: GatewayMetrics::new(),
            learning,
            config,
        })
    }
}
