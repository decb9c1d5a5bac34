//! Model selection and route-state assembly.

use parking_lot::Mutex;
use std::sync::Arc;

use relay_core::learning::{ALLOCATION_KEY, TENANT_KEY};
use relay_core::{
    Context, FeatureExtractor, GatewayConfig, LearningEngine, RecommendationSource, TokenMeter,
};

use super::compression::PromptCompressor;
use super::state::{RouteState, SelectionSource};
use super::trials::AdaptiveTrials;
use crate::error::GatewayError;
use crate::gateway::RouteRequest;

/// Selection delegated to a system outside the gateway.
///
/// Returning `None`, or a model outside the candidate list, defers to the
/// gateway's own selection.
pub trait ExternalRouter: Send + Sync {
    fn select(&self, task_type: &str, candidates: &[String], context: &Context) -> Option<String>;

    fn name(&self) -> &str {
        "external"
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub model: String,
    pub source: SelectionSource,
    pub projected_cost: f64,
    /// The learned choice, when it was too expensive and replaced.
    pub downshifted_from: Option<String>,
}

/// Learned selection with cost guard rails.
pub struct Router {
    config: Arc<GatewayConfig>,
    learning: Arc<LearningEngine>,
}

impl Router {
    pub fn new(config: Arc<GatewayConfig>, learning: Arc<LearningEngine>) -> Self {
        Self { config, learning }
    }

    pub fn learning(&self) -> &Arc<LearningEngine> {
        &self.learning
    }

    /// Candidates the tenant may use, in the caller's order.
    pub fn allowed(&self, candidates: &[String], tenant: Option<&str>) -> Vec<String> {
        match self.config.allowed_models(tenant) {
            Some(allow) => candidates
                .iter()
                .filter(|m| allow.contains(m))
                .cloned()
                .collect(),
            None => candidates.to_vec(),
        }
    }

    /// Pick a model for `task_type`.
    ///
    /// A failed recommendation degrades to the first candidate. A choice
    /// above the tenant's per-request ceiling is replaced by the cheapest
    /// candidate under it, if any.
    pub fn route(
        &self,
        task_type: &str,
        candidates: &[String],
        context: &Context,
        tokens_in: u32,
        tokens_out: u32,
    ) -> Result<RouteDecision, GatewayError> {
        let tenant = context.text(TENANT_KEY);
        let allowed = self.allowed(candidates, tenant);
        let Some(first) = allowed.first() else {
            return Err(GatewayError::Validation(format!(
                "no permitted candidate models for task '{task_type}'"
            )));
        };

        let domain = &self.config.routing.domain;
        let (model, source) = match self.learning.recommend(domain, context, &allowed) {
            Ok(rec) => {
                let source = match rec.source {
                    RecommendationSource::Policy => SelectionSource::Learning,
                    RecommendationSource::Experiment => SelectionSource::Experiment,
                };
                (rec.action, source)
            }
            Err(e) => {
                tracing::warn!(domain, task_type, error = %e, "recommendation failed, using first candidate");
                (first.clone(), SelectionSource::Fallback)
            }
        };

        let meter = TokenMeter::new(self.config.effective_prices(tenant));
        let ceiling = self.config.max_per_request(tenant);
        let projected_cost = meter.estimate_cost(&model, tokens_in, tokens_out);
        if projected_cost <= ceiling {
            return Ok(RouteDecision {
                model,
                source,
                projected_cost,
                downshifted_from: None,
            });
        }

        match meter.cheapest_affordable(&allowed, tokens_in, tokens_out, ceiling) {
            Some(cheaper) => {
                let cost = meter.estimate_cost(&cheaper, tokens_in, tokens_out);
                tracing::info!(
                    task_type,
                    from = %model,
                    to = %cheaper,
                    cost,
                    ceiling,
                    "downshifting to affordable model"
                );
                Ok(RouteDecision {
                    model: cheaper,
                    source,
                    projected_cost: cost,
                    downshifted_from: Some(model),
                })
            }
            None => Ok(RouteDecision {
                model,
                source,
                projected_cost,
                downshifted_from: None,
            }),
        }
    }
}

/// Fills a [`RouteState`] for one request.
pub struct RouteStateBuilder {
    config: Arc<GatewayConfig>,
    router: Router,
    external: Option<Arc<dyn ExternalRouter>>,
    trials: AdaptiveTrials,
    compressor: PromptCompressor,
    features: Mutex<FeatureExtractor>,
}

/// Context key for the moving average of recent request cost.
pub const MEAN_COST_KEY: &str = "mean_cost";
/// Context key for the moving average of recent latency, in seconds.
pub const MEAN_LATENCY_KEY: &str = "mean_latency";

impl RouteStateBuilder {
    pub fn new(config: Arc<GatewayConfig>, learning: Arc<LearningEngine>) -> Self {
        Self {
            router: Router::new(Arc::clone(&config), learning),
            trials: AdaptiveTrials::new(config.routing.adaptive_trials.clone()),
            compressor: PromptCompressor::new(config.routing.compression.clone()),
            external: None,
            features: Mutex::new(FeatureExtractor::default()),
            config,
        }
    }

    /// Feed a completed request into the moving averages.
    pub fn observe(&self, cost: f64, latency: f64) {
        self.features.lock().observe(cost, latency);
    }

    pub fn with_external(mut self, external: Arc<dyn ExternalRouter>) -> Self {
        self.external = Some(external);
        self
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Resolve candidates, pick a model and price the request.
    ///
    /// Model priority: explicit, external router, adaptive trial, learning,
    /// static default.
    pub fn prepare_route_state(
        &self,
        state: &mut RouteState,
        request: &RouteRequest,
    ) -> Result<(), GatewayError> {
        let tenant = request.tenant.as_deref();
        state.task_type = request.task_type.clone();
        state.tenant = request.tenant.clone();
        state.workspace = request.workspace.clone();

        let configured = self.config.effective_candidates(tenant);
        let only_default =
            request.candidates.is_empty() && configured == [self.config.effective_default_model(tenant)];
        let requested = if request.candidates.is_empty() {
            configured
        } else {
            request.candidates.clone()
        };
        state.candidates = self.router.allowed(&requested, tenant);
        if state.candidates.is_empty() {
            return Err(GatewayError::Validation(format!(
                "no permitted candidate models for task '{}'",
                request.task_type
            )));
        }

        match self.compressor.compress(&request.prompt) {
            Some((compressed, info)) => {
                tracing::debug!(ratio = info.ratio, "prompt compressed");
                state.prompt = compressed;
                state.compression = Some(info);
            }
            None => state.prompt.push_str(&request.prompt),
        }
        let system_tokens = request
            .system_prompt
            .as_deref()
            .map(TokenMeter::estimate_tokens)
            .unwrap_or(0);
        state.tokens_in = TokenMeter::estimate_tokens(&state.prompt) + system_tokens;
        state.tokens_out = request
            .max_tokens
            .unwrap_or(self.config.routing.expected_output_tokens);

        let mut context = request.context.clone();
        context.insert("task_type", request.task_type.as_str());
        context.insert("prompt_tokens", state.tokens_in);
        if let Some(t) = tenant {
            context.insert(TENANT_KEY, t);
        }
        if let Some(w) = request.workspace.as_deref() {
            context.insert("workspace", w);
        }
        {
            let features = self.features.lock();
            context.insert(MEAN_COST_KEY, features.mean_cost());
            context.insert(MEAN_LATENCY_KEY, features.mean_latency());
        }
        if context.get(ALLOCATION_KEY).is_none() {
            context.insert(ALLOCATION_KEY, format!("{}:{}", state.namespace(), request.task_type));
        }
        state.context = context;

        let meter = TokenMeter::new(self.config.effective_prices(tenant));
        self.select_model(state, request)?;

        state.price_per_1k = meter.prices().per_1k(&state.model);
        state.projected_cost = meter.estimate_cost(&state.model, state.tokens_in, state.tokens_out);
        let ceiling = self.config.max_per_request(tenant);
        state.cheaper_alternative = meter
            .cheapest_affordable(&state.candidates, state.tokens_in, state.tokens_out, ceiling)
            .filter(|m| {
                *m != state.model
                    && meter.estimate_cost(m, state.tokens_in, state.tokens_out) < state.projected_cost
            });
        if only_default && state.source == SelectionSource::Learning {
            state.source = SelectionSource::Default;
        }
        Ok(())
    }

    fn select_model(
        &self,
        state: &mut RouteState,
        request: &RouteRequest,
    ) -> Result<(), GatewayError> {
        if let Some(model) = request.model.as_deref() {
            if !state.candidates.iter().any(|m| m == model)
                && self.config.allowed_models(state.tenant.as_deref()).is_some()
            {
                return Err(GatewayError::Validation(format!(
                    "model '{model}' is not permitted for this tenant"
                )));
            }
            state.model = model.to_string();
            state.source = SelectionSource::Explicit;
            return Ok(());
        }

        if let Some(external) = &self.external {
            if let Some(model) = external.select(&state.task_type, &state.candidates, &state.context) {
                if state.candidates.contains(&model) {
                    state.model = model;
                    state.source = SelectionSource::External;
                    return Ok(());
                }
                tracing::debug!(router = external.name(), model = %model, "external choice not a candidate");
            }
        }

        if let Some(model) = self.trials.suggest(&state.task_type, &state.candidates) {
            state.model = model;
            state.source = SelectionSource::Trial;
            return Ok(());
        }

        let decision = self.router.route(
            &state.task_type,
            &state.candidates,
            &state.context,
            state.tokens_in,
            state.tokens_out,
        )?;
        state.model = decision.model;
        state.source = decision.source;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::PriceTable;

    fn config(yaml: &str) -> Arc<GatewayConfig> {
        Arc::new(GatewayConfig::from_yaml(yaml).unwrap())
    }

    fn builder(config: Arc<GatewayConfig>) -> RouteStateBuilder {
        let learning = Arc::new(LearningEngine::new(config.learning.clone()));
        RouteStateBuilder::new(config, learning)
    }

    fn request(prompt: &str) -> RouteRequest {
        RouteRequest::new(prompt, "qa")
    }

    const PRICED: &str = r#"
learning:
  policy: epsilon_greedy
  params:
    epsilon: 0.0
routing:
  candidates: [cheap, pricey]
pricing:
  per_1k_tokens:
    cheap: 0.002
    pricey: 0.03
budget:
  max_per_request: 0.001
"#;

    #[test]
    fn test_explicit_model_wins() {
        let b = builder(config(PRICED));
        let mut state = RouteState::default();
        let mut req = request("hello");
        req.model = Some("pricey".into());
        b.prepare_route_state(&mut state, &req).unwrap();
        assert_eq!(state.model, "pricey");
        assert_eq!(state.source, SelectionSource::Explicit);
    }

    struct Fixed(&'static str);

    impl ExternalRouter for Fixed {
        fn select(&self, _: &str, _: &[String], _: &Context) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    #[test]
    fn test_external_router_before_learning() {
        let b = builder(config(PRICED)).with_external(Arc::new(Fixed("cheap")));
        let mut state = RouteState::default();
        b.prepare_route_state(&mut state, &request("hello")).unwrap();
        assert_eq!(state.source, SelectionSource::External);

        let b = builder(config(PRICED)).with_external(Arc::new(Fixed("not-a-candidate")));
        let mut state = RouteState::default();
        b.prepare_route_state(&mut state, &request("hello")).unwrap();
        assert_ne!(state.source, SelectionSource::External);
    }

    #[test]
    fn test_projected_cost_from_estimated_tokens() {
        let b = builder(config(PRICED));
        let mut state = RouteState::default();
        let mut req = request(&"a".repeat(400));
        req.model = Some("cheap".into());
        b.prepare_route_state(&mut state, &req).unwrap();
        assert_eq!(state.tokens_in, 100);
        assert!((state.projected_cost - 0.0002).abs() < 1e-12);
        assert!((state.cost_of(100) - 0.0002).abs() < 1e-12);
    }

    #[test]
    fn test_cheaper_alternative_recorded() {
        let b = builder(config(PRICED));
        let mut state = RouteState::default();
        let mut req = request(&"a".repeat(40));
        req.model = Some("pricey".into());
        b.prepare_route_state(&mut state, &req).unwrap();
        assert_eq!(state.cheaper_alternative.as_deref(), Some("cheap"));
    }

    #[test]
    fn test_router_downshifts_over_ceiling() {
        let config = config(PRICED);
        let learning = Arc::new(LearningEngine::new(config.learning.clone()));
        let router = Router::new(Arc::clone(&config), learning);
        let candidates = vec!["pricey".to_string(), "cheap".to_string()];
        // 100 tokens: pricey costs 0.003, over the 0.001 ceiling; cheap costs 0.0002.
        let decision = router
            .route("qa", &candidates, &Context::new(), 100, 0)
            .unwrap();
        assert_eq!(decision.model, "cheap");
        assert_eq!(decision.downshifted_from.as_deref(), Some("pricey"));
    }

    #[test]
    fn test_tenant_allow_list_filters_candidates() {
        let yaml = r#"
routing:
  candidates: [a, b, c]
  tenants:
    acme:
      allowed_models: [b]
"#;
        let b = builder(config(yaml));
        let mut state = RouteState::default();
        let mut req = request("hi");
        req.tenant = Some("acme".into());
        b.prepare_route_state(&mut state, &req).unwrap();
        assert_eq!(state.candidates, vec!["b"]);
        assert_eq!(state.model, "b");

        let mut req = request("hi");
        req.tenant = Some("acme".into());
        req.model = Some("a".into());
        let err = b.prepare_route_state(&mut RouteState::default(), &req).unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[test]
    fn test_moving_averages_reach_context() {
        let b = builder(config(PRICED));
        let mut state = RouteState::default();
        b.prepare_route_state(&mut state, &request("hi")).unwrap();
        assert_eq!(state.context.get(MEAN_COST_KEY).and_then(|v| v.as_number()), Some(0.0));

        b.observe(0.002, 1.0);
        b.observe(0.004, 3.0);
        let mut state = RouteState::default();
        b.prepare_route_state(&mut state, &request("hi")).unwrap();
        let mean_cost = state.context.get(MEAN_COST_KEY).and_then(|v| v.as_number()).unwrap();
        let mean_latency = state.context.get(MEAN_LATENCY_KEY).and_then(|v| v.as_number()).unwrap();
        assert!((mean_cost - 0.003).abs() < 1e-12);
        assert!((mean_latency - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_tenant_prices_override_global() {
        let yaml = r#"
routing:
  candidates: [m]
  tenants:
    acme:
      prices: { m: 0.01 }
pricing:
  per_1k_tokens: { m: 0.002 }
"#;
        let b = builder(config(yaml));
        let mut state = RouteState::default();
        let mut req = request(&"a".repeat(400));
        req.tenant = Some("acme".into());
        b.prepare_route_state(&mut state, &req).unwrap();
        assert!((state.projected_cost - 0.001).abs() < 1e-12);
        assert_eq!(PriceTable::default().per_1k("unknown"), 0.002);
    }

    #[test]
    fn test_default_model_when_nothing_configured() {
        let b = builder(config("{}"));
        let mut state = RouteState::default();
        b.prepare_route_state(&mut state, &request("hi")).unwrap();
        assert_eq!(state.model, "openai/gpt-4o-mini");
        assert_eq!(state.source, SelectionSource::Default);
    }
}
