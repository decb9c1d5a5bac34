//! Per-request routing state.

use serde::Serialize;

use relay_core::Context;

use super::compression::CompressionInfo;

/// Why a model was chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    /// Named by the caller.
    Explicit,
    External,
    Trial,
    Learning,
    Experiment,
    /// Learning failed or was unavailable.
    Fallback,
    #[default]
    Default,
}

/// Mutable state owned by one in-flight request.
///
/// Instances are recycled through an object pool, so [`RouteState::clear`]
/// must leave no trace of the previous request.
#[derive(Debug, Clone, Default)]
pub struct RouteState {
    pub request_id: String,
    pub task_type: String,
    pub tenant: Option<String>,
    pub workspace: Option<String>,
    pub candidates: Vec<String>,
    pub model: String,
    pub source: SelectionSource,
    /// Prompt as it will be sent, after compression.
    pub prompt: String,
    pub compression: Option<CompressionInfo>,
    pub tokens_in: u32,
    pub tokens_out: u32,
    /// USD per 1k tokens for `model` under the tenant's price table.
    pub price_per_1k: f64,
    pub projected_cost: f64,
    /// Cheaper candidate that also fits the per-request ceiling.
    pub cheaper_alternative: Option<String>,
    pub context: Context,
}

impl RouteState {
    pub fn clear(&mut self) {
        self.request_id.clear();
        self.task_type.clear();
        self.tenant = None;
        self.workspace = None;
        self.candidates.clear();
        self.model.clear();
        self.source = SelectionSource::Default;
        self.prompt.clear();
        self.compression = None;
        self.tokens_in = 0;
        self.tokens_out = 0;
        self.price_per_1k = 0.0;
        self.projected_cost = 0.0;
        self.cheaper_alternative = None;
        self.context = Context::new();
    }

    /// `tenant:workspace`, with `default` standing in for either.
    pub fn namespace(&self) -> String {
        format!(
            "{}:{}",
            self.tenant.as_deref().unwrap_or("default"),
            self.workspace.as_deref().unwrap_or("default")
        )
    }

    /// Cost of `tokens` at this route's price.
    pub fn cost_of(&self, tokens: u32) -> f64 {
        tokens as f64 * self.price_per_1k / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_resets_everything() {
        let mut state = RouteState {
            request_id: "r".into(),
            task_type: "qa".into(),
            tenant: Some("acme".into()),
            candidates: vec!["a".into()],
            model: "a".into(),
            source: SelectionSource::Explicit,
            prompt: "hello".into(),
            tokens_in: 2,
            projected_cost: 0.5,
            cheaper_alternative: Some("b".into()),
            context: Context::new().with("tenant", "acme"),
            ..Default::default()
        };
        state.clear();
        assert!(state.task_type.is_empty());
        assert!(state.tenant.is_none());
        assert!(state.candidates.is_empty());
        assert_eq!(state.source, SelectionSource::Default);
        assert_eq!(state.projected_cost, 0.0);
        assert!(state.context.is_empty());
    }

    #[test]
    fn test_namespace_defaults() {
        let mut state = RouteState::default();
        assert_eq!(state.namespace(), "default:default");
        state.tenant = Some("acme".into());
        state.workspace = Some("ops".into());
        assert_eq!(state.namespace(), "acme:ops");
    }
}
