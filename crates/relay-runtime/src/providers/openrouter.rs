//! OpenRouter-compatible chat completions provider.
//!
//! Speaks the OpenAI-style `/chat/completions` contract that OpenRouter and
//! most self-hosted gateways expose. The request and response codecs are
//! plain functions so they can be tested without a network.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

use relay_core::config::{PoolConfig, ProviderConfig};

use super::{
    factory::ProviderFactory,
    secrets::{ApiCredential, CredentialSource},
    ChatMessage, CompletionConfig, CompletionResponse, LlmProvider, ProviderError, TokenUsage,
};
use crate::pool::ConnectionPool;

/// Provider type name used in configuration.
pub const OPENROUTER_PROVIDER: &str = "openrouter";

const CREDENTIAL_NAME: &str = "OpenRouter API key";

pub struct OpenRouterProvider {
    credential: ApiCredential,
    base_url: String,
    referer: Option<String>,
    title: Option<String>,
    default_max_tokens: Option<u32>,
    pool: Arc<ConnectionPool>,
}

impl std::fmt::Debug for OpenRouterProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterProvider")
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .field("referer", &self.referer)
            .field("title", &self.title)
            .finish()
    }
}

impl OpenRouterProvider {
    /// Build from the gateway's provider section, sharing `pool`.
    pub fn new(config: &ProviderConfig, pool: Arc<ConnectionPool>) -> Result<Self, ProviderError> {
        let credential =
            ApiCredential::resolve(config.api_key.as_deref(), &config.api_key_env, CREDENTIAL_NAME)?;
        Ok(Self {
            credential,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            referer: config.referer.clone(),
            title: config.title.clone(),
            default_max_tokens: config.max_tokens,
            pool,
        })
    }

    /// Build from the JSON form of the provider section with a private pool.
    pub fn from_config(config: &JsonValue) -> Result<Self, ProviderError> {
        let parsed: ProviderConfig = serde_json::from_value(config.clone())
            .map_err(|e| ProviderError::NotConfigured(format!("invalid provider config: {e}")))?;
        let pool = ConnectionPool::new(&PoolConfig::default(), parsed.timeout)
            .map_err(|e| ProviderError::NotConfigured(e.to_string()))?;
        Self::new(&parsed, Arc::new(pool))
    }

    /// Programmatic construction, mainly for tests and embedding.
    pub fn with_key(api_key: impl Into<String>, pool: Arc<ConnectionPool>) -> Self {
        Self {
            credential: ApiCredential::new(api_key, CredentialSource::Programmatic, CREDENTIAL_NAME),
            base_url: ProviderConfig::default().base_url,
            referer: None,
            title: None,
            default_max_tokens: None,
            pool,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

/// Request body: `{model, messages, provider?, max_tokens?, temperature?}`.
pub fn build_request_body(messages: &[ChatMessage], config: &CompletionConfig) -> JsonValue {
    let mut body = serde_json::json!({
        "model": config.model,
        "messages": messages,
    });
    if let Some(provider) = &config.provider_options {
        body["provider"] = provider.clone();
    }
    if let Some(max_tokens) = config.max_tokens {
        body["max_tokens"] = max_tokens.into();
    }
    if let Some(temperature) = config.temperature {
        body["temperature"] = serde_json::json!(temperature);
    }
    body
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Decode a successful body. Content comes from `choices[0].message.content`.
pub fn parse_response(body: &str, requested_model: &str) -> Result<CompletionResponse, ProviderError> {
    let parsed: ChatCompletion =
        serde_json::from_str(body).map_err(|e| ProviderError::ParseError(e.to_string()))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::ParseError("response has no choices".to_string()))?;
    let usage = parsed
        .usage
        .map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        })
        .unwrap_or_default();

    Ok(CompletionResponse {
        content: choice.message.content.unwrap_or_default(),
        usage,
        model: parsed.model.unwrap_or_else(|| requested_model.to_string()),
        finish_reason: choice.finish_reason,
    })
}

/// Map a non-2xx status to an error. 429 and 5xx are retryable; the
/// remaining 4xx are not.
pub fn classify_status(status: u16, body: &str, retry_after: Option<Duration>) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited { retry_after },
        401 | 403 => ProviderError::AuthError,
        _ => {
            let message = serde_json::from_str::<ErrorEnvelope>(body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| body.chars().take(200).collect());
            ProviderError::ApiError { status, message }
        }
    }
}

#[async_trait]
impl LlmProvider for OpenRouterProvider {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError> {
        let url = self.endpoint();
        let mut effective = config.clone();
        if effective.max_tokens.is_none() {
            effective.max_tokens = self.default_max_tokens;
        }
        let body = build_request_body(&messages, &effective);

        // Held until the body has been read.
        let _permit = self
            .pool
            .acquire(&url)
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))?;

        let mut request = self
            .pool
            .client()
            .post(&url)
            .bearer_auth(self.credential.expose())
            .timeout(config.timeout)
            .json(&body);
        if let Some(referer) = &self.referer {
            request = request.header("HTTP-Referer", referer);
        }
        if let Some(title) = &self.title {
            request = request.header("X-Title", title);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(config.timeout)
            } else {
                ProviderError::Connection(e.to_string())
            }
        })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(config.timeout)
            } else {
                ProviderError::Connection(e.to_string())
            }
        })?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &text, retry_after));
        }
        parse_response(&text, &config.model)
    }

    async fn health_check(&self) -> bool {
        !self.credential.is_empty()
    }

    fn name(&self) -> &str {
        OPENROUTER_PROVIDER
    }
}

/// Factory for the `openrouter` provider kind.
///
/// ```json
/// {
///   "api_key": "sk-or-...",                  // optional, falls back to api_key_env
///   "api_key_env": "OPENROUTER_API_KEY",
///   "base_url": "https://openrouter.ai/api/v1",
///   "referer": "https://example.com",        // optional HTTP-Referer
///   "title": "my-app",                       // optional X-Title
///   "timeout": "60s"
/// }
/// ```
pub struct OpenRouterProviderFactory;

impl ProviderFactory for OpenRouterProviderFactory {
    fn provider_type(&self) -> &'static str {
        OPENROUTER_PROVIDER
    }

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        Ok(Arc::new(OpenRouterProvider::from_config(config)?))
    }

    fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError> {
        let env_var = config["api_key_env"]
            .as_str()
            .unwrap_or("OPENROUTER_API_KEY");
        if !ApiCredential::is_available(config, "api_key", env_var) {
            return Err(ProviderError::NotConfigured(format!(
                "{CREDENTIAL_NAME} required: set 'api_key' in config or {env_var} env"
            )));
        }
        if let Some(url) = config["base_url"].as_str() {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ProviderError::NotConfigured(
                    "base_url must start with http:// or https://".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn default_config(&self) -> JsonValue {
        serde_json::to_value(ProviderConfig::default()).unwrap_or_default()
    }

    fn description(&self) -> &'static str {
        "OpenRouter-compatible chat completions provider"
    }
}
