//! LLM backend abstractions.
//!
//! Every outbound completion goes through [`LlmProvider`]. The gateway
//! only ever holds a trait object, so tests substitute in-memory providers
//! and new backends register through [`ProviderRegistry`].
//!
//! ## Security
//!
//! Providers hold keys as [`ApiCredential`], which never prints its value.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use relay_core::TokenMeter;

mod factory;
mod openrouter;
pub mod secrets;

pub use factory::{ProviderFactory, ProviderRegistry};
pub use openrouter::{OpenRouterProvider, OpenRouterProviderFactory, OPENROUTER_PROVIDER};
pub use secrets::{ApiCredential, CredentialSource};

/// Errors from LLM providers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    ParseError(String),

    #[error("Authentication failed")]
    AuthError,

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// HTTP status behind this error, when there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::RateLimited { .. } => Some(429),
            ProviderError::ApiError { status, .. } => Some(*status),
            ProviderError::AuthError => Some(401),
            _ => None,
        }
    }
}

/// Per-call settings.
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub model: String,

    /// Omitted from the request when `None`.
    pub max_tokens: Option<u32>,

    pub temperature: Option<f32>,

    pub timeout: Duration,

    /// Routing preferences forwarded verbatim as the request's `provider` field.
    pub provider_options: Option<serde_json::Value>,
}

impl CompletionConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_tokens: None,
            temperature: None,
            timeout: Duration::from_secs(60),
            provider_options: None,
        }
    }
}

/// A chat message for LLM completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role: "system", "user", or "assistant"
    pub role: String,

    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,

    pub usage: TokenUsage,

    /// Model reported by the backend.
    pub model: String,

    pub finish_reason: Option<String>,
}

/// Token usage reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Whether the backend reported anything at all.
    pub fn is_reported(&self) -> bool {
        self.total() > 0
    }
}

/// Provider abstraction allows swapping LLM backends.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Execute a chat completion.
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError>;

    async fn health_check(&self) -> bool;

    /// Provider name for metrics and breaker keys.
    fn name(&self) -> &str;

    fn estimate_tokens(&self, text: &str) -> u32 {
        TokenMeter::estimate_tokens(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_roles() {
        assert_eq!(ChatMessage::system("s").role, "system");
        assert_eq!(ChatMessage::user("u").role, "user");
        assert_eq!(ChatMessage::assistant("a").role, "assistant");
    }

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 50,
        };
        assert_eq!(usage.total(), 150);
        assert!(usage.is_reported());
        assert!(!TokenUsage::default().is_reported());
    }

    #[test]
    fn test_error_status() {
        assert_eq!(ProviderError::RateLimited { retry_after: None }.status(), Some(429));
        assert_eq!(
            ProviderError::ApiError {
                status: 503,
                message: "down".into()
            }
            .status(),
            Some(503)
        );
        assert_eq!(ProviderError::Timeout(Duration::from_secs(1)).status(), None);
    }
}
