//! User-visible failure taxonomy of the gateway.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use relay_core::BudgetError;

use crate::providers::ProviderError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Budget exceeded for model '{model}' (task: {task_type}, projected ${projected_cost:.6}): {source}")]
    BudgetExceeded {
        model: String,
        task_type: String,
        projected_cost: f64,
        #[source]
        source: BudgetError,
    },

    #[error("Dependency '{dependency}' unavailable (circuit open) for model '{model}' (task: {task_type})")]
    CircuitOpen {
        dependency: String,
        model: String,
        task_type: String,
    },

    #[error("Model '{model}' failed after {attempts} attempt(s) (task: {task_type}): {source}")]
    Transient {
        model: String,
        task_type: String,
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("Model '{model}' rejected the request (task: {task_type}): {source}")]
    Permanent {
        model: String,
        task_type: String,
        #[source]
        source: ProviderError,
    },

    #[error("Model '{model}' timed out after {after:?} (task: {task_type})")]
    Timeout {
        model: String,
        task_type: String,
        after: Duration,
    },
}

/// Coarse classification used by callers deciding whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    BudgetExceeded,
    DependencyUnavailable,
    TransientNetwork,
    PermanentRequest,
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::DependencyUnavailable => "dependency_unavailable",
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::PermanentRequest => "permanent_request",
            ErrorKind::Timeout => "timeout",
        }
    }
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Validation(_) => ErrorKind::Validation,
            GatewayError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            GatewayError::CircuitOpen { .. } => ErrorKind::DependencyUnavailable,
            GatewayError::Transient { .. } => ErrorKind::TransientNetwork,
            GatewayError::Permanent { .. } => ErrorKind::PermanentRequest,
            GatewayError::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Model involved, when the failure got as far as choosing one.
    pub fn model(&self) -> Option<&str> {
        match self {
            GatewayError::Validation(_) => None,
            GatewayError::BudgetExceeded { model, .. }
            | GatewayError::CircuitOpen { model, .. }
            | GatewayError::Transient { model, .. }
            | GatewayError::Permanent { model, .. }
            | GatewayError::Timeout { model, .. } => Some(model),
        }
    }

    pub fn task_type(&self) -> Option<&str> {
        match self {
            GatewayError::Validation(_) => None,
            GatewayError::BudgetExceeded { task_type, .. }
            | GatewayError::CircuitOpen { task_type, .. }
            | GatewayError::Transient { task_type, .. }
            | GatewayError::Permanent { task_type, .. }
            | GatewayError::Timeout { task_type, .. } => Some(task_type),
        }
    }

    /// Admission rejections the gateway never retries on its own.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::BudgetExceeded | ErrorKind::DependencyUnavailable
        )
    }

    /// Classify a provider failure that survived the retry loop.
    pub fn from_provider(
        error: ProviderError,
        model: &str,
        task_type: &str,
        attempts: u32,
        retryable: bool,
    ) -> Self {
        match error {
            ProviderError::Timeout(after) => GatewayError::Timeout {
                model: model.to_string(),
                task_type: task_type.to_string(),
                after,
            },
            source if retryable => GatewayError::Transient {
                model: model.to_string(),
                task_type: task_type.to_string(),
                attempts,
                source,
            },
            source => GatewayError::Permanent {
                model: model.to_string(),
                task_type: task_type.to_string(),
                source,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_rejection_message_names_model_and_cost() {
        let err = GatewayError::BudgetExceeded {
            model: "openai/gpt-4o".into(),
            task_type: "summarize".into(),
            projected_cost: 1.01,
            source: BudgetError::PerRequestExceeded {
                cost: 1.01,
                limit: 1.0,
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("openai/gpt-4o"));
        assert!(msg.contains("summarize"));
        assert!(msg.contains("1.010000"));
        assert!(err.is_rejection());
        assert_eq!(err.kind().as_str(), "budget_exceeded");
    }

    #[test]
    fn test_from_provider_classification() {
        let timeout = GatewayError::from_provider(
            ProviderError::Timeout(Duration::from_secs(3)),
            "m",
            "t",
            3,
            true,
        );
        assert_eq!(timeout.kind(), ErrorKind::Timeout);

        let transient = GatewayError::from_provider(
            ProviderError::ApiError {
                status: 503,
                message: "overloaded".into(),
            },
            "m",
            "t",
            3,
            true,
        );
        assert_eq!(transient.kind(), ErrorKind::TransientNetwork);
        assert!(transient.to_string().contains("3 attempt"));

        let permanent = GatewayError::from_provider(ProviderError::AuthError, "m", "t", 1, false);
        assert_eq!(permanent.kind(), ErrorKind::PermanentRequest);
        assert_eq!(permanent.model(), Some("m"));
        assert!(!permanent.is_rejection());
    }
}
