//! Credential handling for LLM providers.
//!
//! Keys are wrapped in [`secrecy::SecretString`] as soon as they are read
//! and only exposed when an HTTP header is built. Debug and Display print
//! `[REDACTED]` together with where the key came from.
//!
//! ```ignore
//! let cred = ApiCredential::resolve(config.api_key.as_deref(), &config.api_key_env, "OpenRouter API key")?;
//! request.bearer_auth(cred.expose());
//! ```

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value as JsonValue;
use std::fmt;

use super::ProviderError;

/// Where a credential was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Config,
    Environment,
    Programmatic,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Config => write!(f, "config"),
            CredentialSource::Environment => write!(f, "environment"),
            CredentialSource::Programmatic => write!(f, "programmatic"),
        }
    }
}

/// An API key that cannot be printed by accident.
pub struct ApiCredential {
    value: SecretString,
    source: CredentialSource,
    name: &'static str,
}

impl ApiCredential {
    pub fn new(value: impl Into<String>, source: CredentialSource, name: &'static str) -> Self {
        Self {
            value: SecretString::from(value.into()),
            source,
            name,
        }
    }

    pub fn from_env(env_var: &str, name: &'static str) -> Result<Self, ProviderError> {
        std::env::var(env_var)
            .map(|v| Self::new(v, CredentialSource::Environment, name))
            .map_err(|_| {
                ProviderError::NotConfigured(format!(
                    "{} not set: configure '{}' environment variable",
                    name, env_var
                ))
            })
    }

    /// An inline value wins; otherwise the environment variable is read.
    pub fn resolve(
        inline: Option<&str>,
        env_var: &str,
        name: &'static str,
    ) -> Result<Self, ProviderError> {
        match inline {
            Some(value) if !value.is_empty() => Ok(Self::new(value, CredentialSource::Config, name)),
            _ => Self::from_env(env_var, name).map_err(|_| {
                ProviderError::NotConfigured(format!(
                    "{} required: set 'api_key' in config or {} environment variable",
                    name, env_var
                ))
            }),
        }
    }

    /// [`resolve`](Self::resolve) reading the inline value from `config[config_key]`.
    pub fn from_config_or_env(
        config: &JsonValue,
        config_key: &str,
        env_var: &str,
        name: &'static str,
    ) -> Result<Self, ProviderError> {
        Self::resolve(config[config_key].as_str(), env_var, name)
    }

    /// Check availability without reading the value into a credential.
    pub fn is_available(config: &JsonValue, config_key: &str, env_var: &str) -> bool {
        config[config_key].as_str().is_some_and(|v| !v.is_empty()) || std::env::var(env_var).is_ok()
    }

    /// The raw key. Call only where the header is built.
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.value.expose_secret().is_empty()
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredential")
            .field("value", &"[REDACTED]")
            .field("source", &self.source)
            .field("name", &self.name)
            .finish()
    }
}

impl fmt::Display for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {} [REDACTED]", self.name, self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_redacted() {
        let secret = "sk-or-v1-secret-12345";
        let cred = ApiCredential::new(secret, CredentialSource::Config, "OpenRouter API key");

        let debug = format!("{:?}", cred);
        let display = format!("{}", cred);
        assert!(!debug.contains(secret), "Secret exposed in Debug!");
        assert!(!display.contains(secret), "Secret exposed in Display!");
        assert!(display.contains("config"));
        assert_eq!(cred.expose(), secret);
    }

    #[test]
    fn test_inline_value_wins_over_env() {
        std::env::set_var("RELAY_TEST_KEY_PRIORITY", "env-key");
        let cred = ApiCredential::resolve(Some("inline-key"), "RELAY_TEST_KEY_PRIORITY", "Test key").unwrap();
        assert_eq!(cred.expose(), "inline-key");
        assert_eq!(cred.source(), CredentialSource::Config);
        std::env::remove_var("RELAY_TEST_KEY_PRIORITY");
    }

    #[test]
    fn test_empty_inline_falls_back_to_env() {
        std::env::set_var("RELAY_TEST_KEY_FALLBACK", "env-key");
        let cred = ApiCredential::resolve(Some(""), "RELAY_TEST_KEY_FALLBACK", "Test key").unwrap();
        assert_eq!(cred.expose(), "env-key");
        assert_eq!(cred.source(), CredentialSource::Environment);
        std::env::remove_var("RELAY_TEST_KEY_FALLBACK");
    }

    #[test]
    fn test_missing_credential_names_both_sources() {
        let err = ApiCredential::from_config_or_env(
            &serde_json::json!({}),
            "api_key",
            "RELAY_NONEXISTENT_VAR_12345",
            "Test key",
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Test key"));
        assert!(msg.contains("RELAY_NONEXISTENT_VAR_12345"));
    }

    #[test]
    fn test_is_available() {
        assert!(ApiCredential::is_available(
            &serde_json::json!({"api_key": "value"}),
            "api_key",
            "RELAY_NONEXISTENT"
        ));
        assert!(!ApiCredential::is_available(
            &serde_json::json!({"api_key": ""}),
            "api_key",
            "RELAY_NONEXISTENT"
        ));
    }
}
