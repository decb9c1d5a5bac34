//! Exact-key response cache.

use async_trait::async_trait;
use lazy_static::lazy_static;
use moka::future::Cache;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::CacheError;
use crate::providers::CompletionResponse;

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// Composite cache key.
///
/// The request part covers task type, normalized prompt, provider options
/// and namespace; the system prompt is digested separately and appended, so
/// two keys differing only in system prompt share a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExactKey(String);

impl ExactKey {
    pub fn new(
        task_type: &str,
        prompt: &str,
        provider_options: Option<&Value>,
        namespace: &str,
        system_prompt: Option<&str>,
    ) -> Self {
        let options = provider_options
            .map(canonical_signature)
            .unwrap_or_default();
        let request = digest(&[task_type, &normalize_prompt(prompt), &options, namespace]);
        let system = match system_prompt {
            Some(s) if !s.trim().is_empty() => digest(&[&normalize_prompt(s)]),
            _ => "none".to_string(),
        };
        Self(format!("{request}:{system}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trim and collapse runs of whitespace to a single space.
pub fn normalize_prompt(prompt: &str) -> String {
    WHITESPACE.replace_all(prompt.trim(), " ").into_owned()
}

/// Serialization of `value` with object keys sorted at every level.
pub fn canonical_signature(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Backend for the exact tier.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &ExactKey) -> Result<Option<CompletionResponse>, CacheError>;

    async fn put(&self, key: ExactKey, value: CompletionResponse) -> Result<(), CacheError>;

    fn len(&self) -> u64;

    fn clear(&self);
}

/// In-process store with TTL and a capacity bound.
pub struct MokaStore {
    cache: Cache<ExactKey, CompletionResponse>,
}

impl MokaStore {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();
        Self { cache }
    }
}

impl Default for MokaStore {
    fn default() -> Self {
        Self::new(10_000, Duration::from_secs(3600))
    }
}

#[async_trait]
impl CacheStore for MokaStore {
    async fn get(&self, key: &ExactKey) -> Result<Option<CompletionResponse>, CacheError> {
        Ok(self.cache.get(key).await)
    }

    async fn put(&self, key: ExactKey, value: CompletionResponse) -> Result<(), CacheError> {
        self.cache.insert(key, value).await;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    fn clear(&self) {
        self.cache.invalidate_all();
    }
}

#[derive(Clone)]
pub struct ExactCache {
    store: Arc<dyn CacheStore>,
}

impl ExactCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn in_memory(max_entries: u64, ttl: Duration) -> Self {
        Self::new(Arc::new(MokaStore::new(max_entries, ttl)))
    }

    pub async fn get(&self, key: &ExactKey) -> Result<Option<CompletionResponse>, CacheError> {
        self.store.get(key).await
    }

    pub async fn put(&self, key: ExactKey, value: CompletionResponse) -> Result<(), CacheError> {
        self.store.put(key, value).await
    }

    pub fn len(&self) -> u64 {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.store.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::TokenUsage;
    use proptest::prelude::*;
    use serde_json::json;

    fn response(content: &str) -> CompletionResponse {
        CompletionResponse {
            content: content.to_string(),
            usage: TokenUsage::default(),
            model: "m".to_string(),
            finish_reason: None,
        }
    }

    #[test]
    fn test_key_ignores_option_order() {
        let a = json!({"order": ["anthropic", "openai"], "allow_fallbacks": false, "sort": {"by": "price", "max": 2}});
        let b = json!({"sort": {"max": 2, "by": "price"}, "allow_fallbacks": false, "order": ["anthropic", "openai"]});
        let ka = ExactKey::new("qa", "hello", Some(&a), "acme:main", Some("be brief"));
        let kb = ExactKey::new("qa", "hello", Some(&b), "acme:main", Some("be brief"));
        assert_eq!(ka.as_str(), kb.as_str());
    }

    #[test]
    fn test_key_components_all_matter() {
        let base = ExactKey::new("qa", "hello", None, "acme:main", None);
        assert_ne!(base, ExactKey::new("summarize", "hello", None, "acme:main", None));
        assert_ne!(base, ExactKey::new("qa", "goodbye", None, "acme:main", None));
        assert_ne!(base, ExactKey::new("qa", "hello", None, "other:main", None));
        assert_ne!(base, ExactKey::new("qa", "hello", None, "acme:main", Some("sys")));
        assert_ne!(
            base,
            ExactKey::new("qa", "hello", Some(&json!({"order": ["x"]})), "acme:main", None)
        );
    }

    #[test]
    fn test_array_order_is_significant() {
        let a = ExactKey::new("qa", "p", Some(&json!({"order": ["a", "b"]})), "n", None);
        let b = ExactKey::new("qa", "p", Some(&json!({"order": ["b", "a"]})), "n", None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_prompt_whitespace_normalized() {
        let a = ExactKey::new("qa", "  what   is\n\trust ", None, "n", None);
        let b = ExactKey::new("qa", "what is rust", None, "n", None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_system_prompt_is_separate_suffix() {
        let a = ExactKey::new("qa", "p", None, "n", Some("one"));
        let b = ExactKey::new("qa", "p", None, "n", Some("two"));
        let prefix = |k: &ExactKey| k.as_str().split(':').next().map(str::to_string);
        assert_eq!(prefix(&a), prefix(&b));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_moka_store_roundtrip() {
        let cache = ExactCache::in_memory(100, Duration::from_secs(60));
        let key = ExactKey::new("qa", "p", None, "n", None);
        assert!(cache.get(&key).await.unwrap().is_none());

        cache.put(key.clone(), response("cached")).await.unwrap();
        let hit = cache.get(&key).await.unwrap();
        assert_eq!(hit.map(|r| r.content), Some("cached".to_string()));

        cache.clear();
        assert!(cache.get(&key).await.unwrap().is_none());
    }

    proptest! {
        #[test]
        fn prop_key_independent_of_insertion_order(
            entries in proptest::collection::btree_map("[a-z]{1,6}", 0i64..1000, 1..8)
        ) {
            let forward: serde_json::Map<String, Value> =
                entries.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
            let reverse: serde_json::Map<String, Value> =
                entries.iter().rev().map(|(k, v)| (k.clone(), json!(v))).collect();
            let ka = ExactKey::new("t", "p", Some(&Value::Object(forward)), "n", None);
            let kb = ExactKey::new("t", "p", Some(&Value::Object(reverse)), "n", None);
            prop_assert_eq!(ka, kb);
        }
    }
}
