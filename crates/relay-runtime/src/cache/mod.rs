//! Two-tier response cache.
//!
//! Lookups consult the semantic tier first, then the exact-key tier. The
//! semantic tier may run in shadow mode, where its hits are scored and
//! counted but only served once they clear the promotion threshold.
//! Backend failures never fail a request; they are logged and read as a miss.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use relay_core::config::CacheConfig;

use crate::providers::CompletionResponse;

mod exact;
mod semantic;

pub use exact::{canonical_signature, normalize_prompt, CacheStore, ExactCache, ExactKey, MokaStore};
pub use semantic::{cosine_similarity, Embedder, HashingEmbedder, SemanticCache, SemanticMatch};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Backend(String),

    #[error("Cached entry could not be decoded: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Exact,
    Semantic,
}

/// Which tier served or stored a response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheInfo {
    /// Tier that served the response, if any.
    pub tier: Option<CacheTier>,
    /// Best semantic score seen during lookup.
    pub similarity: Option<f64>,
    pub key: String,
    pub stored_tiers: Vec<CacheTier>,
    /// A shadow-mode semantic hit that cleared the promotion threshold.
    pub promoted: bool,
}

/// Outcome of [`CacheLayer::lookup`].
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Served from cache.
    Hit {
        response: CompletionResponse,
        info: CacheInfo,
    },
    /// The semantic tier scored a match it may not serve; execute normally.
    ShadowHit { info: CacheInfo },
    Miss { info: CacheInfo },
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit { .. })
    }

    pub fn info(&self) -> &CacheInfo {
        match self {
            CacheLookup::Hit { info, .. }
            | CacheLookup::ShadowHit { info }
            | CacheLookup::Miss { info } => info,
        }
    }
}

/// Everything that identifies a cacheable request.
#[derive(Debug, Clone, Copy)]
pub struct CacheRequest<'a> {
    pub task_type: &'a str,
    pub prompt: &'a str,
    pub provider_options: Option<&'a Value>,
    /// `tenant:workspace`
    pub namespace: &'a str,
    pub system_prompt: Option<&'a str>,
    pub model: &'a str,
}

impl CacheRequest<'_> {
    pub fn key(&self) -> ExactKey {
        ExactKey::new(
            self.task_type,
            self.prompt,
            self.provider_options,
            self.namespace,
            self.system_prompt,
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub lookups: u64,
    pub exact_hits: u64,
    pub semantic_hits: u64,
    pub shadow_hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub stores: u64,
}

#[derive(Debug, Default)]
struct Counters {
    lookups: AtomicU64,
    exact_hits: AtomicU64,
    semantic_hits: AtomicU64,
    shadow_hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    stores: AtomicU64,
}

pub struct CacheLayer {
    config: CacheConfig,
    exact: Option<ExactCache>,
    semantic: Option<SemanticCache>,
    counters: Counters,
}

impl std::fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLayer")
            .field("exact", &self.exact.is_some())
            .field("semantic", &self.semantic)
            .finish()
    }
}

impl CacheLayer {
    pub fn new(config: CacheConfig) -> Self {
        let embedder = Arc::new(HashingEmbedder::new(config.semantic.embedding_dim));
        Self::with_embedder(config, embedder)
    }

    pub fn with_embedder(config: CacheConfig, embedder: Arc<dyn Embedder>) -> Self {
        let exact = config
            .enabled
            .then(|| ExactCache::in_memory(config.max_entries, config.ttl));
        Self::with_parts(config, exact, embedder)
    }

    /// Layer with a caller-supplied exact tier backend.
    pub fn with_store(
        config: CacheConfig,
        store: Arc<dyn CacheStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        let exact = config.enabled.then(|| ExactCache::new(store));
        Self::with_parts(config, exact, embedder)
    }

    fn with_parts(config: CacheConfig, exact: Option<ExactCache>, embedder: Arc<dyn Embedder>) -> Self {
        let semantic = config
            .semantic
            .enabled
            .then(|| SemanticCache::new(config.semantic.clone(), embedder));
        Self {
            config,
            exact,
            semantic,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.exact.is_some() || self.semantic.is_some()
    }

    pub async fn lookup(&self, request: &CacheRequest<'_>) -> CacheLookup {
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);
        let key = request.key();
        let mut info = CacheInfo {
            key: key.to_string(),
            ..Default::default()
        };

        let mut shadow = false;
        if let Some(semantic) = &self.semantic {
            if let Some(found) = semantic.lookup(request.namespace, request.prompt, request.model) {
                info.similarity = Some(found.similarity);
                let sem = &self.config.semantic;
                let serve = if sem.shadow_mode {
                    sem.promotion_enabled && found.similarity >= sem.promotion_threshold
                } else {
                    true
                };
                if serve {
                    info.tier = Some(CacheTier::Semantic);
                    info.promoted = sem.shadow_mode;
                    self.counters.semantic_hits.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        similarity = found.similarity,
                        promoted = info.promoted,
                        "semantic cache hit"
                    );
                    return CacheLookup::Hit {
                        response: found.response,
                        info,
                    };
                }
                shadow = true;
                self.counters.shadow_hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(similarity = found.similarity, "semantic shadow hit not served");
            }
        }

        if let Some(exact) = &self.exact {
            match exact.get(&key).await {
                Ok(Some(response)) => {
                    info.tier = Some(CacheTier::Exact);
                    self.counters.exact_hits.fetch_add(1, Ordering::Relaxed);
                    return CacheLookup::Hit { response, info };
                }
                Ok(None) => {}
                Err(e) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "exact cache lookup failed, treating as miss");
                }
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        if shadow {
            CacheLookup::ShadowHit { info }
        } else {
            CacheLookup::Miss { info }
        }
    }

    /// Write `response` to every enabled tier; returns the tiers written.
    pub async fn store(&self, request: &CacheRequest<'_>, response: &CompletionResponse) -> Vec<CacheTier> {
        let mut stored = Vec::new();
        if let Some(exact) = &self.exact {
            match exact.put(request.key(), response.clone()).await {
                Ok(()) => stored.push(CacheTier::Exact),
                Err(e) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "exact cache store failed");
                }
            }
        }
        if let Some(semantic) = &self.semantic {
            semantic.insert(request.namespace, request.prompt, request.model, response.clone());
            stored.push(CacheTier::Semantic);
        }
        if !stored.is_empty() {
            self.counters.stores.fetch_add(1, Ordering::Relaxed);
        }
        stored
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            lookups: c.lookups.load(Ordering::Relaxed),
            exact_hits: c.exact_hits.load(Ordering::Relaxed),
            semantic_hits: c.semantic_hits.load(Ordering::Relaxed),
            shadow_hits: c.shadow_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            stores: c.stores.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&self) {
        if let Some(exact) = &self.exact {
            exact.clear();
        }
        if let Some(semantic) = &self.semantic {
            semantic.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::TokenUsage;
    use async_trait::async_trait;
    use relay_core::config::SemanticCacheConfig;

    fn response(content: &str) -> CompletionResponse {
        CompletionResponse {
            content: content.to_string(),
            usage: TokenUsage::default(),
            model: "m".to_string(),
            finish_reason: None,
        }
    }

    /// Embeds "cached" as e1 and anything else at a fixed cosine to it.
    struct FixedSimilarity(f32);

    impl Embedder for FixedSimilarity {
        fn embed(&self, text: &str) -> Vec<f32> {
            if text == "cached" {
                vec![1.0, 0.0]
            } else {
                vec![self.0, (1.0 - self.0 * self.0).sqrt()]
            }
        }

        fn dim(&self) -> usize {
            2
        }
    }

    fn layer(semantic: SemanticCacheConfig, similarity: f32, exact: bool) -> CacheLayer {
        let config = CacheConfig {
            enabled: exact,
            semantic,
            ..Default::default()
        };
        CacheLayer::with_embedder(config, Arc::new(FixedSimilarity(similarity)))
    }

    fn req(prompt: &str) -> CacheRequest<'_> {
        CacheRequest {
            task_type: "qa",
            prompt,
            provider_options: None,
            namespace: "acme:main",
            system_prompt: None,
            model: "m",
        }
    }

    fn shadow(promotion_enabled: bool) -> SemanticCacheConfig {
        SemanticCacheConfig {
            enabled: true,
            shadow_mode: true,
            promotion_enabled,
            similarity_threshold: 0.75,
            promotion_threshold: 0.9,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_shadow_without_promotion_never_serves() {
        let cache = layer(shadow(false), 0.99, false);
        cache.store(&req("cached"), &response("r")).await;

        let lookup = cache.lookup(&req("similar")).await;
        assert!(matches!(lookup, CacheLookup::ShadowHit { .. }));
        assert!(lookup.info().similarity.is_some_and(|s| s > 0.98));
        assert_eq!(cache.stats().shadow_hits, 1);
    }

    #[tokio::test]
    async fn test_promotion_threshold_gates_serving() {
        let promoted = layer(shadow(true), 0.95, false);
        promoted.store(&req("cached"), &response("r")).await;
        match promoted.lookup(&req("similar")).await {
            CacheLookup::Hit { info, .. } => {
                assert_eq!(info.tier, Some(CacheTier::Semantic));
                assert!(info.promoted);
            }
            other => panic!("expected promoted hit, got {other:?}"),
        }

        let held_back = layer(shadow(true), 0.80, false);
        held_back.store(&req("cached"), &response("r")).await;
        assert!(matches!(
            held_back.lookup(&req("similar")).await,
            CacheLookup::ShadowHit { .. }
        ));
    }

    #[tokio::test]
    async fn test_shadow_hit_falls_through_to_exact() {
        let cache = layer(shadow(false), 1.0, true);
        cache.store(&req("cached"), &response("exact")).await;

        match cache.lookup(&req("cached")).await {
            CacheLookup::Hit { response, info } => {
                assert_eq!(response.content, "exact");
                assert_eq!(info.tier, Some(CacheTier::Exact));
                assert!(info.similarity.is_some());
            }
            other => panic!("expected exact hit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_live_semantic_serves_above_threshold() {
        let config = SemanticCacheConfig {
            enabled: true,
            shadow_mode: false,
            similarity_threshold: 0.85,
            ..Default::default()
        };
        let cache = layer(config, 0.9, false);
        cache.store(&req("cached"), &response("r")).await;
        assert!(cache.lookup(&req("similar")).await.is_hit());
    }

    #[tokio::test]
    async fn test_store_reports_tiers() {
        let config = SemanticCacheConfig {
            enabled: true,
            ..Default::default()
        };
        let cache = layer(config, 0.1, true);
        let tiers = cache.store(&req("cached"), &response("r")).await;
        assert_eq!(tiers, vec![CacheTier::Exact, CacheTier::Semantic]);
    }

    struct BrokenStore;

    #[async_trait]
    impl CacheStore for BrokenStore {
        async fn get(&self, _key: &ExactKey) -> Result<Option<CompletionResponse>, CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }

        async fn put(&self, _key: ExactKey, _value: CompletionResponse) -> Result<(), CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }

        fn len(&self) -> u64 {
            0
        }

        fn clear(&self) {}
    }

    #[tokio::test]
    async fn test_backend_errors_degrade_to_miss() {
        let cache = CacheLayer::with_store(
            CacheConfig::default(),
            Arc::new(BrokenStore),
            Arc::new(HashingEmbedder::default()),
        );
        assert!(cache.store(&req("p"), &response("r")).await.is_empty());
        assert!(matches!(cache.lookup(&req("p")).await, CacheLookup::Miss { .. }));
        assert_eq!(cache.stats().errors, 2);
    }
}
