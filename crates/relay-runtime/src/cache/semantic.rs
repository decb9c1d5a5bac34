//! Similarity-keyed response cache.
//!
//! Prompts are embedded into unit vectors; a lookup returns the most similar
//! live entry from the same namespace and model, scored by cosine similarity.

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::time::Instant;

use relay_core::config::SemanticCacheConfig;
use relay_core::features::fnv1a;

use crate::providers::CompletionResponse;

/// Turns text into a fixed-length vector.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;

    fn dim(&self) -> usize;
}

/// Feature-hashing embedder over lowercased words and word bigrams.
///
/// Needs no model; paraphrases sharing most of their vocabulary land close
/// together, which is enough for near-duplicate detection.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect();

        let mut add = |feature: &str, weight: f32| {
            let h = fnv1a(feature.as_bytes());
            let bucket = (h % self.dim as u64) as usize;
            let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign * weight;
        };
        for word in &words {
            add(word, 1.0);
        }
        for pair in words.windows(2) {
            add(&format!("{} {}", pair[0], pair[1]), 0.5);
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

/// Cosine similarity; 0 for mismatched or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let na: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    embedding: Vec<f32>,
    model: String,
    response: CompletionResponse,
    inserted_at: Instant,
}

/// Best entry above the similarity threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticMatch {
    pub response: CompletionResponse,
    pub similarity: f64,
}

pub struct SemanticCache {
    config: SemanticCacheConfig,
    embedder: Arc<dyn Embedder>,
    namespaces: RwLock<HashMap<String, VecDeque<Entry>>>,
}

impl std::fmt::Debug for SemanticCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticCache")
            .field("config", &self.config)
            .field("namespaces", &self.namespaces.read().len())
            .finish()
    }
}

impl SemanticCache {
    pub fn new(config: SemanticCacheConfig, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            config,
            embedder,
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_hashing(config: SemanticCacheConfig) -> Self {
        let embedder = Arc::new(HashingEmbedder::new(config.embedding_dim));
        Self::new(config, embedder)
    }

    pub fn config(&self) -> &SemanticCacheConfig {
        &self.config
    }

    /// Most similar live entry for `model` scoring at least
    /// `similarity_threshold`.
    pub fn lookup(&self, namespace: &str, prompt: &str, model: &str) -> Option<SemanticMatch> {
        let query = self.embedder.embed(prompt);
        let namespaces = self.namespaces.read();
        let entries = namespaces.get(namespace)?;
        entries
            .iter()
            .filter(|e| e.model == model && e.inserted_at.elapsed() < self.config.ttl)
            .map(|e| (cosine_similarity(&query, &e.embedding), e))
            .filter(|(sim, _)| *sim >= self.config.similarity_threshold)
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(similarity, e)| SemanticMatch {
                response: e.response.clone(),
                similarity,
            })
    }

    pub fn insert(&self, namespace: &str, prompt: &str, model: &str, response: CompletionResponse) {
        let entry = Entry {
            embedding: self.embedder.embed(prompt),
            model: model.to_string(),
            response,
            inserted_at: Instant::now(),
        };
        let ttl = self.config.ttl;
        let cap = self.config.max_entries_per_namespace.max(1);

        let mut namespaces = self.namespaces.write();
        let entries = namespaces.entry(namespace.to_string()).or_default();
        entries.retain(|e| e.inserted_at.elapsed() < ttl);
        while entries.len() >= cap {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn len(&self, namespace: &str) -> usize {
        self.namespaces
            .read()
            .get(namespace)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        self.namespaces.write().clear();
    }
}
