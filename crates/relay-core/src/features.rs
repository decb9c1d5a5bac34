//! Feature extraction for bandit policies.
//!
//! Two views of the same request context are produced here:
//! - [`FeatureExtractor::featurize`]: numeric context fields plus moving
//!   averages of recent cost/latency samples.
//! - [`context_vector`]: a dense, fixed-dimension vector with a bias term,
//!   consumed by the linear contextual policies.
//!
//! Both iterate context fields in key order, so the same context always
//! yields the same vector.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Default number of samples kept by the cost/latency windows.
pub const DEFAULT_WINDOW: usize = 100;

/// A single context field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl ContextValue {
    /// Numeric surrogate used by dense vectors.
    ///
    /// Text is hashed into `[0, 1)`; bools map to 0/1.
    pub fn as_feature(&self) -> f64 {
        match self {
            ContextValue::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            ContextValue::Number(n) if n.is_finite() => *n,
            ContextValue::Number(_) => 0.0,
            ContextValue::Text(s) => hash_to_unit(s),
        }
    }

    /// The value if it is a finite number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ContextValue::Number(n) if n.is_finite() => Some(*n),
            _ => None,
        }
    }

    /// The value if it is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContextValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for ContextValue {
    fn from(v: f64) -> Self {
        ContextValue::Number(v)
    }
}

impl From<u32> for ContextValue {
    fn from(v: u32) -> Self {
        ContextValue::Number(v as f64)
    }
}

impl From<bool> for ContextValue {
    fn from(v: bool) -> Self {
        ContextValue::Bool(v)
    }
}

impl From<&str> for ContextValue {
    fn from(v: &str) -> Self {
        ContextValue::Text(v.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(v: String) -> Self {
        ContextValue::Text(v)
    }
}

/// Request context handed to policies. Ordered so iteration is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context(BTreeMap<String, ContextValue>);

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ContextValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.0.get(key)
    }

    /// Text value of a field, if present and textual.
    pub fn text(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(ContextValue::as_text)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ContextValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable string form of the context, used as a fallback allocation key.
    pub fn canonical_key(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| match v {
                ContextValue::Bool(b) => format!("{}={}", k, b),
                ContextValue::Number(n) => format!("{}={}", k, n),
                ContextValue::Text(s) => format!("{}={}", k, s),
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Bounded window of samples with a running sum.
///
/// Push and evict are O(1); `mean` never rescans the buffer.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    samples: VecDeque<f64>,
    capacity: usize,
    sum: f64,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
        }
    }

    /// Append a sample, evicting the oldest when full. Non-finite samples are dropped.
    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        if self.samples.len() == self.capacity {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
        self.samples.push_back(value);
        self.sum += value;
    }

    /// Mean of the window, 0.0 when empty.
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.sum / self.samples.len() as f64
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recent sample.
    pub fn last(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.samples.iter()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.sum = 0.0;
    }
}

/// Turns request contexts into numeric feature vectors.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    cost_window: SlidingWindow,
    latency_window: SlidingWindow,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl FeatureExtractor {
    pub fn new(window: usize) -> Self {
        Self {
            cost_window: SlidingWindow::new(window),
            latency_window: SlidingWindow::new(window),
        }
    }

    /// Record an observed cost/latency pair.
    pub fn observe(&mut self, cost: f64, latency: f64) {
        self.cost_window.push(cost);
        self.latency_window.push(latency);
    }

    /// Numeric context fields (key order) followed by mean cost and mean latency.
    pub fn featurize(&self, context: &Context) -> Vec<f64> {
        let mut features: Vec<f64> = context.iter().filter_map(|(_, v)| v.as_number()).collect();
        features.push(self.cost_window.mean());
        features.push(self.latency_window.mean());
        features
    }

    pub fn mean_cost(&self) -> f64 {
        self.cost_window.mean()
    }

    pub fn mean_latency(&self) -> f64 {
        self.latency_window.mean()
    }
}

/// Dense context vector: `[1.0, field_1, field_2, ...]` padded or truncated to `dim`.
pub fn context_vector(context: &Context, dim: usize) -> Vec<f64> {
    let dim = dim.max(1);
    let mut x = Vec::with_capacity(dim);
    x.push(1.0);
    for (_, value) in context.iter() {
        if x.len() == dim {
            break;
        }
        x.push(value.as_feature());
    }
    x.resize(dim, 0.0);
    x
}

/// FNV-1a hash of a string mapped into `[0, 1)`.
pub fn hash_to_unit(s: &str) -> f64 {
    let h = fnv1a(s.as_bytes());
    (h >> 11) as f64 / (1u64 << 53) as f64
}

/// 64-bit FNV-1a.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fnv1a_reference_vectors() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a(b"foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut window = SlidingWindow::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            window.push(v);
        }
        assert_eq!(window.len(), 3);
        assert!((window.mean() - 3.0).abs() < 1e-12);
        assert_eq!(window.last(), Some(4.0));
    }

    #[test]
    fn test_window_ignores_nan() {
        let mut window = SlidingWindow::new(3);
        window.push(f64::NAN);
        window.push(2.0);
        assert_eq!(window.len(), 1);
        assert_eq!(window.mean(), 2.0);
    }

    #[test]
    fn test_featurize_appends_moving_averages() {
        let mut extractor = FeatureExtractor::new(10);
        extractor.observe(0.01, 200.0);
        extractor.observe(0.03, 400.0);

        let ctx = Context::new()
            .with("prompt_tokens", 120.0)
            .with("tenant", "acme")
            .with("complexity", 0.5);

        let features = extractor.featurize(&ctx);
        // complexity, prompt_tokens (key order), then cost/latency means
        assert_eq!(features.len(), 4);
        assert_eq!(features[0], 0.5);
        assert_eq!(features[1], 120.0);
        assert!((features[2] - 0.02).abs() < 1e-12);
        assert!((features[3] - 300.0).abs() < 1e-12);
    }

    #[test]
    fn test_context_vector_bias_and_padding() {
        let ctx = Context::new().with("a", 2.0).with("b", true);
        let x = context_vector(&ctx, 5);
        assert_eq!(x, vec![1.0, 2.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_context_vector_truncates() {
        let ctx = Context::new().with("a", 1.0).with("b", 2.0).with("c", 3.0);
        let x = context_vector(&ctx, 2);
        assert_eq!(x, vec![1.0, 1.0]);
    }

    #[test]
    fn test_text_hash_is_stable_and_bounded() {
        let a = hash_to_unit("coding");
        let b = hash_to_unit("coding");
        assert_eq!(a, b);
        assert!((0.0..1.0).contains(&a));
        assert_ne!(a, hash_to_unit("chat"));
    }

    proptest! {
        #[test]
        fn prop_window_never_exceeds_capacity(cap in 1usize..50, values in proptest::collection::vec(-1e6f64..1e6, 0..200)) {
            let mut window = SlidingWindow::new(cap);
            for v in &values {
                window.push(*v);
            }
            prop_assert!(window.len() <= cap);
            let expected: Vec<f64> = values.iter().rev().take(cap).rev().copied().collect();
            if !expected.is_empty() {
                let mean = expected.iter().sum::<f64>() / expected.len() as f64;
                prop_assert!((window.mean() - mean).abs() < 1e-3);
            }
        }
    }
}
