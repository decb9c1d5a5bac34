//! Gateway counters.
//!
//! Lock-free counters updated on the request path; [`GatewayMetrics::emit`]
//! writes a snapshot as one structured `tracing` event.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct GatewayMetrics {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    exact_hits: AtomicU64,
    semantic_hits: AtomicU64,
    shadow_hits: AtomicU64,
    breaker_rejections: AtomicU64,
    budget_rejections: AtomicU64,
    retries: AtomicU64,
    /// Nano-dollars, so spend can be summed atomically.
    spend_nanos: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub exact_hits: u64,
    pub semantic_hits: u64,
    pub shadow_hits: u64,
    pub breaker_rejections: u64,
    pub budget_rejections: u64,
    pub retries: u64,
    pub spend: f64,
}

impl MetricsSnapshot {
    pub fn cache_hit_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            (self.exact_hits + self.semantic_hits) as f64 / self.requests as f64
        }
    }
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn success(&self, cost: f64) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        let nanos = (cost.max(0.0) * 1e9).round() as u64;
        self.spend_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn exact_hit(&self) {
        self.exact_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn semantic_hit(&self) {
        self.semantic_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn shadow_hit(&self) {
        self.shadow_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn breaker_rejection(&self) {
        self.breaker_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn budget_rejection(&self) {
        self.budget_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retries(&self, n: u32) {
        self.retries.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            exact_hits: self.exact_hits.load(Ordering::Relaxed),
            semantic_hits: self.semantic_hits.load(Ordering::Relaxed),
            shadow_hits: self.shadow_hits.load(Ordering::Relaxed),
            breaker_rejections: self.breaker_rejections.load(Ordering::Relaxed),
            budget_rejections: self.budget_rejections.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            spend: self.spend_nanos.load(Ordering::Relaxed) as f64 / 1e9,
        }
    }

    pub fn emit(&self) -> MetricsSnapshot {
        let s = self.snapshot();
        tracing::info!(
            target: "relay::metrics",
            requests = s.requests,
            successes = s.successes,
            failures = s.failures,
            exact_hits = s.exact_hits,
            semantic_hits = s.semantic_hits,
            shadow_hits = s.shadow_hits,
            breaker_rejections = s.breaker_rejections,
            budget_rejections = s.budget_rejections,
            retries = s.retries,
            spend = s.spend,
            "gateway metrics"
        );
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_hit_rate() {
        let m = GatewayMetrics::new();
        for _ in 0..4 {
            m.request();
        }
        m.exact_hit();
        m.semantic_hit();
        m.success(0.0002);
        m.success(0.0003);
        m.retries(2);

        let s = m.emit();
        assert_eq!(s.requests, 4);
        assert_eq!(s.successes, 2);
        assert_eq!(s.retries, 2);
        assert!((s.cache_hit_rate() - 0.5).abs() < 1e-12);
        assert!((s.spend - 0.0005).abs() < 1e-9);
    }
}
