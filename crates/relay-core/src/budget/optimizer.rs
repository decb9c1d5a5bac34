//! Cost history and spend analysis.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use super::meter::PriceTable;

pub const DEFAULT_MAX_HISTORY: usize = 10_000;

/// One priced operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub component: String,
    pub operation: String,
    pub model: String,
    pub tokens: u32,
    /// What the call costs (or would have cost, for cache hits).
    pub cost: f64,
    pub cache_hit: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub requests: u64,
    pub tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostLeader {
    pub name: String,
    pub cost: f64,
    /// Share of total spend, 0-100.
    pub percentage: f64,
}

/// Aggregate view produced by [`CostOptimizer::analyze_cost_patterns`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostAnalysis {
    pub total_requests: u64,
    /// Spend excluding cache hits.
    pub total_cost: f64,
    pub by_component: BTreeMap<String, CostBreakdown>,
    pub by_model: BTreeMap<String, CostBreakdown>,
    pub cache_hit_rate: f64,
    /// Cost avoided by cache hits.
    pub estimated_savings: f64,
    pub top_component: Option<CostLeader>,
    pub top_model: Option<CostLeader>,
}

#[derive(Debug)]
pub struct CostOptimizer {
    prices: PriceTable,
    max_history: usize,
    history: Mutex<VecDeque<CostRecord>>,
}

impl CostOptimizer {
    pub fn new(prices: PriceTable) -> Self {
        Self::with_max_history(prices, DEFAULT_MAX_HISTORY)
    }

    pub fn with_max_history(prices: PriceTable, max_history: usize) -> Self {
        Self {
            prices,
            max_history: max_history.max(1),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    pub fn record(&self, record: CostRecord) {
        let mut history = self.history.lock();
        if history.len() == self.max_history {
            history.pop_front();
        }
        history.push_back(record);
    }

    /// Record a call priced from the static table.
    pub fn record_usage(
        &self,
        component: &str,
        operation: &str,
        model: &str,
        tokens: u32,
        cache_hit: bool,
    ) -> f64 {
        let cost = tokens as f64 * self.prices.per_1k(model) / 1000.0;
        self.record(CostRecord {
            component: component.to_string(),
            operation: operation.to_string(),
            model: model.to_string(),
            tokens,
            cost,
            cache_hit,
            timestamp: Utc::now(),
        });
        cost
    }

    pub fn len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.lock().is_empty()
    }

    pub fn analyze_cost_patterns(&self) -> CostAnalysis {
        let history = self.history.lock();
        let mut analysis = CostAnalysis::default();
        let mut hits = 0u64;

        for record in history.iter() {
            analysis.total_requests += 1;
            if record.cache_hit {
                hits += 1;
                analysis.estimated_savings += record.cost;
                continue;
            }
            analysis.total_cost += record.cost;
            for (map, key) in [
                (&mut analysis.by_component, &record.component),
                (&mut analysis.by_model, &record.model),
            ] {
                let entry = map.entry(key.clone()).or_default();
                entry.requests += 1;
                entry.tokens += record.tokens as u64;
                entry.cost += record.cost;
            }
        }

        if analysis.total_requests > 0 {
            analysis.cache_hit_rate = hits as f64 / analysis.total_requests as f64;
        }
        analysis.top_component = leader(&analysis.by_component, analysis.total_cost);
        analysis.top_model = leader(&analysis.by_model, analysis.total_cost);
        analysis
    }

    /// The cheapest priced model strictly cheaper than `model`.
    pub fn recommend_cheaper(&self, model: &str) -> Option<String> {
        let current = self.prices.per_1k(model);
        self.prices
            .per_1k_tokens
            .iter()
            .filter(|(name, price)| name.as_str() != model && **price < current)
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(name, _)| name.clone())
    }
}

fn leader(map: &BTreeMap<String, CostBreakdown>, total: f64) -> Option<CostLeader> {
    map.iter()
        .max_by(|a, b| a.1.cost.total_cmp(&b.1.cost))
        .map(|(name, b)| CostLeader {
            name: name.clone(),
            cost: b.cost,
            percentage: if total > 0.0 { b.cost / total * 100.0 } else { 0.0 },
        })
}
