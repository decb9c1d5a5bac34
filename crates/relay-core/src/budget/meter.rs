//! Token estimation and per-model pricing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Characters per token used by the estimation heuristic.
pub const CHARS_PER_TOKEN: usize = 4;

/// Per-model prices in USD per 1,000 tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceTable {
    pub per_1k_tokens: BTreeMap<String, f64>,
    /// Price for models missing from the table.
    pub default_per_1k: f64,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            per_1k_tokens: BTreeMap::new(),
            default_per_1k: 0.002,
        }
    }
}

impl PriceTable {
    pub fn with_price(mut self, model: impl Into<String>, per_1k: f64) -> Self {
        self.per_1k_tokens.insert(model.into(), per_1k);
        self
    }

    /// Price per 1,000 tokens for `model`.
    pub fn per_1k(&self, model: &str) -> f64 {
        self.per_1k_tokens
            .get(model)
            .copied()
            .unwrap_or(self.default_per_1k)
    }

    /// This table with `overrides` layered on top.
    pub fn overlay(&self, overrides: &BTreeMap<String, f64>) -> PriceTable {
        let mut merged = self.clone();
        for (model, price) in overrides {
            merged.per_1k_tokens.insert(model.clone(), *price);
        }
        merged
    }
}

/// Estimates token counts and request costs.
#[derive(Debug, Clone, Default)]
pub struct TokenMeter {
    prices: PriceTable,
}

impl TokenMeter {
    pub fn new(prices: PriceTable) -> Self {
        Self { prices }
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    /// `ceil(chars / 4)`.
    pub fn estimate_tokens(text: &str) -> u32 {
        let chars = text.chars().count();
        chars.div_ceil(CHARS_PER_TOKEN) as u32
    }

    pub fn price_per_token(&self, model: &str) -> f64 {
        self.prices.per_1k(model) / 1000.0
    }

    /// `(tokens_in + tokens_out) × price_per_token[model]`.
    pub fn estimate_cost(&self, model: &str, tokens_in: u32, tokens_out: u32) -> f64 {
        (tokens_in as f64 + tokens_out as f64) * self.price_per_token(model)
    }

    /// First candidate, in the caller's order, whose cost fits `ceiling`.
    pub fn affordable_model(
        &self,
        candidates: &[String],
        tokens_in: u32,
        tokens_out: u32,
        ceiling: f64,
    ) -> Option<String> {
        candidates
            .iter()
            .find(|m| self.estimate_cost(m, tokens_in, tokens_out) <= ceiling)
            .cloned()
    }

    /// Cheapest candidate whose cost fits `ceiling`; ties keep caller order.
    pub fn cheapest_affordable(
        &self,
        candidates: &[String],
        tokens_in: u32,
        tokens_out: u32,
        ceiling: f64,
    ) -> Option<String> {
        let mut best: Option<(&String, f64)> = None;
        for model in candidates {
            let cost = self.estimate_cost(model, tokens_in, tokens_out);
            if cost > ceiling {
                continue;
            }
            if best.map_or(true, |(_, c)| cost < c) {
                best = Some((model, cost));
            }
        }
        best.map(|(m, _)| m.clone())
    }
}
