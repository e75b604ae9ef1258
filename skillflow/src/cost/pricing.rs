//! Per-model pricing and cost computation.

use crate::provider::TokenUsage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// USD rates per million tokens for one model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Input rate in USD per million tokens.
    pub input_per_million: f64,
    /// Output rate in USD per million tokens.
    pub output_per_million: f64,
}

impl ModelPricing {
    /// Creates a pricing entry.
    #[must_use]
    pub fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    /// Computes the cost of a call in USD.
    #[must_use]
    pub fn cost(&self, usage: TokenUsage) -> f64 {
        (f64::from(usage.input_tokens) * self.input_per_million
            + f64::from(usage.output_tokens) * self.output_per_million)
            / 1_000_000.0
    }
}

/// Conservative mid-tier fallback applied to unknown models, so a
/// missing table entry overestimates rather than undercharges.
const FALLBACK_PRICING: ModelPricing = ModelPricing {
    input_per_million: 3.0,
    output_per_million: 15.0,
};

/// Lookup table from model id to rates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
}

impl PricingTable {
    /// Creates an empty table. Every lookup falls back to mid-tier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the table with current published rates for the models
    /// the engine routes between.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.insert("claude-3-5-haiku", ModelPricing::new(0.80, 4.0));
        table.insert("claude-sonnet-4", ModelPricing::new(3.0, 15.0));
        table.insert("claude-opus-4", ModelPricing::new(15.0, 75.0));
        table.insert("gpt-4o-mini", ModelPricing::new(0.15, 0.60));
        table.insert("gpt-4o", ModelPricing::new(2.50, 10.0));
        table
    }

    /// Inserts or replaces a pricing entry.
    pub fn insert(&mut self, model: impl Into<String>, pricing: ModelPricing) {
        self.models.insert(model.into(), pricing);
    }

    /// Returns the pricing for a model, falling back to the
    /// conservative mid-tier rate for unknown ids.
    #[must_use]
    pub fn pricing(&self, model: &str) -> ModelPricing {
        self.models.get(model).copied().unwrap_or(FALLBACK_PRICING)
    }

    /// Computes the cost of a call against this table.
    #[must_use]
    pub fn cost(&self, model: &str, usage: TokenUsage) -> f64 {
        self.pricing(model).cost(usage)
    }

    /// Returns the model ids with explicit entries.
    #[must_use]
    pub fn known_models(&self) -> Vec<&str> {
        self.models.keys().map(String::as_str).collect()
    }
}
