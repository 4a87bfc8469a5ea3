//! Per-model API pricing (USD per 1M tokens).

use once_cell::sync::Lazy;
use std::collections::HashMap;

use sortie_types::TokenUsage;

#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

/// Fallback for unknown models
pub const DEFAULT_PRICING: ModelPricing =
    ModelPricing { input: 3.00, output: 15.00, cache_read: 0.30, cache_write: 3.75 };

static MODEL_PRICING: Lazy<HashMap<&'static str, ModelPricing>> = Lazy::new(|| {
    let mut table = HashMap::new();
    table.insert(
        "claude-opus-4-5-20251101",
        ModelPricing { input: 15.00, output: 75.00, cache_read: 1.50, cache_write: 18.75 },
    );
    table.insert(
        "claude-sonnet-4-20250514",
        ModelPricing { input: 3.00, output: 15.00, cache_read: 0.30, cache_write: 3.75 },
    );
    table.insert(
        "claude-sonnet-4-5-20250514",
        ModelPricing { input: 3.00, output: 15.00, cache_read: 0.30, cache_write: 3.75 },
    );
    table.insert(
        "claude-haiku-4-5-20251001",
        ModelPricing { input: 0.80, output: 4.00, cache_read: 0.08, cache_write: 1.00 },
    );
    table
});

pub fn pricing_for(model: &str) -> ModelPricing {
    MODEL_PRICING.get(model).copied().unwrap_or(DEFAULT_PRICING)
}

/// Cost of one usage record in USD.
pub fn estimate_cost(usage: &TokenUsage, model: &str) -> f64 {
    let pricing = pricing_for(model);
    (usage.input_tokens as f64 / 1_000_000.0) * pricing.input
        + (usage.output_tokens as f64 / 1_000_000.0) * pricing.output
        + (usage.cache_read_tokens as f64 / 1_000_000.0) * pricing.cache_read
        + (usage.cache_write_tokens as f64 / 1_000_000.0) * pricing.cache_write
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_model_pricing() {
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
        };
        let cost = estimate_cost(&usage, "claude-haiku-4-5-20251001");
        assert!((cost - 4.80).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_uses_default() {
        let usage = TokenUsage { input_tokens: 1_000_000, ..Default::default() };
        assert!((estimate_cost(&usage, "mystery-model") - 3.00).abs() < 1e-9);
    }

    #[test]
    fn test_cache_tokens_priced() {
        let usage = TokenUsage {
            cache_read_tokens: 2_000_000,
            cache_write_tokens: 1_000_000,
            ..Default::default()
        };
        let cost = estimate_cost(&usage, "claude-sonnet-4-20250514");
        assert!((cost - (0.60 + 3.75)).abs() < 1e-9);
    }
}
