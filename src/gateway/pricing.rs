//! Chat model pricing registry.
//!
//! Costs are in nanodollars (1e-9 USD) per token and only feed usage
//! records; nothing in the analysis path depends on them.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Pricing information for a model.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_nanos_per_token: i64,
    pub output_nanos_per_token: i64,
}

impl ModelPricing {
    const fn new(input: i64, output: i64) -> Self {
        Self {
            input_nanos_per_token: input,
            output_nanos_per_token: output,
        }
    }

    pub fn calculate_cost(&self, input_tokens: u32, output_tokens: u32) -> i64 {
        (input_tokens as i64) * self.input_nanos_per_token
            + (output_tokens as i64) * self.output_nanos_per_token
    }
}

// Mistral Large: $2.00/1M input, $6.00/1M output
const MISTRAL_LARGE: ModelPricing = ModelPricing::new(2_000, 6_000);
// Mistral Small: $0.20/1M input, $0.60/1M output
const MISTRAL_SMALL: ModelPricing = ModelPricing::new(200, 600);
// GPT-4o-mini: $0.15/1M input, $0.60/1M output
const GPT_4O_MINI: ModelPricing = ModelPricing::new(150, 600);
// GPT-4o: $2.50/1M input, $10.00/1M output
const GPT_4O: ModelPricing = ModelPricing::new(2_500, 10_000);
// Claude 3.5 Haiku: $0.80/1M input, $4.00/1M output
const CLAUDE_35_HAIKU: ModelPricing = ModelPricing::new(800, 4_000);
// Claude 3 Opus: $15.00/1M input, $75.00/1M output
const CLAUDE_3_OPUS: ModelPricing = ModelPricing::new(15_000, 75_000);

/// Fallback for models missing from the registry.
const UNKNOWN_MODEL: ModelPricing = ModelPricing::new(1_000, 5_000);

static PRICING_MAP: OnceLock<HashMap<&'static str, ModelPricing>> = OnceLock::new();

fn init_pricing() -> HashMap<&'static str, ModelPricing> {
    let mut map = HashMap::new();
    map.insert("mistralai/mistral-large", MISTRAL_LARGE);
    map.insert("mistral-large-latest", MISTRAL_LARGE);
    map.insert("mistralai/mistral-small", MISTRAL_SMALL);
    map.insert("mistral-small-latest", MISTRAL_SMALL);
    map.insert("openai/gpt-4o-mini", GPT_4O_MINI);
    map.insert("openai/gpt-4o", GPT_4O);
    map.insert("anthropic/claude-3-5-haiku", CLAUDE_35_HAIKU);
    map.insert("anthropic/claude-3-opus", CLAUDE_3_OPUS);
    map
}

pub fn get_pricing(model_id: &str) -> Option<ModelPricing> {
    PRICING_MAP.get_or_init(init_pricing).get(model_id).copied()
}

/// Calculate chat cost, defaulting to a mid-range price for unknown models.
pub fn chat_cost(model: &str, input_tokens: u32, output_tokens: u32) -> i64 {
    get_pricing(model)
        .unwrap_or(UNKNOWN_MODEL)
        .calculate_cost(input_tokens, output_tokens)
}
