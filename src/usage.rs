// src/usage.rs

use serde::Serialize;

/// Display conversion used in summaries.
pub const USD_TO_CZK: f64 = 23.5;

/// Prompt tokens above which the extended `gemini-1.5-pro` tier applies.
const EXTENDED_TIER_TOKENS: u64 = 200_000;

/// Prices in USD per million tokens.
struct ModelPrice {
    key: &'static str,
    input: f64,
    output: f64,
    extended: Option<(f64, f64)>,
}

const PRICES: &[ModelPrice] = &[
    ModelPrice {
        key: "gemini-2.5-flash",
        input: 0.075,
        output: 0.30,
        extended: None,
    },
    ModelPrice {
        key: "gemini-2.5-flash-lite",
        input: 0.10,
        output: 0.40,
        extended: None,
    },
    ModelPrice {
        key: "gemini-1.5-pro",
        input: 1.25,
        output: 10.00,
        extended: Some((2.50, 15.00)),
    },
    ModelPrice {
        key: "gemini-1.5-flash",
        input: 0.075,
        output: 0.30,
        extended: None,
    },
];

/// Token usage and cost of one AI call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageInfo {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub input_cost_usd: f64,
    pub output_cost_usd: f64,
    pub total_cost_usd: f64,
    pub input_price_per_million: f64,
    pub output_price_per_million: f64,
    pub model: String,
}

impl UsageInfo {
    /// Price a call. Returns `None` when nothing was counted.
    pub fn from_tokens(model: &str, prompt_tokens: u64, completion_tokens: u64) -> Option<Self> {
        if prompt_tokens == 0 && completion_tokens == 0 {
            return None;
        }

        let (input_price, output_price) = price_for(model, prompt_tokens);
        let input_cost_usd = prompt_tokens as f64 / 1_000_000.0 * input_price;
        let output_cost_usd = completion_tokens as f64 / 1_000_000.0 * output_price;

        Some(UsageInfo {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            input_cost_usd,
            output_cost_usd,
            total_cost_usd: input_cost_usd + output_cost_usd,
            input_price_per_million: input_price,
            output_price_per_million: output_price,
            model: model.to_string(),
        })
    }

    pub fn total_cost_czk(&self) -> f64 {
        self.total_cost_usd * USD_TO_CZK
    }
}

/// Longest key matching by substring in either direction; unknown models
/// use the first entry.
fn price_for(model: &str, prompt_tokens: u64) -> (f64, f64) {
    let model_key = model.to_lowercase();
    let price = PRICES
        .iter()
        .filter(|p| model_key.contains(p.key) || p.key.contains(model_key.as_str()))
        .max_by_key(|p| p.key.len())
        .unwrap_or(&PRICES[0]);

    match price.extended {
        Some(extended) if prompt_tokens > EXTENDED_TIER_TOKENS => extended,
        _ => (price.input, price.output),
    }
}
