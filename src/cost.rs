//! Model capabilities and cost calculation.
//!
//! A static table keyed on canonical model names. Lookups accept versioned
//! and provider-prefixed names (`openai/gpt-4o-2024-08-06` → `gpt-4o`).

use crate::llm::UsageCounter;

/// Model pricing in nanodollars per token (1 USD = 1_000_000_000 nanodollars).
/// Using nanodollars avoids floating-point rounding issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPricing {
    /// Cost per input token in nanodollars
    pub input_nano_per_token: u64,
    /// Cost per output token in nanodollars
    pub output_nano_per_token: u64,
    /// Cost per cache read input token (if different, usually much cheaper)
    pub cache_read_nano_per_token: Option<u64>,
}

impl ModelPricing {
    const fn new(input: u64, output: u64, cache_read: Option<u64>) -> Self {
        Self {
            input_nano_per_token: input,
            output_nano_per_token: output,
            cache_read_nano_per_token: cache_read,
        }
    }
}

/// What the crate needs to know about a model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    /// Canonical name the info was found under
    pub name: String,
    pub context_length: u64,
    pub max_output_tokens: u64,
    /// `None` for unknown or local models (cost is then 0)
    pub pricing: Option<ModelPricing>,
    /// Supports the tools / function-calling API
    pub has_tools: bool,
    /// Accepts the `system` role
    pub allows_system_message: bool,
}

impl ModelInfo {
    fn known(
        name: &str,
        context_length: u64,
        max_output_tokens: u64,
        pricing: ModelPricing,
    ) -> Self {
        Self {
            name: name.to_string(),
            context_length,
            max_output_tokens,
            pricing: Some(pricing),
            has_tools: true,
            allows_system_message: true,
        }
    }

    /// Conservative defaults for a model missing from the table.
    pub fn unknown(name: &str) -> Self {
        Self {
            name: name.to_string(),
            context_length: 16_000,
            max_output_tokens: 4_096,
            pricing: None,
            has_tools: true,
            allows_system_message: true,
        }
    }

    /// Cost in USD of one call.
    ///
    /// Cached prompt tokens are billed at the cache-read rate when the model
    /// has one, otherwise at the input rate.
    pub fn cost_usd(&self, usage: &UsageCounter) -> f64 {
        let Some(pricing) = self.pricing else {
            return 0.0;
        };
        let cached = usage.cached_tokens.min(usage.prompt_tokens);
        let regular_input = usage.prompt_tokens - cached;
        let cache_rate = pricing
            .cache_read_nano_per_token
            .unwrap_or(pricing.input_nano_per_token);

        let cost_nano = regular_input
            .saturating_mul(pricing.input_nano_per_token)
            .saturating_add(cached.saturating_mul(cache_rate))
            .saturating_add(
                usage
                    .completion_tokens
                    .saturating_mul(pricing.output_nano_per_token),
            );
        cost_nano as f64 / 1_000_000_000.0
    }
}

/// Normalize model names to canonical form for lookup.
fn normalize_model(model: &str) -> &str {
    let trimmed = model.trim();

    match trimmed {
        // Claude models - normalize to base names
        s if s.contains("claude-3-5-sonnet") || s.contains("claude-3.5-sonnet") => {
            "claude-3-5-sonnet"
        }
        s if s.contains("claude-sonnet-4") || s.contains("claude-4-sonnet") => "claude-sonnet-4",
        s if s.contains("claude-3-5-haiku") || s.contains("claude-3.5-haiku") => "claude-3-5-haiku",
        s if s.contains("claude-opus-4") || s.contains("claude-4-opus") => "claude-opus-4",

        // GPT models
        s if s.contains("gpt-4o-mini") => "gpt-4o-mini",
        s if s.contains("gpt-4o") => "gpt-4o",
        s if s.contains("gpt-4.1-mini") => "gpt-4.1-mini",
        s if s.contains("gpt-4.1") => "gpt-4.1",
        s if s.contains("gpt-4-turbo") => "gpt-4-turbo",
        s if s.contains("gpt-5") => "gpt-5",
        s if s.contains("o1-mini") => "o1-mini",
        s if s.contains("o1") && !s.contains("gpt") => "o1",
        s if s.contains("o3-mini") => "o3-mini",
        s if s.contains("o3") && !s.contains("gpt") => "o3",
        s if s.contains("o4-mini") => "o4-mini",

        // Gemini models
        s if s.contains("gemini-2.5-pro") || s.contains("gemini-2-5-pro") => "gemini-2.5-pro",
        s if s.contains("gemini-2.5-flash") || s.contains("gemini-2-5-flash") => "gemini-2.5-flash",
        s if s.contains("gemini-2.0-flash") || s.contains("gemini-2-0-flash") => "gemini-2.0-flash",

        // Return as-is if no alias found
        _ => trimmed,
    }
}

/// Look up a canonical name in the table.
///
/// Prices are per 1M tokens converted to nanodollars per token:
/// - $3/1M input = 3_000 nanodollars per token
/// - $15/1M output = 15_000 nanodollars per token
fn lookup(canonical: &str) -> Option<ModelInfo> {
    let p = ModelPricing::new;
    let info = match canonical {
        "claude-3-5-sonnet" => ModelInfo::known(canonical, 200_000, 8_192, p(3_000, 15_000, Some(300))),
        "claude-sonnet-4" => ModelInfo::known(canonical, 200_000, 64_000, p(3_000, 15_000, Some(300))),
        "claude-3-5-haiku" => ModelInfo::known(canonical, 200_000, 8_192, p(800, 4_000, Some(80))),
        "claude-opus-4" => ModelInfo::known(canonical, 200_000, 32_000, p(15_000, 75_000, Some(1_500))),

        "gpt-4o" => ModelInfo::known(canonical, 128_000, 16_384, p(2_500, 10_000, Some(1_250))),
        "gpt-4o-mini" => ModelInfo::known(canonical, 128_000, 16_384, p(150, 600, Some(75))),
        "gpt-4.1" => ModelInfo::known(canonical, 1_047_576, 32_768, p(2_000, 8_000, Some(500))),
        "gpt-4.1-mini" => ModelInfo::known(canonical, 1_047_576, 32_768, p(400, 1_600, Some(100))),
        "gpt-4-turbo" => ModelInfo::known(canonical, 128_000, 4_096, p(10_000, 30_000, None)),
        "gpt-5" => ModelInfo::known(canonical, 400_000, 128_000, p(1_250, 10_000, Some(125))),

        // Early reasoning models reject the system role and tool use.
        "o1" => ModelInfo {
            has_tools: false,
            allows_system_message: false,
            ..ModelInfo::known(canonical, 200_000, 100_000, p(15_000, 60_000, Some(7_500)))
        },
        "o1-mini" => ModelInfo {
            has_tools: false,
            allows_system_message: false,
            ..ModelInfo::known(canonical, 128_000, 65_536, p(1_100, 4_400, Some(550)))
        },
        "o3" => ModelInfo::known(canonical, 200_000, 100_000, p(2_000, 8_000, Some(500))),
        "o3-mini" => ModelInfo::known(canonical, 200_000, 100_000, p(1_100, 4_400, Some(550))),
        "o4-mini" => ModelInfo::known(canonical, 200_000, 100_000, p(1_100, 4_400, Some(275))),

        "gemini-2.5-pro" => ModelInfo::known(canonical, 1_048_576, 65_536, p(1_250, 10_000, None)),
        "gemini-2.5-flash" => ModelInfo::known(canonical, 1_048_576, 65_536, p(300, 2_500, None)),
        "gemini-2.0-flash" => ModelInfo::known(canonical, 1_048_576, 8_192, p(100, 400, None)),

        _ => return None,
    };
    Some(info)
}

/// Capabilities and pricing for `model`.
///
/// Tries the full name first, then the part after a `provider/` prefix.
/// Unknown models get [`ModelInfo::unknown`].
pub fn model_info(model: &str) -> ModelInfo {
    let candidates = std::iter::once(model).chain(model.rsplit_once('/').map(|(_, m)| m));
    for candidate in candidates {
        if let Some(info) = lookup(normalize_model(candidate)) {
            return info;
        }
    }
    tracing::debug!(model = %model, "Unknown model, using default model info");
    ModelInfo::unknown(model)
}

/// Calculate the USD cost of one call to `model`.
pub fn cost_usd(model: &str, usage: &UsageCounter) -> f64 {
    model_info(model).cost_usd(usage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_model() {
        assert_eq!(
            normalize_model("claude-3-5-sonnet-20241022"),
            "claude-3-5-sonnet"
        );
        assert_eq!(normalize_model("gpt-4o-2024-08-06"), "gpt-4o");
        assert_eq!(normalize_model("gemini-2.5-pro-preview"), "gemini-2.5-pro");
        assert_eq!(normalize_model("o1-mini-2024-09-12"), "o1-mini");
    }

    #[test]
    fn test_provider_prefix_fallback() {
        assert_eq!(model_info("openai/gpt-4o-mini").name, "gpt-4o-mini");
        assert_eq!(model_info("somewhere/else/gpt-4o").name, "gpt-4o");
    }

    #[test]
    fn test_unknown_model_defaults() {
        let info = model_info("llama3.2:3b");
        assert!(info.pricing.is_none());
        assert!(info.allows_system_message);
        assert_eq!(info.cost_usd(&UsageCounter::new(1000, 1000)), 0.0);
    }

    #[test]
    fn test_reasoning_models_reject_system_role() {
        assert!(!model_info("o1-mini").allows_system_message);
        assert!(!model_info("openai/o1").has_tools);
        assert!(model_info("gpt-4o").allows_system_message);
    }

    #[test]
    fn test_cost_calculation_basic() {
        // 1000 * $3/1M + 500 * $15/1M = $0.003 + $0.0075
        let cost = cost_usd("claude-3-5-sonnet", &UsageCounter::new(1000, 500));
        assert!((cost - 0.0105).abs() < 1e-12);
    }

    #[test]
    fn test_cost_calculation_with_cache() {
        // 5000 cached at $0.30/1M + 1000 output at $15/1M
        let usage = UsageCounter::new(5000, 1000).with_cached(5000);
        let cost = cost_usd("claude-3-5-sonnet", &usage);
        assert!((cost - 0.0165).abs() < 1e-12);
    }

    #[test]
    fn test_cached_falls_back_to_input_rate() {
        let with_cache = UsageCounter::new(1000, 0).with_cached(400);
        let plain = UsageCounter::new(1000, 0);
        assert_eq!(cost_usd("gemini-2.5-pro", &with_cache), cost_usd("gemini-2.5-pro", &plain));
    }
}
