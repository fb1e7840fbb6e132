//! Cost accounting for LLM extraction runs.
//!
//! List prices are per one million tokens. Versioned model names such as
//! `gpt-4o-2024-08-06` resolve to their base family before lookup; unknown
//! models cost zero rather than failing the run.

use std::sync::OnceLock;

use regex::Regex;

use crate::db::tasks::{ExtractionMode, ServiceTier};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelRates {
    pub input_per_million: f64,
    pub cached_input_per_million: f64,
    pub output_per_million: f64,
}

const RATE_TABLE: [(&str, ModelRates); 3] = [
    (
        "gpt-5",
        ModelRates {
            input_per_million: 1.25,
            cached_input_per_million: 0.125,
            output_per_million: 10.0,
        },
    ),
    (
        "gpt-4.1",
        ModelRates {
            input_per_million: 2.0,
            cached_input_per_million: 0.5,
            output_per_million: 8.0,
        },
    ),
    (
        "gpt-4o",
        ModelRates {
            input_per_million: 2.5,
            cached_input_per_million: 1.25,
            output_per_million: 10.0,
        },
    ),
];

fn versioned_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(gpt-5|gpt-4\.1|gpt-4o)-\d{4}-\d{2}-\d{2}(?:$|-)").unwrap()
    })
}

/// Base pricing family for a model name, resolving dated snapshot names.
fn base_family(model: &str) -> Option<&str> {
    let model = model.trim();
    if RATE_TABLE.iter().any(|(name, _)| *name == model) {
        return Some(model);
    }
    versioned_name_regex()
        .captures(model)
        .map(|caps| caps.get(1).map(|m| m.as_str()).unwrap_or(model))
}

fn rates_for(model: &str) -> Option<ModelRates> {
    let family = base_family(model)?;
    RATE_TABLE
        .iter()
        .find(|(name, _)| *name == family)
        .map(|(_, rates)| *rates)
}

/// Tier/mode price multiplier: flex service or batch mode halves list price,
/// priority and scale double it.
fn multiplier(tier: Option<ServiceTier>, mode: ExtractionMode) -> f64 {
    let flex_or_batch =
        tier == Some(ServiceTier::Flex) || mode == ExtractionMode::Batch;
    if flex_or_batch {
        return 0.5;
    }
    match tier {
        Some(ServiceTier::Priority) | Some(ServiceTier::Scale) => 2.0,
        _ => 1.0,
    }
}

fn round_usd(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

/// Dollar cost of one extraction run. Input, cached-input, and output token
/// counts are billed independently at their per-million rates. Unknown
/// models yield zero.
pub fn compute_cost_usd(
    model: &str,
    input_tokens: u64,
    cached_input_tokens: u64,
    output_tokens: u64,
    tier: Option<ServiceTier>,
    mode: ExtractionMode,
) -> f64 {
    let Some(rates) = rates_for(model) else {
        return 0.0;
    };
    let base = (input_tokens as f64 / 1e6) * rates.input_per_million
        + (cached_input_tokens as f64 / 1e6) * rates.cached_input_per_million
        + (output_tokens as f64 / 1e6) * rates.output_per_million;
    round_usd(base * multiplier(tier, mode))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versioned_names_resolve_to_base_family() {
        assert_eq!(base_family("gpt-4o-2024-08-06"), Some("gpt-4o"));
        assert_eq!(base_family("gpt-5-2025-08-07-preview"), Some("gpt-5"));
        assert_eq!(base_family("gpt-4.1"), Some("gpt-4.1"));
        assert_eq!(base_family("gpt-4o-mini"), None);
        assert_eq!(base_family("o3"), None);
    }

    #[test]
    fn unknown_model_costs_zero() {
        let cost = compute_cost_usd("mystery-model", 1_000_000, 0, 1_000_000, None, ExtractionMode::Sync);
        assert_eq!(cost, 0.0);
    }

    #[test]
    fn full_price_sync_default_tier() {
        // 1M uncached input + 1M output on gpt-4o: 2.5 + 10.0
        let cost = compute_cost_usd("gpt-4o", 1_000_000, 0, 1_000_000, None, ExtractionMode::Sync);
        assert_eq!(cost, 12.5);
    }

    #[test]
    fn cached_input_billed_at_cached_rate() {
        // 1M input + 400k cached on gpt-5: 1.25 + 0.4*0.125
        let cost = compute_cost_usd("gpt-5", 1_000_000, 400_000, 0, None, ExtractionMode::Sync);
        assert_eq!(cost, 1.3);
    }

    #[test]
    fn batch_mode_halves_list_price() {
        let list = compute_cost_usd("gpt-4.1", 1_000_000, 0, 0, None, ExtractionMode::Sync);
        let batch = compute_cost_usd("gpt-4.1", 1_000_000, 0, 0, None, ExtractionMode::Batch);
        assert_eq!(batch, round_usd(list * 0.5));
    }

    #[test]
    fn flex_tier_halves_even_outside_batch() {
        let cost = compute_cost_usd(
            "gpt-4o",
            1_000_000,
            0,
            0,
            Some(ServiceTier::Flex),
            ExtractionMode::Sync,
        );
        assert_eq!(cost, 1.25);
    }

    #[test]
    fn priority_and_scale_double_list_price() {
        for tier in [ServiceTier::Priority, ServiceTier::Scale] {
            let cost = compute_cost_usd("gpt-4o", 1_000_000, 0, 0, Some(tier), ExtractionMode::Sync);
            assert_eq!(cost, 5.0);
        }
    }

    #[test]
    fn batch_with_priority_still_discounts() {
        // Flex-or-batch wins over the priority surcharge.
        let cost = compute_cost_usd(
            "gpt-4o",
            1_000_000,
            0,
            0,
            Some(ServiceTier::Priority),
            ExtractionMode::Batch,
        );
        assert_eq!(cost, 1.25);
    }
}
