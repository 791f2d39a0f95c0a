//! Property-based tests for Tollgate
//!
//! These tests use proptest to verify metering and matching properties
//! hold for arbitrary inputs.

use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use tollgate::pricing::{
    builtin_table, CostEngine, MatchOperator, ModelMatcher, PricingRule, PricingTable, Rates,
    Usage,
};

fn engine_with_rule(provider: &str, matcher: ModelMatcher, cost: Rates) -> CostEngine {
    let mut providers = BTreeMap::new();
    providers.insert(
        provider.to_string(),
        vec![PricingRule {
            model: matcher,
            cost,
        }],
    );
    CostEngine::new(Arc::new(PricingTable::new(providers)))
}

// ============================================================================
// Cost Engine Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Cost is linear in usage: doubling every count doubles the amount
    #[test]
    fn prop_cost_linearity(
        prompt in 0u64..1_000_000,
        completion in 0u64..1_000_000,
        cache_read in 0u64..100_000,
        cache_write in 0u64..100_000,
    ) {
        let engine = engine_with_rule(
            "openai",
            ModelMatcher::equals("gpt-4o"),
            Rates {
                prompt_token: 2.5e-6,
                completion_token: 1e-5,
                cache_read_token: 1.25e-6,
                cache_write_token: 3e-6,
                ..Default::default()
            },
        );

        let usage = Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            cache_read_tokens: cache_read,
            cache_write_tokens: cache_write,
            ..Default::default()
        };
        let doubled = Usage {
            prompt_tokens: prompt * 2,
            completion_tokens: completion * 2,
            cache_read_tokens: cache_read * 2,
            cache_write_tokens: cache_write * 2,
            ..Default::default()
        };

        let one = engine.cost("openai", "gpt-4o", &usage).amount;
        let two = engine.cost("openai", "gpt-4o", &doubled).amount;
        prop_assert!((two - 2.0 * one).abs() < 1e-9);
    }

    /// A per-image-only rule is independent of token counts
    #[test]
    fn prop_per_image_isolation(
        prompt in 0u64..10_000_000,
        completion in 0u64..10_000_000,
        images in 0u64..100,
    ) {
        let engine = engine_with_rule(
            "fireworks",
            ModelMatcher::equals("black-forest-labs/flux-schnell"),
            Rates {
                per_image: 0.0013,
                ..Default::default()
            },
        );

        let usage = Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            images,
            calls: 1,
            ..Default::default()
        };
        let outcome = engine.cost("fireworks", "black-forest-labs/flux-schnell", &usage);
        prop_assert!((outcome.amount - images as f64 * 0.0013).abs() < 1e-9);
    }

    /// An unmatched model always yields zero cost and the unpriced flag,
    /// never a panic
    #[test]
    fn prop_unmatched_model_degrades(
        model in "[a-z0-9-]{1,40}",
        prompt in 0u64..1_000_000,
        completion in 0u64..1_000_000,
    ) {
        let engine = engine_with_rule(
            "openai",
            ModelMatcher::equals("gpt-4o"),
            Rates::default(),
        );
        prop_assume!(model != "gpt-4o");

        let usage = Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            calls: 1,
            ..Default::default()
        };
        let outcome = engine.cost("openai", &model, &usage);
        prop_assert_eq!(outcome.amount, 0.0);
        prop_assert!(outcome.unpriced);
    }

    /// Cost is never negative or non-finite for non-negative rates
    #[test]
    fn prop_cost_is_finite_and_non_negative(
        prompt in 0u64..u32::MAX as u64,
        completion in 0u64..u32::MAX as u64,
        calls in 0u64..1000,
        images in 0u64..1000,
        prompt_rate in 0.0f64..1e-3,
        completion_rate in 0.0f64..1e-3,
    ) {
        let engine = engine_with_rule(
            "together",
            ModelMatcher::starts_with(""),
            Rates {
                prompt_token: prompt_rate,
                completion_token: completion_rate,
                per_call: 1e-6,
                per_image: 1e-3,
                ..Default::default()
            },
        );

        let usage = Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            calls,
            images,
            ..Default::default()
        };
        let outcome = engine.cost("together", "anything", &usage);
        prop_assert!(outcome.amount.is_finite());
        prop_assert!(outcome.amount >= 0.0);
    }
}

// ============================================================================
// Matcher Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// equals accepts exactly its own value
    #[test]
    fn prop_equals_is_exact(value in "[a-z0-9/.-]{1,30}", other in "[a-z0-9/.-]{1,30}") {
        let matcher = ModelMatcher::equals(value.clone());
        prop_assert!(matcher.matches(&value));
        if other != value {
            prop_assert!(!matcher.matches(&other));
        }
    }

    /// startsWith accepts any extension of its value
    #[test]
    fn prop_starts_with_accepts_extensions(
        prefix in "[a-z0-9-]{1,20}",
        suffix in "[a-z0-9-]{0,20}",
    ) {
        let matcher = ModelMatcher::starts_with(prefix.clone());
        let model = format!("{}{}", prefix, suffix);
        prop_assert!(matcher.matches(&model));
    }

    /// includes accepts its value embedded anywhere
    #[test]
    fn prop_includes_accepts_embedding(
        before in "[a-z0-9-]{0,15}",
        needle in "[a-z0-9-]{1,15}",
        after in "[a-z0-9-]{0,15}",
    ) {
        let matcher = ModelMatcher::includes(needle.clone());
        let model = format!("{}{}{}", before, needle, after);
        prop_assert!(matcher.matches(&model));
    }

    /// The operator hierarchy: equals implies startsWith implies includes
    #[test]
    fn prop_operator_hierarchy(value in "[a-z0-9-]{1,30}", model in "[a-z0-9-]{1,40}") {
        let equals = ModelMatcher { operator: MatchOperator::Equals, value: value.clone() };
        let starts = ModelMatcher { operator: MatchOperator::StartsWith, value: value.clone() };
        let includes = ModelMatcher { operator: MatchOperator::Includes, value };

        if equals.matches(&model) {
            prop_assert!(starts.matches(&model));
        }
        if starts.matches(&model) {
            prop_assert!(includes.matches(&model));
        }
    }
}

// ============================================================================
// Pricing Table Uniqueness
// ============================================================================

/// For every provider in the built-in table and every concrete model string
/// a rule's matcher would accept, exactly one rule matches
#[test]
fn builtin_table_matcher_uniqueness() {
    let table = builtin_table();

    for provider in table.providers().collect::<Vec<_>>() {
        let rules = table.rules_for(provider).unwrap();
        for rule in rules {
            let probe = &rule.model.value;
            let hits = rules.iter().filter(|r| r.model.matches(probe)).count();
            assert_eq!(
                hits, 1,
                "provider '{}' has {} rules matching '{}'",
                provider, hits, probe
            );
        }
    }
}

/// Load-time validation rejects an overlapping table outright
#[test]
fn ambiguous_table_rejected_at_validation() {
    let mut providers = BTreeMap::new();
    providers.insert(
        "openai".to_string(),
        vec![
            PricingRule {
                model: ModelMatcher::includes("gpt"),
                cost: Rates::default(),
            },
            PricingRule {
                model: ModelMatcher::equals("gpt-4o"),
                cost: Rates::default(),
            },
        ],
    );
    assert!(PricingTable::new(providers).validate().is_err());
}
