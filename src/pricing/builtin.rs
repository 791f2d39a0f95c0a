//! Built-in pricing table
//!
//! Used when no pricing file is configured. Rates are USD per token or per
//! unit. The table is ordered: more specific matchers come before broader
//! prefix matchers so that first-match lookup stays unambiguous.

use super::{ModelMatcher, PricingRule, PricingTable, Rates};
use std::collections::BTreeMap;

fn rule(matcher: ModelMatcher, cost: Rates) -> PricingRule {
    PricingRule {
        model: matcher,
        cost,
    }
}

fn token_rates(prompt: f64, completion: f64) -> Rates {
    Rates {
        prompt_token: prompt,
        completion_token: completion,
        ..Default::default()
    }
}

fn cached_token_rates(prompt: f64, completion: f64, cache_read: f64, cache_write: f64) -> Rates {
    Rates {
        prompt_token: prompt,
        completion_token: completion,
        cache_read_token: cache_read,
        cache_write_token: cache_write,
        ..Default::default()
    }
}

/// The compiled-in default pricing table
pub fn builtin_table() -> PricingTable {
    let mut providers = BTreeMap::new();

    let openai_rules = vec![
        rule(
            ModelMatcher::equals("gpt-4o-mini"),
            cached_token_rates(1.5e-7, 6e-7, 7.5e-8, 0.0),
        ),
        rule(
            ModelMatcher::equals("gpt-4o"),
            cached_token_rates(2.5e-6, 1e-5, 1.25e-6, 0.0),
        ),
        rule(
            ModelMatcher::starts_with("gpt-4.1-mini"),
            cached_token_rates(4e-7, 1.6e-6, 1e-7, 0.0),
        ),
        rule(
            ModelMatcher::equals("gpt-4.1"),
            cached_token_rates(2e-6, 8e-6, 5e-7, 0.0),
        ),
        rule(ModelMatcher::starts_with("o3-mini"), token_rates(1.1e-6, 4.4e-6)),
        rule(
            ModelMatcher::equals("gpt-3.5-turbo"),
            token_rates(5e-7, 1.5e-6),
        ),
        rule(
            ModelMatcher::equals("dall-e-3"),
            Rates {
                per_image: 0.04,
                ..Default::default()
            },
        ),
    ];
    // Azure serves the same models at the same list prices
    providers.insert("openai".to_string(), openai_rules.clone());
    providers.insert("azure".to_string(), openai_rules);

    providers.insert(
        "anthropic".to_string(),
        vec![
            rule(
                ModelMatcher::starts_with("claude-3-5-haiku"),
                cached_token_rates(8e-7, 4e-6, 8e-8, 1e-6),
            ),
            rule(
                ModelMatcher::starts_with("claude-3-5-sonnet"),
                cached_token_rates(3e-6, 1.5e-5, 3e-7, 3.75e-6),
            ),
            rule(
                ModelMatcher::starts_with("claude-3-opus"),
                cached_token_rates(1.5e-5, 7.5e-5, 1.5e-6, 1.875e-5),
            ),
            rule(
                ModelMatcher::starts_with("claude-3-haiku"),
                cached_token_rates(2.5e-7, 1.25e-6, 3e-8, 3e-7),
            ),
        ],
    );

    providers.insert(
        "google-vertex-ai".to_string(),
        vec![
            rule(
                ModelMatcher::starts_with("gemini-1.5-flash"),
                token_rates(7.5e-8, 3e-7),
            ),
            rule(
                ModelMatcher::starts_with("gemini-1.5-pro"),
                token_rates(1.25e-6, 5e-6),
            ),
            rule(
                ModelMatcher::starts_with("gemini-2.0-flash"),
                token_rates(1e-7, 4e-7),
            ),
        ],
    );

    providers.insert(
        "fireworks".to_string(),
        vec![
            rule(
                ModelMatcher::equals("black-forest-labs/flux-schnell"),
                Rates {
                    per_image: 0.0013,
                    ..Default::default()
                },
            ),
            rule(
                ModelMatcher::equals("black-forest-labs/flux-dev"),
                Rates {
                    per_image: 0.005,
                    ..Default::default()
                },
            ),
            rule(
                ModelMatcher::includes("llama-v3p1-70b"),
                token_rates(9e-7, 9e-7),
            ),
            rule(
                ModelMatcher::includes("llama-v3p1-8b"),
                token_rates(2e-7, 2e-7),
            ),
        ],
    );

    providers.insert(
        "together".to_string(),
        vec![
            rule(
                ModelMatcher::equals("meta-llama/Meta-Llama-3.1-70B-Instruct-Turbo"),
                token_rates(8.8e-7, 8.8e-7),
            ),
            rule(
                ModelMatcher::equals("meta-llama/Meta-Llama-3.1-8B-Instruct-Turbo"),
                token_rates(1.8e-7, 1.8e-7),
            ),
            rule(
                ModelMatcher::starts_with("mistralai/Mixtral"),
                token_rates(6e-7, 6e-7),
            ),
        ],
    );

    providers.insert(
        "openrouter".to_string(),
        vec![
            rule(
                ModelMatcher::equals("openai/gpt-4o"),
                token_rates(2.5e-6, 1e-5),
            ),
            rule(
                ModelMatcher::equals("anthropic/claude-3.5-sonnet"),
                token_rates(3e-6, 1.5e-5),
            ),
            rule(
                ModelMatcher::starts_with("deepseek/"),
                token_rates(1.4e-7, 2.8e-7),
            ),
        ],
    );

    // QStash bills per delivered call, not per token
    providers.insert(
        "qstash".to_string(),
        vec![rule(
            ModelMatcher::starts_with(""),
            Rates {
                per_call: 0.000001,
                ..Default::default()
            },
        )],
    );

    PricingTable::new(providers)
}
