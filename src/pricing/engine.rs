//! Cost accounting engine
//!
//! Derives a monetary cost from metered usage against the pricing table.
//! This path must never fail: anything that would be an error degrades to a
//! zero-cost, flagged outcome that is reconciled offline.

use super::PricingTable;
use crate::canonical::UsageCounters;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

/// Metered usage for one completed request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub calls: u64,
    pub images: u64,
}

impl Usage {
    /// Build usage from response token counters plus call/image counts
    pub fn from_counters(counters: &UsageCounters, calls: u64, images: u64) -> Self {
        Self {
            prompt_tokens: counters.prompt_tokens,
            completion_tokens: counters.completion_tokens,
            cache_read_tokens: counters.cache_read_tokens,
            cache_write_tokens: counters.cache_write_tokens,
            calls,
            images,
        }
    }
}

/// Outcome of a cost computation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CostOutcome {
    /// Cost in the pricing table's currency (USD)
    pub amount: f64,
    /// No pricing rule matched the (provider, model) pair
    pub unpriced: bool,
    /// An internal fault forced a zero-cost result
    pub errored: bool,
}

impl CostOutcome {
    fn priced(amount: f64) -> Self {
        Self {
            amount,
            unpriced: false,
            errored: false,
        }
    }

    fn unpriced() -> Self {
        Self {
            amount: 0.0,
            unpriced: true,
            errored: false,
        }
    }

    fn errored() -> Self {
        Self {
            amount: 0.0,
            unpriced: false,
            errored: true,
        }
    }
}

/// Cost engine over an immutable pricing table
#[derive(Clone)]
pub struct CostEngine {
    table: Arc<PricingTable>,
}

impl CostEngine {
    pub fn new(table: Arc<PricingTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &PricingTable {
        &self.table
    }

    /// Compute the cost of `usage` for a (provider, model) pair.
    ///
    /// Never returns an error: an unmatched model yields a zero-cost
    /// `unpriced` outcome, a non-finite product yields a zero-cost
    /// `errored` outcome.
    pub fn cost(&self, provider: &str, model: &str, usage: &Usage) -> CostOutcome {
        let rule = match self.table.find_rule(provider, model) {
            Some(rule) => rule,
            None => {
                warn!(provider, model, "no pricing rule matched; recording unpriced");
                return CostOutcome::unpriced();
            }
        };

        let rates = &rule.cost;
        let amount = usage.prompt_tokens as f64 * rates.prompt_token
            + usage.completion_tokens as f64 * rates.completion_token
            + usage.cache_read_tokens as f64 * rates.cache_read_token
            + usage.cache_write_tokens as f64 * rates.cache_write_token
            + usage.calls as f64 * rates.per_call
            + usage.images as f64 * rates.per_image;

        if !amount.is_finite() {
            warn!(
                provider,
                model, amount, "cost computation produced a non-finite amount"
            );
            return CostOutcome::errored();
        }

        CostOutcome::priced(amount)
    }
}
