//! Pricing rules and the cost accounting engine
//!
//! The pricing table is the external configuration surface shared with the
//! pricing-display pages: per provider, an ordered list of
//! `{model: {operator, value}, cost: {...}}` records. It is loaded once at
//! process start and read-only afterwards.

mod builtin;
mod engine;

pub use builtin::builtin_table;
pub use engine::{CostEngine, CostOutcome, Usage};

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Matcher operator applied to a model identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchOperator {
    /// Exact string equality
    Equals,
    /// Prefix test
    StartsWith,
    /// Substring test
    Includes,
}

/// Model matcher: operator plus value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMatcher {
    pub operator: MatchOperator,
    pub value: String,
}

impl ModelMatcher {
    pub fn equals(value: impl Into<String>) -> Self {
        Self {
            operator: MatchOperator::Equals,
            value: value.into(),
        }
    }

    pub fn starts_with(value: impl Into<String>) -> Self {
        Self {
            operator: MatchOperator::StartsWith,
            value: value.into(),
        }
    }

    pub fn includes(value: impl Into<String>) -> Self {
        Self {
            operator: MatchOperator::Includes,
            value: value.into(),
        }
    }

    /// Test a concrete model string against this matcher
    pub fn matches(&self, model: &str) -> bool {
        match self.operator {
            MatchOperator::Equals => model == self.value,
            MatchOperator::StartsWith => model.starts_with(&self.value),
            MatchOperator::Includes => model.contains(&self.value),
        }
    }
}

/// Per-unit rates, currency per token or per unit; unset fields are zero
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rates {
    #[serde(default)]
    pub prompt_token: f64,
    #[serde(default)]
    pub completion_token: f64,
    #[serde(default)]
    pub cache_read_token: f64,
    #[serde(default)]
    pub cache_write_token: f64,
    #[serde(default)]
    pub per_call: f64,
    #[serde(default)]
    pub per_image: f64,
}

/// One pricing rule: a model matcher and its rates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingRule {
    pub model: ModelMatcher,
    pub cost: Rates,
}

/// The full pricing table, grouped by provider name
///
/// Rule order within a provider is significant: cost lookup takes the first
/// match. BTreeMap keeps provider iteration deterministic for validation
/// reporting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingTable {
    #[serde(flatten)]
    providers: BTreeMap<String, Vec<PricingRule>>,
}

impl PricingTable {
    /// Build a table from explicit per-provider rule lists
    pub fn new(providers: BTreeMap<String, Vec<PricingRule>>) -> Self {
        Self { providers }
    }

    /// Load a pricing table from a YAML or JSON file and validate it
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("Failed to read pricing table {:?}: {}", path, e))
        })?;

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("yaml");
        let table: PricingTable = match extension {
            "yaml" | "yml" => serde_yaml::from_str(&content)?,
            "json" => serde_json::from_str(&content)
                .map_err(|e| GatewayError::ConfigParse(e.to_string()))?,
            _ => {
                return Err(GatewayError::Config(format!(
                    "Unsupported pricing table format: {}",
                    extension
                )))
            }
        };

        table.validate()?;
        Ok(table)
    }

    /// First rule for `provider` whose matcher accepts `model`
    pub fn find_rule(&self, provider: &str, model: &str) -> Option<&PricingRule> {
        self.providers
            .get(provider)?
            .iter()
            .find(|rule| rule.model.matches(model))
    }

    /// Rules registered for a provider
    pub fn rules_for(&self, provider: &str) -> Option<&[PricingRule]> {
        self.providers.get(provider).map(Vec::as_slice)
    }

    /// Provider names present in the table
    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// Total rule count across providers
    pub fn len(&self) -> usize {
        self.providers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject ambiguous tables at load time.
    ///
    /// For every provider, each rule's own value string is a concrete model
    /// identifier its matcher accepts; probing all rules with it must find
    /// exactly one match. Rates must also be finite and non-negative.
    pub fn validate(&self) -> Result<()> {
        for (provider, rules) in &self.providers {
            for rule in rules {
                let probe = &rule.model.value;
                let hits = rules.iter().filter(|r| r.model.matches(probe)).count();
                if hits != 1 {
                    return Err(GatewayError::ConfigValidation(format!(
                        "Pricing table is ambiguous: provider '{}' has {} rules matching model '{}'",
                        provider, hits, probe
                    )));
                }

                for (name, rate) in [
                    ("prompt_token", rule.cost.prompt_token),
                    ("completion_token", rule.cost.completion_token),
                    ("cache_read_token", rule.cost.cache_read_token),
                    ("cache_write_token", rule.cost.cache_write_token),
                    ("per_call", rule.cost.per_call),
                    ("per_image", rule.cost.per_image),
                ] {
                    if !rate.is_finite() || rate < 0.0 {
                        return Err(GatewayError::ConfigValidation(format!(
                            "Pricing table has invalid {} rate {} for provider '{}' model '{}'",
                            name, rate, provider, probe
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
