//! Configuration for the Tollgate gateway
//!
//! Supports YAML and TOML configuration formats with validation.
//! Environment variables can be interpolated using `${VAR}`,
//! `${VAR:-default}`, or `${VAR:?error}` syntax.

mod env;
mod types;
mod validation;

pub use env::{expand_env_vars, EnvExpander};
pub use types::*;
pub use validation::validate_config;

use crate::error::{GatewayError, Result};
use crate::pricing::{builtin_table, PricingTable};
use std::path::Path;
use tracing::info;

/// Load configuration from a file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        GatewayError::Config(format!("Failed to read config file {:?}: {}", path, e))
    })?;

    let content = expand_env_vars(&content)?;
    let config = parse_config(&content, path)?;
    validate_config(&config)?;

    info!("Configuration loaded from {:?}", path);
    Ok(config)
}

/// Parse configuration from string content
fn parse_config(content: &str, path: &Path) -> Result<Config> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("yaml");

    match extension {
        "yaml" | "yml" => serde_yaml::from_str(content).map_err(|e| e.into()),
        "toml" => toml::from_str(content).map_err(|e| e.into()),
        _ => Err(GatewayError::Config(format!(
            "Unsupported config format: {}",
            extension
        ))),
    }
}

/// Load the pricing table named by the configuration, or the compiled-in
/// default. Either way the table is validated before use.
pub fn load_pricing(config: &Config) -> Result<PricingTable> {
    match &config.pricing.path {
        Some(path) => {
            let table = PricingTable::load(path)?;
            info!(
                rules = table.len(),
                "Pricing table loaded from {:?}", path
            );
            Ok(table)
        }
        None => {
            let table = builtin_table();
            table.validate()?;
            info!(rules = table.len(), "Using built-in pricing table");
            Ok(table)
        }
    }
}
