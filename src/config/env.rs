//! Environment variable interpolation for configuration files
//!
//! Supports the following syntax:
//! - `${VAR}` - Required variable, fails if not set
//! - `${VAR:-default}` - Variable with default value if not set
//! - `${VAR:?error message}` - Required variable with custom error message

use crate::error::{GatewayError, Result};
use regex::{Captures, Regex};
use std::env;
use std::sync::LazyLock;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    // Matches ${VAR}, ${VAR:-default}, ${VAR:?error}
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?:(:[-?])([^}]*))?\}").unwrap()
});

/// Environment variable expander
#[derive(Default)]
pub struct EnvExpander {
    /// Custom environment source (for testing)
    env_source: Option<std::collections::HashMap<String, String>>,
}

impl EnvExpander {
    fn get_env(&self, name: &str) -> Option<String> {
        if let Some(source) = &self.env_source {
            source.get(name).cloned()
        } else {
            env::var(name).ok()
        }
    }

    /// Expand environment variables in a string
    pub fn expand(&self, input: &str) -> Result<String> {
        let mut errors: Vec<String> = Vec::new();

        let expanded = ENV_VAR_PATTERN.replace_all(input, |caps: &Captures| {
            let var_name = &caps[1];
            let modifier = caps.get(2).map(|m| m.as_str());
            let modifier_value = caps.get(3).map(|m| m.as_str()).unwrap_or("");

            match self.get_env(var_name) {
                Some(value) => value,
                None => match modifier {
                    Some(":-") => modifier_value.to_string(),
                    Some(":?") => {
                        let message = if modifier_value.is_empty() {
                            format!("Required environment variable '{}' is not set", var_name)
                        } else {
                            modifier_value.to_string()
                        };
                        errors.push(message);
                        String::new()
                    }
                    _ => {
                        errors.push(format!("Environment variable '{}' is not set", var_name));
                        String::new()
                    }
                },
            }
        });

        if !errors.is_empty() {
            return Err(GatewayError::Config(format!(
                "Environment variable errors:\n  - {}",
                errors.join("\n  - ")
            )));
        }

        Ok(expanded.into_owned())
    }
}

/// Expand environment variables in a config string
pub fn expand_env_vars(input: &str) -> Result<String> {
    EnvExpander::default().expand(input)
}
