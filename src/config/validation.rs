//! Configuration validation

use super::Config;
use crate::error::{GatewayError, Result};
use std::net::SocketAddr;

/// Validate a parsed configuration before the server starts
pub fn validate_config(config: &Config) -> Result<()> {
    config
        .listener
        .address
        .parse::<SocketAddr>()
        .map_err(|e| {
            GatewayError::ConfigValidation(format!(
                "listener address '{}' is not a socket address: {}",
                config.listener.address, e
            ))
        })?;

    if config.proxy.request_timeout_secs == 0 {
        return Err(GatewayError::ConfigValidation(
            "proxy.request_timeout_secs must be positive".to_string(),
        ));
    }

    if config.tokenizer.workers == 0 {
        return Err(GatewayError::ConfigValidation(
            "tokenizer.workers must be positive".to_string(),
        ));
    }
    if config.tokenizer.queue_depth == 0 {
        return Err(GatewayError::ConfigValidation(
            "tokenizer.queue_depth must be positive".to_string(),
        ));
    }

    if config.buffer.enabled {
        if config.buffer.command.is_empty() {
            return Err(GatewayError::ConfigValidation(
                "buffer.command is required when buffering is enabled".to_string(),
            ));
        }
        if config.buffer.port == 0 {
            return Err(GatewayError::ConfigValidation(
                "buffer.port must be a fixed port".to_string(),
            ));
        }
    }

    if config.emitter.queue_depth == 0 {
        return Err(GatewayError::ConfigValidation(
            "emitter.queue_depth must be positive".to_string(),
        ));
    }
    if config.emitter.max_attempts == 0 {
        return Err(GatewayError::ConfigValidation(
            "emitter.max_attempts must be positive".to_string(),
        ));
    }

    if let Some(path) = &config.pricing.path {
        if !path.exists() {
            return Err(GatewayError::ConfigValidation(format!(
                "pricing table {:?} does not exist",
                path
            )));
        }
    }

    Ok(())
}
