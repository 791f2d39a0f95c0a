//! Error types for the Tollgate gateway

use std::io;
use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Main error type for the gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file parsing errors
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Inbound request does not resolve to a known provider
    #[error("Provider resolution failed: {0}")]
    ProviderResolution(String),

    /// Malformed client payload; no upstream call can be made
    #[error("Request transform failed: {0}")]
    RequestTransform(String),

    /// Malformed upstream payload; callers degrade to raw pass-through
    #[error("Response transform failed: {0}")]
    ResponseTransform(String),

    /// Upstream connection or transport errors
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Token counting failed; the count is unknown, not zero
    #[error("Token count failed: {0}")]
    TokenCount(String),

    /// Cost lookup or arithmetic fault; callers record a zero-cost outcome
    #[error("Cost calculation failed: {0}")]
    CostCalculation(String),

    /// Body buffer sidecar unreachable or crashed
    #[error("Buffer sidecar error: {0}")]
    BufferSidecar(String),

    /// Usage record could not be delivered
    #[error("Emitter error: {0}")]
    Emitter(String),

    /// Request timeout
    #[error("Request timeout")]
    Timeout,

    /// HTTP protocol errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// Server shutdown
    #[error("Server is shutting down")]
    Shutdown,

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<hyper::Error> for GatewayError {
    fn from(err: hyper::Error) -> Self {
        GatewayError::Http(err.to_string())
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        GatewayError::ConfigParse(err.to_string())
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(err: toml::de::Error) -> Self {
        GatewayError::ConfigParse(err.to_string())
    }
}

impl From<regex::Error> for GatewayError {
    fn from(err: regex::Error) -> Self {
        GatewayError::Config(format!("Invalid regex pattern: {}", err))
    }
}

/// Error response that can be converted to an HTTP response
///
/// Only failures that affect the correctness of the client-visible response
/// surface here; metering failures never reach this type.
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub status: u16,
    pub message: String,
}

impl From<&GatewayError> for ErrorResponse {
    fn from(err: &GatewayError) -> Self {
        match err {
            GatewayError::ProviderResolution(msg) => ErrorResponse {
                status: 400,
                message: msg.clone(),
            },
            GatewayError::RequestTransform(msg) => ErrorResponse {
                status: 400,
                message: msg.clone(),
            },
            GatewayError::Timeout => ErrorResponse {
                status: 504,
                message: "Gateway Timeout".to_string(),
            },
            // Sidecar failures are retryable from the client's point of view
            GatewayError::BufferSidecar(_) => ErrorResponse {
                status: 502,
                message: "Bad Gateway".to_string(),
            },
            GatewayError::Shutdown => ErrorResponse {
                status: 503,
                message: "Service Unavailable".to_string(),
            },
            _ => ErrorResponse {
                status: 502,
                message: "Bad Gateway".to_string(),
            },
        }
    }
}
