//! Configuration type definitions

use crate::buffer::BufferConfig;
use crate::emitter::EmitterConfig;
use crate::tokenizer::TokenizerConfig;
use serde::Deserialize;
use std::path::PathBuf;

/// Top-level gateway configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Inbound listener
    pub listener: ListenerConfig,

    /// Proxying behavior
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Pricing table source
    #[serde(default)]
    pub pricing: PricingConfig,

    /// Token counter worker pool
    #[serde(default)]
    pub tokenizer: TokenizerConfig,

    /// Body buffer sidecar
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Usage record emission
    #[serde(default)]
    pub emitter: EmitterConfig,

    /// Metrics and access logging
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Inbound listener configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// Address to bind, e.g. "0.0.0.0:8787"
    pub address: String,

    /// Drain window on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_shutdown_timeout() -> u64 {
    30
}

/// Proxying behavior
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Upstream request timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Whether streamed responses are passed through as streams
    #[serde(default = "default_true")]
    pub streaming_enabled: bool,
}

fn default_request_timeout() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            streaming_enabled: true,
        }
    }
}

/// Where the pricing table comes from
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PricingConfig {
    /// Pricing table file (YAML or JSON); the compiled-in table is used
    /// when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Metrics and access logging
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservabilityConfig {
    /// Emit one structured access log line per request
    #[serde(default = "default_true")]
    pub access_log: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { access_log: true }
    }
}
