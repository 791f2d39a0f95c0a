//! Observability: Prometheus metrics and structured access logging

mod logging;
mod metrics;

pub use logging::*;
pub use metrics::*;

use crate::config::ObservabilityConfig;
use crate::error::Result;
use std::sync::Arc;

/// Observability context shared across request tasks
pub struct Observability {
    /// Metrics registry
    pub metrics: Arc<Metrics>,
    /// Access logger
    pub access_logger: Arc<AccessLogger>,
}

impl Observability {
    /// Create observability from configuration
    pub fn new(config: &ObservabilityConfig) -> Result<Self> {
        Ok(Self {
            metrics: Arc::new(Metrics::new()?),
            access_logger: Arc::new(AccessLogger::new(config.access_log)),
        })
    }
}
