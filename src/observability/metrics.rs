//! Prometheus metrics

use crate::error::{GatewayError, Result};
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metrics collector for the gateway
pub struct Metrics {
    registry: Registry,

    /// Requests by provider, model and status
    pub requests_total: IntCounterVec,
    /// Request duration by provider
    pub request_duration_seconds: HistogramVec,
    /// Token throughput by provider and direction
    pub tokens_total: IntCounterVec,
    /// Accumulated cost by provider, USD
    pub cost_usd_total: CounterVec,
    /// Requests that matched no pricing rule
    pub unpriced_requests_total: IntCounterVec,
    /// Requests whose token counts were estimated, not reported upstream
    pub estimated_usage_total: IntCounterVec,
    /// Errors by kind
    pub errors_total: IntCounterVec,
    /// Stream chunks passed through untransformed
    pub stream_passthrough_total: IntCounter,
    /// Bodies routed through the buffer sidecar
    pub buffered_bodies_total: IntCounter,
    /// Usage records dropped before delivery
    pub usage_records_dropped_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("tollgate_requests_total", "Total proxied requests"),
            &["provider", "model", "status"],
        )
        .map_err(|e| GatewayError::Internal(format!("Failed to create metric: {}", e)))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "tollgate_request_duration_seconds",
                "Request duration in seconds",
            )
            .buckets(vec![
                0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
            ]),
            &["provider"],
        )
        .map_err(|e| GatewayError::Internal(format!("Failed to create metric: {}", e)))?;

        let tokens_total = IntCounterVec::new(
            Opts::new("tollgate_tokens_total", "Metered tokens"),
            &["provider", "direction"],
        )
        .map_err(|e| GatewayError::Internal(format!("Failed to create metric: {}", e)))?;

        let cost_usd_total = CounterVec::new(
            Opts::new("tollgate_cost_usd_total", "Accumulated request cost in USD"),
            &["provider"],
        )
        .map_err(|e| GatewayError::Internal(format!("Failed to create metric: {}", e)))?;

        let unpriced_requests_total = IntCounterVec::new(
            Opts::new(
                "tollgate_unpriced_requests_total",
                "Requests with no matching pricing rule",
            ),
            &["provider", "model"],
        )
        .map_err(|e| GatewayError::Internal(format!("Failed to create metric: {}", e)))?;

        let estimated_usage_total = IntCounterVec::new(
            Opts::new(
                "tollgate_estimated_usage_total",
                "Requests whose token counts were estimated",
            ),
            &["provider"],
        )
        .map_err(|e| GatewayError::Internal(format!("Failed to create metric: {}", e)))?;

        let errors_total = IntCounterVec::new(
            Opts::new("tollgate_errors_total", "Errors by kind"),
            &["kind"],
        )
        .map_err(|e| GatewayError::Internal(format!("Failed to create metric: {}", e)))?;

        let stream_passthrough_total = IntCounter::new(
            "tollgate_stream_passthrough_total",
            "Stream chunks forwarded without transformation",
        )
        .map_err(|e| GatewayError::Internal(format!("Failed to create metric: {}", e)))?;

        let buffered_bodies_total = IntCounter::new(
            "tollgate_buffered_bodies_total",
            "Request bodies routed through the buffer sidecar",
        )
        .map_err(|e| GatewayError::Internal(format!("Failed to create metric: {}", e)))?;

        let usage_records_dropped_total = IntCounter::new(
            "tollgate_usage_records_dropped_total",
            "Usage records dropped before delivery",
        )
        .map_err(|e| GatewayError::Internal(format!("Failed to create metric: {}", e)))?;

        for collector in [
            Box::new(requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(request_duration_seconds.clone()),
            Box::new(tokens_total.clone()),
            Box::new(cost_usd_total.clone()),
            Box::new(unpriced_requests_total.clone()),
            Box::new(estimated_usage_total.clone()),
            Box::new(errors_total.clone()),
            Box::new(stream_passthrough_total.clone()),
            Box::new(buffered_bodies_total.clone()),
            Box::new(usage_records_dropped_total.clone()),
        ] {
            registry
                .register(collector)
                .map_err(|e| GatewayError::Internal(e.to_string()))?;
        }

        Ok(Self {
            registry,
            requests_total,
            request_duration_seconds,
            tokens_total,
            cost_usd_total,
            unpriced_requests_total,
            estimated_usage_total,
            errors_total,
            stream_passthrough_total,
            buffered_bodies_total,
            usage_records_dropped_total,
        })
    }

    /// Record a completed request
    pub fn record_request(&self, provider: &str, model: &str, status: u16, duration: Duration) {
        self.requests_total
            .with_label_values(&[provider, model, &status.to_string()])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[provider])
            .observe(duration.as_secs_f64());
    }

    /// Record metered usage for a request
    pub fn record_usage(
        &self,
        provider: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
        cost: f64,
    ) {
        self.tokens_total
            .with_label_values(&[provider, "prompt"])
            .inc_by(prompt_tokens);
        self.tokens_total
            .with_label_values(&[provider, "completion"])
            .inc_by(completion_tokens);
        if cost > 0.0 {
            self.cost_usd_total
                .with_label_values(&[provider])
                .inc_by(cost);
        }
    }

    /// Record an error by kind
    pub fn record_error(&self, kind: &str) {
        self.errors_total.with_label_values(&[kind]).inc();
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> Result<String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| GatewayError::Internal(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| GatewayError::Internal(format!("Invalid metrics encoding: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_record_and_export() {
        let metrics = Metrics::new().unwrap();

        metrics.record_request("openai", "gpt-4o", 200, Duration::from_millis(420));
        metrics.record_usage("openai", 1000, 500, 0.0125);
        metrics.record_error("upstream");
        metrics.stream_passthrough_total.inc();

        let exported = metrics.export().unwrap();
        assert!(exported.contains("tollgate_requests_total"));
        assert!(exported.contains("tollgate_cost_usd_total"));
        assert!(exported.contains("tollgate_stream_passthrough_total 1"));
    }
}
