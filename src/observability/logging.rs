//! Access logging

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// One access log entry, emitted per proxied request
#[derive(Debug, Clone, Serialize)]
pub struct AccessLogEntry {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_duration_ms: Option<u64>,
    pub streamed: bool,
    pub buffered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AccessLogEntry {
    pub fn new(request_id: String, client_ip: String) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id,
            client_ip,
            method: String::new(),
            path: String::new(),
            status: 0,
            duration_ms: 0,
            provider: None,
            model: None,
            upstream_duration_ms: None,
            streamed: false,
            buffered: false,
            error: None,
        }
    }
}

/// Access logger emitting structured tracing events
pub struct AccessLogger {
    enabled: bool,
}

impl AccessLogger {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn log(&self, entry: &AccessLogEntry) {
        if !self.enabled {
            return;
        }

        tracing::info!(
            request_id = %entry.request_id,
            client_ip = %entry.client_ip,
            method = %entry.method,
            path = %entry.path,
            status = entry.status,
            duration_ms = entry.duration_ms,
            provider = ?entry.provider,
            model = ?entry.model,
            upstream_duration_ms = ?entry.upstream_duration_ms,
            streamed = entry.streamed,
            buffered = entry.buffered,
            error = ?entry.error,
            "request completed"
        );
    }
}

/// Builder for access log entries
#[derive(Clone)]
pub struct AccessLogBuilder {
    entry: AccessLogEntry,
    start_time: std::time::Instant,
}

impl AccessLogBuilder {
    pub fn new(request_id: String, client_ip: String) -> Self {
        Self {
            entry: AccessLogEntry::new(request_id, client_ip),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn request(mut self, method: &str, path: &str) -> Self {
        self.entry.method = method.to_string();
        self.entry.path = path.to_string();
        self
    }

    pub fn provider(mut self, provider: &str, model: &str) -> Self {
        self.entry.provider = Some(provider.to_string());
        self.entry.model = Some(model.to_string());
        self
    }

    pub fn response(mut self, status: u16) -> Self {
        self.entry.status = status;
        self
    }

    pub fn upstream_duration(mut self, duration: Duration) -> Self {
        self.entry.upstream_duration_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn streamed(mut self, streamed: bool) -> Self {
        self.entry.streamed = streamed;
        self
    }

    pub fn buffered(mut self, buffered: bool) -> Self {
        self.entry.buffered = buffered;
        self
    }

    pub fn error(mut self, error: Option<&str>) -> Self {
        self.entry.error = error.map(String::from);
        self
    }

    pub fn build(mut self) -> AccessLogEntry {
        self.entry.duration_ms = self.start_time.elapsed().as_millis() as u64;
        self.entry
    }
}
