//! Usage record emission
//!
//! One record per completed request, delivered asynchronously and
//! best-effort to the analytical store. The response path never waits on
//! delivery: records go into a bounded queue drained by a background
//! dispatcher. Transient sink failures retry a bounded number of times
//! with exponential backoff; on exhaustion the record is dropped and the
//! failure goes to the error reporter. The queue is bounded on purpose —
//! a slow sink sheds records instead of growing memory.

use crate::error::{GatewayError, Result};
use crate::pricing::{CostOutcome, Usage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Emitter configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmitterConfig {
    /// Ingest endpoint of the analytical store; unset disables delivery
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Error-tracking collector endpoint; unset logs instead
    #[serde(default)]
    pub error_endpoint: Option<String>,

    /// Bounded queue depth between request tasks and the dispatcher
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Delivery attempts per record before dropping it
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff between attempts; doubles per retry
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_queue_depth() -> usize {
    1024
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    200
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            error_endpoint: None,
            queue_depth: default_queue_depth(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

/// The per-request observability record
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub provider: String,
    pub model: String,
    #[serde(flatten)]
    pub usage: Usage,
    /// Computed cost in USD
    pub cost: f64,
    /// No pricing rule matched
    pub unpriced: bool,
    /// Token counts were estimated rather than reported upstream
    pub estimated: bool,
    /// Cost or transform failed somewhere along the way
    pub error: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl UsageRecord {
    /// Fold a cost outcome into the record
    pub fn with_cost(mut self, outcome: &CostOutcome) -> Self {
        self.cost = outcome.amount;
        self.unpriced = outcome.unpriced;
        self.error = self.error || outcome.errored;
        self
    }
}

/// Destination for usage records
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn append(&self, record: &UsageRecord) -> Result<()>;
}

/// HTTP append-only sink (the analytical store's ingest route)
pub struct HttpUsageSink {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpUsageSink {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl UsageSink for HttpUsageSink {
    async fn append(&self, record: &UsageRecord) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(record)
            .send()
            .await
            .map_err(|e| GatewayError::Emitter(format!("sink unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(GatewayError::Emitter(format!(
                "sink returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// External error-tracking collaborator
#[async_trait]
pub trait ErrorReporter: Send + Sync {
    async fn report(&self, error: &str, trace: &str);
}

/// Reporter posting `{error, trace}` payloads to a collector
pub struct HttpErrorReporter {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpErrorReporter {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ErrorReporter for HttpErrorReporter {
    async fn report(&self, error: &str, trace: &str) {
        let payload = serde_json::json!({"error": error, "trace": trace});
        if let Err(e) = self.client.post(&self.endpoint).json(&payload).send().await {
            warn!("error report delivery failed: {}", e);
        }
    }
}

/// Reporter that only logs; used when no collector is configured
pub struct LogErrorReporter;

#[async_trait]
impl ErrorReporter for LogErrorReporter {
    async fn report(&self, error: &str, trace: &str) {
        warn!(error, trace, "unrecoverable internal failure");
    }
}

/// Handle for emitting usage records
#[derive(Clone)]
pub struct UsageEmitter {
    tx: mpsc::Sender<UsageRecord>,
}

impl UsageEmitter {
    /// Spawn the background dispatcher and return the emit handle
    pub fn spawn(
        config: EmitterConfig,
        sink: Arc<dyn UsageSink>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let handle = tokio::spawn(dispatch_loop(config, rx, sink, reporter));
        (Self { tx }, handle)
    }

    /// Queue a record for delivery. Never blocks the response path; a full
    /// queue drops the record.
    pub fn emit(&self, record: UsageRecord) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(record)) => {
                warn!(
                    request_id = %record.request_id,
                    "usage queue full, dropping record"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                warn!(
                    request_id = %record.request_id,
                    "usage dispatcher is gone, dropping record"
                );
                false
            }
        }
    }
}

async fn dispatch_loop(
    config: EmitterConfig,
    mut rx: mpsc::Receiver<UsageRecord>,
    sink: Arc<dyn UsageSink>,
    reporter: Arc<dyn ErrorReporter>,
) {
    while let Some(record) = rx.recv().await {
        deliver(&config, &*sink, &*reporter, record).await;
    }
    debug!("usage dispatcher stopped");
}

async fn deliver(
    config: &EmitterConfig,
    sink: &dyn UsageSink,
    reporter: &dyn ErrorReporter,
    record: UsageRecord,
) {
    let mut backoff = Duration::from_millis(config.backoff_ms);
    let attempts = config.max_attempts.max(1);

    for attempt in 1..=attempts {
        match sink.append(&record).await {
            Ok(()) => return,
            Err(e) if attempt < attempts => {
                debug!(
                    request_id = %record.request_id,
                    attempt,
                    "usage delivery failed, retrying: {}", e
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => {
                // Exhausted: report and drop; the record is gone by design
                reporter
                    .report(
                        &format!("usage record delivery failed: {}", e),
                        &format!(
                            "request_id={} provider={} model={}",
                            record.request_id, record.provider, record.model
                        ),
                    )
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn record(id: &str) -> UsageRecord {
        UsageRecord {
            request_id: id.to_string(),
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                calls: 1,
                ..Default::default()
            },
            cost: 0.001,
            unpriced: false,
            estimated: false,
            error: false,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    struct FlakySink {
        failures_before_success: u32,
        attempts: AtomicU32,
        delivered: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl UsageSink for FlakySink {
        async fn append(&self, record: &UsageRecord) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.failures_before_success {
                return Err(GatewayError::Emitter("transient".to_string()));
            }
            self.delivered.lock().push(record.request_id.clone());
            Ok(())
        }
    }

    struct CountingReporter {
        reports: AtomicU32,
    }

    #[async_trait]
    impl ErrorReporter for CountingReporter {
        async fn report(&self, _error: &str, _trace: &str) {
            self.reports.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> EmitterConfig {
        EmitterConfig {
            endpoint: None,
            error_endpoint: None,
            queue_depth: 8,
            max_attempts: 3,
            backoff_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let sink = Arc::new(FlakySink {
            failures_before_success: 2,
            attempts: AtomicU32::new(0),
            delivered: Mutex::new(Vec::new()),
        });
        let reporter = Arc::new(CountingReporter {
            reports: AtomicU32::new(0),
        });

        deliver(&config(), &*sink, &*reporter, record("r1")).await;

        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(sink.delivered.lock().as_slice(), &["r1".to_string()]);
        assert_eq!(reporter.reports.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_and_drops() {
        let sink = Arc::new(FlakySink {
            failures_before_success: u32::MAX,
            attempts: AtomicU32::new(0),
            delivered: Mutex::new(Vec::new()),
        });
        let reporter = Arc::new(CountingReporter {
            reports: AtomicU32::new(0),
        });

        deliver(&config(), &*sink, &*reporter, record("r2")).await;

        // Bounded attempts, one report, record gone
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
        assert!(sink.delivered.lock().is_empty());
        assert_eq!(reporter.reports.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_emit_does_not_block() {
        let sink = Arc::new(FlakySink {
            failures_before_success: 0,
            attempts: AtomicU32::new(0),
            delivered: Mutex::new(Vec::new()),
        });
        let reporter = Arc::new(CountingReporter {
            reports: AtomicU32::new(0),
        });

        let (emitter, handle) = UsageEmitter::spawn(config(), sink.clone(), reporter);
        assert!(emitter.emit(record("r3")));

        // Dropping the emitter closes the queue and stops the dispatcher
        drop(emitter);
        handle.await.unwrap();
        assert_eq!(sink.delivered.lock().as_slice(), &["r3".to_string()]);
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let emitter = UsageEmitter { tx };

        assert!(emitter.emit(record("a")));
        // Queue of one is now full; the next emit sheds
        assert!(!emitter.emit(record("b")));
    }
}
