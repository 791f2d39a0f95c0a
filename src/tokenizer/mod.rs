//! Token counting on an isolated worker pool
//!
//! Tokenizing a large prompt is CPU-bound; it runs on dedicated worker
//! threads behind a bounded queue so it can never stall the async request
//! path. Each call is an independent unit of work answered over a oneshot
//! channel, and carries a cancellation token tied to the parent request.
//!
//! Counting is deterministic for a fixed tokenizer version: cl100k_base
//! throughout.

use crate::error::{GatewayError, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::mpsc;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Worker pool configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenizerConfig {
    /// Number of dedicated worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bounded depth of the pending-job queue
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_workers() -> usize {
    2
}

fn default_queue_depth() -> usize {
    64
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_depth: default_queue_depth(),
        }
    }
}

struct CountJob {
    text: String,
    cancel: CancellationToken,
    reply: oneshot::Sender<Result<usize>>,
}

/// Handle to the token counting pool. Cheap to clone; holds no per-request
/// state.
#[derive(Clone)]
pub struct TokenCounter {
    tx: mpsc::SyncSender<CountJob>,
}

impl TokenCounter {
    /// Spawn the worker pool.
    ///
    /// Loads the BPE ranks up front so the first request does not pay the
    /// encoder load cost.
    pub fn spawn(config: &TokenizerConfig) -> Self {
        let _ = tiktoken_rs::cl100k_base_singleton();

        let (tx, rx) = mpsc::sync_channel::<CountJob>(config.queue_depth.max(1));
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..config.workers.max(1) {
            let rx = rx.clone();
            std::thread::Builder::new()
                .name(format!("tokenizer-{}", worker))
                .spawn(move || worker_loop(rx))
                .expect("failed to spawn tokenizer worker");
        }

        Self { tx }
    }

    /// Count tokens in `text`.
    ///
    /// Returns an error when the queue is saturated, the job was cancelled,
    /// or the pool is gone. Callers treat any error as "unknown token
    /// count" and flag the request's cost as approximate, never as zero.
    pub async fn count(&self, text: String, cancel: CancellationToken) -> Result<usize> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = CountJob {
            text,
            cancel: cancel.clone(),
            reply: reply_tx,
        };

        // try_send keeps the async path non-blocking: a saturated pool
        // degrades to an unknown count instead of queueing unboundedly
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::TrySendError::Full(_) => {
                GatewayError::TokenCount("tokenizer queue is full".to_string())
            }
            mpsc::TrySendError::Disconnected(_) => {
                GatewayError::TokenCount("tokenizer pool is gone".to_string())
            }
        })?;

        tokio::select! {
            _ = cancel.cancelled() => Err(GatewayError::TokenCount(
                "request cancelled before count completed".to_string(),
            )),
            result = reply_rx => result.unwrap_or_else(|_| {
                Err(GatewayError::TokenCount(
                    "tokenizer worker dropped the job".to_string(),
                ))
            }),
        }
    }
}

fn worker_loop(rx: Arc<Mutex<mpsc::Receiver<CountJob>>>) {
    loop {
        let job = {
            let rx = rx.lock();
            match rx.recv() {
                Ok(job) => job,
                Err(_) => {
                    debug!("tokenizer queue closed, worker exiting");
                    return;
                }
            }
        };

        // Skip work the caller no longer wants
        if job.cancel.is_cancelled() {
            continue;
        }

        let result = count_text(&job.text);
        // A dropped receiver just means the caller gave up
        let _ = job.reply.send(result);
    }
}

fn count_text(text: &str) -> Result<usize> {
    if text.is_empty() {
        return Ok(0);
    }
    let bpe = tiktoken_rs::cl100k_base_singleton();
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        bpe.encode_with_special_tokens(text).len()
    })) {
        Ok(count) => Ok(count),
        Err(_) => {
            warn!("tokenizer panicked on input of {} bytes", text.len());
            Err(GatewayError::TokenCount(
                "tokenizer failed on input".to_string(),
            ))
        }
    }
}
