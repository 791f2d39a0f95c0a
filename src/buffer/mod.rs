//! Body buffer sidecar lifecycle
//!
//! Oversized or slow request bodies are handed to a sidecar process on a
//! fixed localhost port instead of being held in the gateway's own memory.
//! The sidecar is a shared resource with a lifecycle independent of any
//! single request: spun up lazily on the first oversized body, stopped
//! after a configurable idle window, restarted lazily after a crash.
//!
//! State transitions run behind a single-flight guard so concurrent
//! oversized requests cannot spawn duplicate instances. The state lock is
//! only ever held to read or swap the state word, never across process or
//! network I/O.

use crate::error::{GatewayError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Sidecar configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BufferConfig {
    /// Whether body buffering is enabled at all
    #[serde(default)]
    pub enabled: bool,

    /// Command line that starts the sidecar process
    #[serde(default)]
    pub command: Vec<String>,

    /// Fixed internal port the sidecar listens on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bodies larger than this (or of unknown length) are buffered
    #[serde(default = "default_threshold")]
    pub threshold_bytes: u64,

    /// Idle window after which the sidecar is stopped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// How long to wait for the sidecar to accept connections
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
}

fn default_port() -> u16 {
    9444
}

fn default_threshold() -> u64 {
    2 * 1024 * 1024
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_startup_timeout() -> u64 {
    10
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: Vec::new(),
            port: default_port(),
            threshold_bytes: default_threshold(),
            idle_timeout_secs: default_idle_timeout(),
            startup_timeout_secs: default_startup_timeout(),
        }
    }
}

/// Observable lifecycle phase, for tests and introspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidecarPhase {
    Idle,
    Starting,
    Active,
}

enum SidecarState {
    Idle,
    /// A start is in flight; waiters subscribe to its outcome
    Starting(watch::Receiver<Option<bool>>),
    Active(Child),
}

struct BufferInner {
    config: BufferConfig,
    state: Mutex<SidecarState>,
    /// Milliseconds since `epoch` of the last buffering activity
    last_activity: AtomicU64,
    epoch: Instant,
    restarts: AtomicU64,
    client: reqwest::Client,
}

/// Handle to the body buffer sidecar
#[derive(Clone)]
pub struct BodyBuffer {
    inner: Arc<BufferInner>,
}

impl BodyBuffer {
    /// Create the handle and start the idle watchdog
    pub fn new(config: BufferConfig) -> Self {
        let inner = Arc::new(BufferInner {
            config,
            state: Mutex::new(SidecarState::Idle),
            last_activity: AtomicU64::new(0),
            epoch: Instant::now(),
            restarts: AtomicU64::new(0),
            client: reqwest::Client::new(),
        });

        if inner.config.enabled {
            let weak = Arc::downgrade(&inner);
            tokio::spawn(async move {
                let interval = Duration::from_secs(5);
                loop {
                    tokio::time::sleep(interval).await;
                    let inner = match weak.upgrade() {
                        Some(inner) => inner,
                        None => return,
                    };
                    reap_if_idle(&inner);
                }
            });
        }

        Self { inner }
    }

    /// Whether a body of the given (possibly unknown) length should be
    /// routed through the sidecar
    pub fn should_buffer(&self, content_length: Option<u64>) -> bool {
        if !self.inner.config.enabled {
            return false;
        }
        match content_length {
            Some(length) => length > self.inner.config.threshold_bytes,
            // Unknown length means chunked transfer; assume oversized
            None => true,
        }
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> SidecarPhase {
        match &*self.inner.state.lock() {
            SidecarState::Idle => SidecarPhase::Idle,
            SidecarState::Starting(_) => SidecarPhase::Starting,
            SidecarState::Active(_) => SidecarPhase::Active,
        }
    }

    /// Times the sidecar has been (re)started
    pub fn restarts(&self) -> u64 {
        self.inner.restarts.load(Ordering::Relaxed)
    }

    /// Stream a request body into the sidecar, returning the buffer id.
    ///
    /// Body transfer happens against the sidecar, decoupled from the
    /// gateway's own memory budget; the upstream call later pulls the body
    /// back with [`BodyBuffer::retrieve`].
    pub async fn stash<S>(&self, body: S) -> Result<String>
    where
        S: futures::TryStream + Send + 'static,
        S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
        Bytes: From<S::Ok>,
    {
        self.ensure_running().await?;
        self.touch();

        let id = uuid::Uuid::new_v4().simple().to_string();
        let url = format!("{}/buffers/{}", self.base_url(), id);

        let response = self
            .inner
            .client
            .put(&url)
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(|e| self.fail(format!("failed to stash body: {}", e)))?;

        if !response.status().is_success() {
            return Err(self.fail(format!(
                "sidecar rejected body with status {}",
                response.status()
            )));
        }

        self.touch();
        Ok(id)
    }

    /// Pull a buffered body back as a byte stream for the upstream call
    pub async fn retrieve(
        &self,
        id: &str,
    ) -> Result<impl futures::Stream<Item = reqwest::Result<Bytes>>> {
        self.touch();
        let url = format!("{}/buffers/{}", self.base_url(), id);

        let response = self
            .inner
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.fail(format!("failed to retrieve body: {}", e)))?;

        if !response.status().is_success() {
            return Err(self.fail(format!(
                "sidecar returned status {} for buffer {}",
                response.status(),
                id
            )));
        }

        self.touch();
        Ok(response.bytes_stream())
    }

    /// Drop a buffered body once the request is finished with it
    pub async fn release(&self, id: &str) {
        let url = format!("{}/buffers/{}", self.base_url(), id);
        if let Err(e) = self.inner.client.delete(&url).send().await {
            debug!("failed to release buffer {}: {}", id, e);
        }
    }

    fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.inner.config.port)
    }

    fn touch(&self) {
        let millis = self.inner.epoch.elapsed().as_millis() as u64;
        self.inner.last_activity.store(millis, Ordering::Relaxed);
    }

    /// Record a sidecar failure: kill the instance (if any) so the next
    /// oversized request restarts it lazily, and surface a retryable error.
    fn fail(&self, message: String) -> GatewayError {
        warn!("{}", message);
        let mut state = self.inner.state.lock();
        if let SidecarState::Active(child) = &mut *state {
            let _ = child.start_kill();
            *state = SidecarState::Idle;
        }
        GatewayError::BufferSidecar(message)
    }

    /// Bring the sidecar to Active, starting it if necessary.
    ///
    /// Single-flight: exactly one caller performs the start; the rest wait
    /// on the outcome. The state lock is released before any awaiting.
    async fn ensure_running(&self) -> Result<()> {
        enum Action {
            Ready,
            Wait(watch::Receiver<Option<bool>>),
            Start(watch::Sender<Option<bool>>),
        }

        let action = {
            let mut state = self.inner.state.lock();
            match &*state {
                SidecarState::Active(_) => Action::Ready,
                SidecarState::Starting(rx) => Action::Wait(rx.clone()),
                SidecarState::Idle => {
                    let (tx, rx) = watch::channel(None);
                    *state = SidecarState::Starting(rx);
                    Action::Start(tx)
                }
            }
        };

        match action {
            Action::Ready => Ok(()),
            Action::Start(tx) => self.perform_start(tx).await,
            Action::Wait(mut rx) => {
                // Either the starter resolves the watch or drops it
                let started = rx
                    .wait_for(|outcome| outcome.is_some())
                    .await
                    .map(|value| matches!(*value, Some(true)))
                    .unwrap_or(false);
                if started {
                    Ok(())
                } else {
                    Err(GatewayError::BufferSidecar(
                        "sidecar failed to start".to_string(),
                    ))
                }
            }
        }
    }

    async fn perform_start(&self, tx: watch::Sender<Option<bool>>) -> Result<()> {
        match self.start_process().await {
            Ok(child) => {
                info!(
                    port = self.inner.config.port,
                    "buffer sidecar is up"
                );
                self.inner.restarts.fetch_add(1, Ordering::Relaxed);
                self.touch();
                *self.inner.state.lock() = SidecarState::Active(child);
                let _ = tx.send(Some(true));
                Ok(())
            }
            Err(e) => {
                *self.inner.state.lock() = SidecarState::Idle;
                let _ = tx.send(Some(false));
                Err(e)
            }
        }
    }

    async fn start_process(&self) -> Result<Child> {
        let command = self.inner.config.command.as_slice();
        if command.is_empty() {
            return Err(GatewayError::BufferSidecar(
                "no sidecar command configured".to_string(),
            ));
        }

        debug!(command = ?command, "starting buffer sidecar");
        let mut child = Command::new(&command[0])
            .args(&command[1..])
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GatewayError::BufferSidecar(format!("failed to spawn sidecar: {}", e))
            })?;

        // Probe the fixed port until the sidecar accepts connections
        let deadline =
            Instant::now() + Duration::from_secs(self.inner.config.startup_timeout_secs);
        let address = format!("127.0.0.1:{}", self.inner.config.port);

        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(GatewayError::BufferSidecar(format!(
                    "sidecar exited during startup with {}",
                    status
                )));
            }
            match tokio::net::TcpStream::connect(&address).await {
                Ok(_) => return Ok(child),
                Err(_) if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => {
                    let _ = child.start_kill();
                    return Err(GatewayError::BufferSidecar(format!(
                        "sidecar did not come up within {}s: {}",
                        self.inner.config.startup_timeout_secs, e
                    )));
                }
            }
        }
    }
}

fn reap_if_idle(inner: &Arc<BufferInner>) {
    let idle_for = {
        let millis = inner.epoch.elapsed().as_millis() as u64;
        millis.saturating_sub(inner.last_activity.load(Ordering::Relaxed))
    };
    if idle_for < inner.config.idle_timeout_secs * 1000 {
        return;
    }

    let mut state = inner.state.lock();
    if let SidecarState::Active(child) = &mut *state {
        info!(
            idle_secs = idle_for / 1000,
            "stopping idle buffer sidecar"
        );
        let _ = child.start_kill();
        *state = SidecarState::Idle;
    }
}
