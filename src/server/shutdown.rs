//! Graceful shutdown with connection draining
//!
//! Tracks active connections, waits for in-flight requests to complete,
//! and forces shutdown after a timeout.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

/// Connection draining coordinator
#[derive(Clone)]
pub struct DrainHandle {
    inner: Arc<DrainState>,
}

struct DrainState {
    draining: AtomicBool,
    active_connections: AtomicUsize,
    drained: Notify,
    shutdown_tx: broadcast::Sender<()>,
}

impl DrainHandle {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(DrainState {
                draining: AtomicBool::new(false),
                active_connections: AtomicUsize::new(0),
                drained: Notify::new(),
                shutdown_tx,
            }),
        }
    }

    /// Get a guard tracking one connection; None while draining
    pub fn connection_guard(&self) -> Option<ConnectionGuard> {
        if self.inner.draining.load(Ordering::SeqCst) {
            return None;
        }
        self.inner.active_connections.fetch_add(1, Ordering::SeqCst);
        Some(ConnectionGuard {
            state: self.inner.clone(),
        })
    }

    pub fn active_connections(&self) -> usize {
        self.inner.active_connections.load(Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    /// Subscribe to the stop-accepting signal
    pub fn shutdown_rx(&self) -> broadcast::Receiver<()> {
        self.inner.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown. Returns true if all connections drained
    /// before the timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        info!("Initiating graceful shutdown with connection draining");

        self.inner.draining.store(true, Ordering::SeqCst);
        let _ = self.inner.shutdown_tx.send(());

        let active = self.inner.active_connections.load(Ordering::SeqCst);
        info!("Waiting for {} active connection(s) to drain", active);

        match tokio::time::timeout(timeout, self.wait_for_drain()).await {
            Ok(()) => true,
            Err(_) => {
                let remaining = self.inner.active_connections.load(Ordering::SeqCst);
                warn!(
                    "Drain timeout exceeded, forcing shutdown with {} connection(s) remaining",
                    remaining
                );
                false
            }
        }
    }

    async fn wait_for_drain(&self) {
        loop {
            if self.inner.active_connections.load(Ordering::SeqCst) == 0 {
                return;
            }
            tokio::select! {
                _ = self.inner.drained.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    }
}

impl Default for DrainHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard tracking an active connection; decrements the count when dropped
pub struct ConnectionGuard {
    state: Arc<DrainState>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.state.active_connections.fetch_sub(1, Ordering::SeqCst);
        debug!("Connection closed, {} remaining", prev - 1);
        if prev == 1 {
            self.state.drained.notify_waiters();
        }
    }
}

/// Shutdown coordinator for the server
pub struct ShutdownCoordinator {
    drain_handle: DrainHandle,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            drain_handle: DrainHandle::new(),
            shutdown_timeout,
        }
    }

    pub fn drain_handle(&self) -> &DrainHandle {
        &self.drain_handle
    }

    pub async fn shutdown(&self) -> bool {
        self.drain_handle.drain(self.shutdown_timeout).await
    }
}
