//! Server: listener, per-connection dispatch, graceful shutdown
//!
//! hyper serves the inbound side; upstream calls go through a shared
//! reqwest client. Each connection is tracked by a drain guard so shutdown
//! can wait for in-flight requests.

mod handler;
mod shutdown;

pub use handler::*;
pub use shutdown::*;

use crate::buffer::BodyBuffer;
use crate::config::{load_pricing, Config};
use crate::emitter::{
    ErrorReporter, HttpErrorReporter, HttpUsageSink, LogErrorReporter, UsageEmitter, UsageRecord,
    UsageSink,
};
use crate::error::{GatewayError, Result};
use crate::observability::Observability;
use crate::pricing::CostEngine;
use crate::provider::ProviderRegistry;
use crate::tokenizer::TokenCounter;
use async_trait::async_trait;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, error, info, warn};

/// Sink used when no analytical store is configured; records surface in
/// the structured log instead of disappearing
struct LogUsageSink;

#[async_trait]
impl UsageSink for LogUsageSink {
    async fn append(&self, record: &UsageRecord) -> Result<()> {
        info!(
            request_id = %record.request_id,
            provider = %record.provider,
            model = %record.model,
            prompt_tokens = record.usage.prompt_tokens,
            completion_tokens = record.usage.completion_tokens,
            cost = record.cost,
            unpriced = record.unpriced,
            estimated = record.estimated,
            error = record.error,
            "usage record"
        );
        Ok(())
    }
}

/// The main gateway server
pub struct Server {
    address: SocketAddr,
    context: Arc<GatewayContext>,
    shutdown: ShutdownCoordinator,
}

impl Server {
    /// Build all components from configuration
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing tollgate v{}", crate::VERSION);

        let address = config
            .listener
            .address
            .parse::<SocketAddr>()
            .map_err(|e| GatewayError::Config(format!("invalid listener address: {}", e)))?;

        let registry = ProviderRegistry::builtin()?;
        info!("Registered {} provider(s)", registry.providers().len());

        let pricing = Arc::new(load_pricing(&config)?);
        let cost = CostEngine::new(pricing);

        let tokens = TokenCounter::spawn(&config.tokenizer);
        info!(
            workers = config.tokenizer.workers,
            "Token counter pool ready"
        );

        let buffer = BodyBuffer::new(config.buffer.clone());

        let sink: Arc<dyn UsageSink> = match &config.emitter.endpoint {
            Some(endpoint) => Arc::new(HttpUsageSink::new(endpoint.clone())),
            None => Arc::new(LogUsageSink),
        };
        let reporter: Arc<dyn ErrorReporter> = match &config.emitter.error_endpoint {
            Some(endpoint) => Arc::new(HttpErrorReporter::new(endpoint.clone())),
            None => Arc::new(LogErrorReporter),
        };
        let (emitter, _dispatcher) = UsageEmitter::spawn(config.emitter.clone(), sink, reporter);

        let observability = Arc::new(Observability::new(&config.observability)?);

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::Internal(format!("failed to build HTTP client: {}", e)))?;

        let shutdown = ShutdownCoordinator::new(Duration::from_secs(
            config.listener.shutdown_timeout_secs,
        ));

        let context = Arc::new(GatewayContext {
            registry,
            cost,
            tokens,
            buffer,
            emitter,
            observability,
            http,
            proxy: config.proxy.clone(),
        });

        Ok(Self {
            address,
            context,
            shutdown,
        })
    }

    /// Run until SIGINT/SIGTERM, then drain
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.address).await?;
        info!("Listening on {}", self.address);

        let mut shutdown_rx = self.shutdown.drain_handle().shutdown_rx();
        let drain = self.shutdown.drain_handle().clone();
        let context = self.context.clone();

        let accept_loop = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                error!("accept failed: {}", e);
                                continue;
                            }
                        };

                        let guard = match drain.connection_guard() {
                            Some(guard) => guard,
                            None => {
                                debug!("rejecting connection from {} while draining", peer);
                                continue;
                            }
                        };

                        let context = context.clone();
                        tokio::spawn(async move {
                            let _guard = guard;
                            serve_connection(stream, peer, context).await;
                        });
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Listener stopping accept loop");
                        break;
                    }
                }
            }
        });

        wait_for_shutdown().await;

        info!("Shutting down...");
        let drained = self.shutdown.shutdown().await;
        let _ = accept_loop.await;

        if drained {
            info!("All connections drained gracefully");
        } else {
            warn!("Some connections were forcefully closed");
        }

        info!("tollgate stopped");
        Ok(())
    }

    /// Shared context, for tests
    pub fn context(&self) -> Arc<GatewayContext> {
        self.context.clone()
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    context: Arc<GatewayContext>,
) {
    let io = TokioIo::new(stream);
    let client_ip = peer.ip().to_string();

    let service = service_fn(move |req| {
        handle_request(req, client_ip.clone(), context.clone())
    });

    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
        if !e.is_incomplete_message() {
            debug!("connection error from {}: {}", peer, e);
        }
    }
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received terminate signal");
        }
    }
}
