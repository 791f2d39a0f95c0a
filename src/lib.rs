//! Tollgate - LLM Gateway with Cost Accounting
//!
//! A reverse proxy between API clients and heterogeneous LLM providers:
//!
//! - **Provider resolution**: host patterns or explicit override headers
//! - **Protocol translation**: OpenAI chat, Anthropic Messages and Google
//!   generateContent, each bidirectional and streaming-aware
//! - **Metering**: token counting on an isolated worker pool, with
//!   upstream-reported usage preferred when present
//! - **Cost accounting**: a versioned pricing-rule table, loaded once per
//!   process, with a never-throws cost engine
//! - **Body buffering**: an idle-timeout-managed sidecar absorbs oversized
//!   request bodies
//! - **Usage emission**: best-effort async delivery to an analytical store
//!
//! # Quick Start
//!
//! ```no_run
//! use tollgate::{config, Server};
//!
//! #[tokio::main]
//! async fn main() -> tollgate::Result<()> {
//!     let config = config::load_config("tollgate.yaml")?;
//!     let server = Server::new(config).await?;
//!     server.run().await
//! }
//! ```
//!
//! # Configuration
//!
//! ```yaml
//! listener:
//!   address: "0.0.0.0:8787"
//!
//! emitter:
//!   endpoint: "http://analytics.internal:8123/ingest"
//!
//! buffer:
//!   enabled: true
//!   command: ["tollgate-bufferd", "--port", "9444"]
//! ```

pub mod buffer;
pub mod canonical;
pub mod config;
pub mod emitter;
pub mod error;
pub mod observability;
pub mod pricing;
pub mod protocol;
pub mod provider;
pub mod server;
pub mod tokenizer;

pub use config::Config;
pub use error::{GatewayError, Result};
pub use server::Server;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
