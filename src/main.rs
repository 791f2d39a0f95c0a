//! Tollgate - LLM Gateway with Cost Accounting

use clap::Parser;
use std::path::PathBuf;
use tollgate::{config, Server, NAME, VERSION};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// LLM gateway: provider routing, protocol translation, usage metering and
/// cost accounting
#[derive(Parser)]
#[command(name = NAME)]
#[command(version = VERSION)]
#[command(about = "LLM gateway with usage metering and cost accounting")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "tollgate.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log format (pretty, json, compact)
    #[arg(long, default_value = "pretty")]
    log_format: String,

    /// Validate the configuration and pricing table, then exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging(&cli.log_level, &cli.log_format);

    let config = match config::load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if cli.validate {
        if let Err(e) = config::load_pricing(&config) {
            eprintln!("Pricing table is invalid: {}", e);
            std::process::exit(1);
        }
        info!("Configuration is valid");
        return;
    }

    let server = match Server::new(config).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Failed to initialize server: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{}={},hyper=warn,reqwest=warn", NAME, level))
    });

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        "compact" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
