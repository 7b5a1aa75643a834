//! tus CORS gateway
//!
//! # Architecture Overview
//!
//! ```text
//!   Browser                ┌──────────────────────────────────────────┐
//!   ───────────────────────┼─▶ request id ─▶ trace ─▶ CORS ─▶ timeout  │
//!                          │                          │                │
//!                          │              OPTIONS ◀───┘ 204            │
//!                          │                          │                │
//!                          │              /healthz ◀──┤                │
//!                          │                          ▼                │
//!                          │                   upstream forwarder ─────┼──▶ tus server
//!                          └──────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use tus_cors_gateway::config::{load_config, validate_config, ConfigError, GatewayConfig};
use tus_cors_gateway::lifecycle::{wait_for_signal, Shutdown};
use tus_cors_gateway::observability::{logging, metrics};
use tus_cors_gateway::GatewayServer;

#[derive(Parser)]
#[command(name = "tus-cors-gateway")]
#[command(about = "CORS gateway in front of a tus upload server", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,

    /// Override `upstream.base_url`.
    #[arg(short, long)]
    upstream: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }
    if let Some(upstream) = cli.upstream {
        config.upstream.base_url = upstream;
    }
    validate_config(&config).map_err(ConfigError::Validation)?;

    logging::init(&config.observability.log_level);
    tracing::info!("tus-cors-gateway v{} starting", env!("CARGO_PKG_VERSION"));

    tracing::info!(
        bind_address = %config.listener.bind_address,
        upstream = %config.upstream.base_url,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        // Address already validated.
        let addr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr)?;
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let server = GatewayServer::new(config)?;

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => shutdown.trigger(),
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signals"),
        }
    });

    server.run(listener, server_shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
