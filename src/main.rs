//! HTTPS listener (v1)
//!
//! # Architecture Overview
//!
//! ```text
//!                     ┌──────────────────────────────────────────────────────────┐
//!                     │                     HTTPS LISTENER                        │
//!                     │                                                           │
//!   Client ───────────┼─▶ net::listener ─▶ net::tls ─▶ http::server ─▶ handler   │
//!                     │     (bounded)      (rustls)     (hyper auto)      │       │
//!                     │                                                   ▼       │
//!                     │            ConnectionContext ◀──── TlsConnectionFeature   │
//!                     │                    │                        │             │
//!                     │                    ▼                        ▼             │
//!                     │           CertificateCache ◀──── NegotiationCoordinator   │
//!                     │                                             │             │
//!                     │                                             ▼             │
//!                     │                                    ConnectionHandle       │
//!                     └──────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use https_listener::config::loader::load_config;
use https_listener::config::ServerConfig;
use https_listener::http::{demo_router, DemoState};
use https_listener::lifecycle::startup;
use https_listener::observability::logging;

#[derive(Parser)]
#[command(name = "https-listener")]
#[command(about = "HTTPS listener with on-demand client certificates", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override listener.bind_address.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }

    logging::init(&config.observability.log_level);
    tracing::info!("https-listener v0.1.0 starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        tls = config.listener.tls.is_some(),
        client_certificate = ?config.negotiation_settings().mode,
        "Configuration loaded"
    );

    let app = demo_router(DemoState {
        body_channel_capacity: config.limits.body_channel_capacity,
    });
    startup::run(config, app).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
