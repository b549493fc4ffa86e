//! Startup orchestration.
//!
//! Order: metrics exporter, listener, TLS + server, signal handler, serve.
//! Any error before serving is fatal.

use axum::Router;
use thiserror::Error;

use crate::config::ServerConfig;
use crate::http::HttpsServer;
use crate::lifecycle::{signals, Shutdown};
use crate::net::listener::{Listener, ListenerError};
use crate::net::tls::TlsSetupError;
use crate::observability::metrics;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("listener: {0}")]
    Listener(#[from] ListenerError),

    #[error("tls: {0}")]
    Tls(#[from] TlsSetupError),

    #[error("server: {0}")]
    Io(#[from] std::io::Error),
}

/// Bind, serve `app` and block until a shutdown signal has drained the server.
pub async fn run(config: ServerConfig, app: Router) -> Result<(), StartupError> {
    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = Listener::bind(&config.listener).await?;
    let server = HttpsServer::new(config, app)?;

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        signals::shutdown_signal().await;
        shutdown.trigger();
    });

    server.run(listener, server_shutdown).await?;
    Ok(())
}
