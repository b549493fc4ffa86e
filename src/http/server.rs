//! HTTPS server.
//!
//! # Responsibilities
//! - Wrap the application router with timeout, body limit, request id and
//!   trace layers
//! - Accept connections and run the TLS handshake
//! - Build one [`ConnectionContext`] per connection and attach it to every
//!   request served on it
//! - Tear the context down when the connection ends, and drain on shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::ServerConfig;
use crate::net::connection::{ConnectionContext, ConnectionGuard, ConnectionTracker};
use crate::net::listener::Listener;
use crate::net::tls::{self, RustlsConnection, TlsSetupError};
use crate::tls::NegotiationSettings;

/// Per-connection settings copied out of the config.
#[derive(Clone, Copy)]
struct ConnectionSettings {
    handshake_timeout: Duration,
    negotiation: NegotiationSettings,
}

/// HTTP/1.1 + HTTP/2 server with optional TLS.
pub struct HttpsServer {
    router: Router,
    config: ServerConfig,
    acceptor: Option<TlsAcceptor>,
    tracker: ConnectionTracker,
}

impl HttpsServer {
    /// Create a server for `app`. Loads TLS material when configured.
    pub fn new(config: ServerConfig, app: Router) -> Result<Self, TlsSetupError> {
        let acceptor = match &config.listener.tls {
            Some(tls_config) => Some(TlsAcceptor::from(tls::build_server_config(tls_config)?)),
            None => None,
        };

        let router = Self::build_router(&config, app);
        Ok(Self {
            router,
            config,
            acceptor,
            tracker: ConnectionTracker::new(),
        })
    }

    /// Wrap the router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &ServerConfig, app: Router) -> Router {
        app.layer(RequestBodyLimitLayer::new(config.limits.max_body_size))
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// Serve connections until `shutdown` fires, then drain.
    pub async fn run(self, listener: Listener, mut shutdown: broadcast::Receiver<()>) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            tls = self.acceptor.is_some(),
            "HTTPS server starting"
        );

        let settings = ConnectionSettings {
            handshake_timeout: Duration::from_secs(self.config.timeouts.handshake_secs),
            negotiation: self.config.negotiation_settings(),
        };

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.recv() => break,
            };

            let (stream, peer_addr, permit) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    continue;
                }
            };

            let guard = self.tracker.track();
            let router = self.router.clone();
            let acceptor = self.acceptor.clone();
            let conn_shutdown = shutdown.resubscribe();

            tokio::spawn(async move {
                let _permit = permit;
                serve_connection(stream, peer_addr, guard, acceptor, router, settings, conn_shutdown).await;
            });
        }

        drop(listener);
        let drain_timeout = Duration::from_secs(self.config.timeouts.shutdown_secs);
        tracing::info!(
            active_connections = self.tracker.active_count(),
            ?drain_timeout,
            "Draining connections"
        );
        if tokio::time::timeout(drain_timeout, self.tracker.wait_for_drain()).await.is_err() {
            tracing::warn!(
                active_connections = self.tracker.active_count(),
                "Drain timed out"
            );
        }

        tracing::info!("HTTPS server stopped");
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    guard: ConnectionGuard,
    acceptor: Option<TlsAcceptor>,
    router: Router,
    settings: ConnectionSettings,
    shutdown: broadcast::Receiver<()>,
) {
    let id = guard.id();
    match acceptor {
        Some(acceptor) => {
            let tls_stream = match tls::handshake(&acceptor, stream, settings.handshake_timeout).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    tracing::warn!(connection_id = %id, peer_addr = %peer_addr, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let handle = RustlsConnection::from_server_connection(tls_stream.get_ref().1);
            tracing::debug!(
                connection_id = %id,
                peer_addr = %peer_addr,
                protocol = ?handle.protocol_version(),
                "TLS handshake complete"
            );

            let ctx = ConnectionContext::with_tls(id, peer_addr, Arc::new(handle), settings.negotiation);
            drive(TokioIo::new(tls_stream), ctx, router, shutdown).await;
        }
        None => {
            let ctx = ConnectionContext::plain(id, peer_addr);
            drive(TokioIo::new(stream), ctx, router, shutdown).await;
        }
    }
    drop(guard);
}

/// Serve HTTP on `io` until the peer leaves, the context is torn down, or
/// shutdown completes a graceful close.
async fn drive<I>(io: I, ctx: ConnectionContext, router: Router, mut shutdown: broadcast::Receiver<()>)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service_ctx = ctx.clone();
    let service = hyper::service::service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(service_ctx.clone());
        router.clone().oneshot(request)
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    let closed = ctx.closed_token().clone();
    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(connection_id = %ctx.id(), error = %e, "Connection ended with error");
                }
                break;
            }
            _ = shutdown.recv(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
            _ = closed.cancelled() => {
                tracing::info!(connection_id = %ctx.id(), "Connection torn down");
                break;
            }
        }
    }

    ctx.close();
}
