//! Connection identity, lifecycle tracking and per-connection context.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count live connections so shutdown can drain them
//! - Carry connection-scoped state (cancellation, I/O gate, TLS feature)
//!   into every request served on the connection

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use tokio::sync::{watch, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;

use crate::observability::metrics;
use crate::tls::{ConnectionHandle, NegotiationCoordinator, NegotiationSettings, TlsConnectionFeature};

/// Global atomic counter for connection IDs.
/// Relaxed ordering is enough; only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Counts live connections and lets shutdown wait for them to drain.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    active: Arc<watch::Sender<u64>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { active: Arc::new(tx) }
    }

    /// Record a new connection. The guard decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.active.send_modify(|n| *n += 1);
        metrics::record_active_connections(*self.active.borrow());
        ConnectionGuard {
            active: Arc::clone(&self.active),
            id: ConnectionId::new(),
        }
    }

    pub fn active_count(&self) -> u64 {
        *self.active.borrow()
    }

    /// Resolve once no connection is tracked.
    pub async fn wait_for_drain(&self) {
        let mut rx = self.active.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifetime token of one tracked connection.
#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<watch::Sender<u64>>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.send_modify(|n| *n = n.saturating_sub(1));
        metrics::record_active_connections(*self.active.borrow());
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

/// Serializes body I/O against renegotiation when the transport requires it.
///
/// Without serialization every acquire resolves immediately to `None`.
#[derive(Debug, Clone, Default)]
pub struct IoGate {
    lock: Option<Arc<RwLock<()>>>,
}

impl IoGate {
    pub fn new(serialize: bool) -> Self {
        Self {
            lock: serialize.then(|| Arc::new(RwLock::new(()))),
        }
    }

    pub fn is_serialized(&self) -> bool {
        self.lock.is_some()
    }

    /// Held by body I/O for the duration of one chunk.
    pub async fn shared(&self) -> Option<RwLockReadGuard<'_, ()>> {
        match &self.lock {
            Some(lock) => Some(lock.read().await),
            None => None,
        }
    }

    /// Held by a renegotiation for its whole duration.
    pub async fn exclusive(&self) -> Option<OwnedRwLockWriteGuard<()>> {
        match &self.lock {
            Some(lock) => Some(Arc::clone(lock).write_owned().await),
            None => None,
        }
    }
}

/// State shared by every request on one connection.
///
/// Inserted into each request's extensions by the server. The capability set
/// is fixed: `tls()` is `Some` exactly when the connection is TLS.
#[derive(Clone)]
pub struct ConnectionContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: ConnectionId,
    peer_addr: SocketAddr,
    closed: CancellationToken,
    gate: IoGate,
    tls: Option<TlsConnectionFeature>,
}

impl ConnectionContext {
    /// Context for a plain-text connection.
    pub fn plain(id: ConnectionId, peer_addr: SocketAddr) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id,
                peer_addr,
                closed: CancellationToken::new(),
                gate: IoGate::default(),
                tls: None,
            }),
        }
    }

    /// Context for a TLS connection backed by `handle`.
    pub fn with_tls(
        id: ConnectionId,
        peer_addr: SocketAddr,
        handle: Arc<dyn ConnectionHandle>,
        settings: NegotiationSettings,
    ) -> Self {
        let closed = CancellationToken::new();
        let gate = IoGate::new(!handle.interleaves_renegotiation());
        let coordinator = NegotiationCoordinator::new(id, handle, settings, closed.clone(), gate.clone());

        Self {
            inner: Arc::new(ContextInner {
                id,
                peer_addr,
                closed,
                gate,
                tls: Some(TlsConnectionFeature::new(Arc::new(coordinator))),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// The TLS capability, if this connection has one.
    pub fn tls(&self) -> Option<&TlsConnectionFeature> {
        self.inner.tls.as_ref()
    }

    /// Cancelled when the connection is torn down.
    pub fn closed_token(&self) -> &CancellationToken {
        &self.inner.closed
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    pub fn gate(&self) -> &IoGate {
        &self.inner.gate
    }

    /// A token for one request: fires on connection teardown or when the
    /// request cancels it itself.
    pub fn request_token(&self) -> CancellationToken {
        self.inner.closed.child_token()
    }

    /// Tear the connection down. Idempotent.
    pub fn close(&self) {
        match &self.inner.tls {
            Some(tls) => tls.coordinator().teardown(),
            None => self.inner.closed.cancel(),
        }
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("tls", &self.inner.tls)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<S> FromRequestParts<S> for ConnectionContext
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<ConnectionContext>()
            .cloned()
            .ok_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}
