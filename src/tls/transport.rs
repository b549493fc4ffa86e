//! Contract consumed from the TLS transport.
//!
//! One [`ConnectionHandle`] per accepted connection. The rustls adapter lives
//! in [`crate::net::tls`]; tests substitute scripted handles.

use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::tls::certificate::ClientCertificate;
use crate::tls::error::TransportError;

/// Result of a renegotiation: a certificate, or `None` when the peer
/// explicitly sent none.
pub type RenegotiationResult = Result<Option<ClientCertificate>, TransportError>;

/// An accepted, encrypted transport connection.
pub trait ConnectionHandle: Send + Sync + 'static {
    /// Whether the connection is TLS at all.
    fn is_tls(&self) -> bool;

    /// Certificate already negotiated. Never performs I/O.
    fn current_certificate(&self) -> Option<ClientCertificate>;

    /// Ask the peer for a certificate. The returned future is driven to
    /// completion on its own task, independent of any single caller.
    fn renegotiate(&self, timeout: Duration) -> BoxFuture<'static, RenegotiationResult>;

    /// Whether application data may flow while a renegotiation is in flight.
    /// When `false`, body I/O on the connection is paused for its duration.
    fn interleaves_renegotiation(&self) -> bool {
        true
    }
}
