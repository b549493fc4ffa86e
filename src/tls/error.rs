//! Error taxonomy for client certificate negotiation.
//!
//! "No certificate" is never an error here. It is a normal
//! [`NegotiationOutcome`](crate::tls::NegotiationOutcome); only things that
//! went wrong (or a declined certificate under mutual TLS) land in
//! [`NegotiationError`].

use std::time::Duration;
use thiserror::Error;

/// Failures reported by the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The TLS handshake or renegotiation was rejected at protocol level.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The peer reset the connection.
    #[error("connection reset by peer")]
    PeerReset,

    /// Renegotiation did not complete in time.
    #[error("renegotiation timed out after {0:?}")]
    Timeout(Duration),

    /// The peer sent something that is not a parseable X.509 certificate.
    #[error("malformed client certificate: {0}")]
    MalformedCertificate(String),

    /// The negotiation task ended without reporting a result.
    #[error("negotiation abandoned before completion")]
    Abandoned,

    /// The connection can no longer carry a negotiation.
    #[error("connection unusable: {0}")]
    Unusable(String),
}

impl TransportError {
    /// Fatal errors are cached permanently; everything else may be retried
    /// by an explicit new request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Unusable(_))
    }
}

/// Errors surfaced to handlers awaiting a client certificate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    /// The peer presented no certificate and the listener requires one.
    #[error("peer declined to present a required client certificate")]
    PeerDeclined,

    /// Handshake-level failure (protocol error, timeout, peer reset).
    #[error("client certificate negotiation failed: {0}")]
    NegotiationFailed(#[from] TransportError),

    /// The connection was torn down while the negotiation was pending.
    #[error("connection closed during client certificate negotiation")]
    ConnectionClosed,

    /// The caller's own cancellation signal fired.
    #[error("client certificate negotiation cancelled")]
    Cancelled,
}

impl NegotiationError {
    /// Whether a cached failure must stop any further negotiation attempt.
    pub fn is_terminal(&self) -> bool {
        match self {
            NegotiationError::ConnectionClosed | NegotiationError::PeerDeclined => true,
            NegotiationError::NegotiationFailed(e) => e.is_fatal(),
            NegotiationError::Cancelled => false,
        }
    }

    /// Short label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            NegotiationError::PeerDeclined => "declined_required",
            NegotiationError::NegotiationFailed(_) => "failed",
            NegotiationError::ConnectionClosed => "closed",
            NegotiationError::Cancelled => "cancelled",
        }
    }
}
