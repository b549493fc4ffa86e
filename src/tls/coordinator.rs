//! Negotiation coordinator: single-flight client certificate retrieval.
//!
//! # Responsibilities
//! - Answer from the cache whenever a result is already known
//! - Start at most one renegotiation per connection
//! - Let every caller wait on the shared outcome, each with its own cancellation
//! - Apply the listener's client certificate policy to the outcome
//!
//! The renegotiation itself runs on a spawned task. A caller that gives up
//! only drops its own subscription; the task keeps going so the remaining
//! waiters still get a definitive answer.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::ClientCertMode;
use crate::net::connection::{ConnectionId, IoGate};
use crate::observability::metrics;
use crate::tls::cache::{Begin, CertificateCache, NegotiationOutcome, NegotiationState, NegotiationTicket, Settled, Waiter};
use crate::tls::certificate::ClientCertificate;
use crate::tls::error::{NegotiationError, TransportError};
use crate::tls::transport::ConnectionHandle;

/// Listener policy the coordinator enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationSettings {
    pub mode: ClientCertMode,
    /// Upper bound for one renegotiation.
    pub timeout: Duration,
}

impl Default for NegotiationSettings {
    fn default() -> Self {
        Self {
            mode: ClientCertMode::default(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Sole mutator of a connection's [`CertificateCache`].
pub struct NegotiationCoordinator {
    connection_id: ConnectionId,
    handle: Arc<dyn ConnectionHandle>,
    cache: CertificateCache,
    settings: NegotiationSettings,
    /// Connection-level teardown signal.
    closed: CancellationToken,
    gate: IoGate,
}

impl NegotiationCoordinator {
    pub fn new(
        connection_id: ConnectionId,
        handle: Arc<dyn ConnectionHandle>,
        settings: NegotiationSettings,
        closed: CancellationToken,
        gate: IoGate,
    ) -> Self {
        let cache = match handle.current_certificate() {
            Some(cert) if settings.mode != ClientCertMode::Ignore => {
                tracing::debug!(
                    connection_id = %connection_id,
                    subject = cert.subject(),
                    "Client certificate known from handshake"
                );
                CertificateCache::with_certificate(cert)
            }
            _ => CertificateCache::new(),
        };

        Self {
            connection_id,
            handle,
            cache,
            settings,
            closed,
            gate,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Current cache state. Never blocks.
    pub fn state(&self) -> NegotiationState {
        self.cache.query()
    }

    /// Certificate if already negotiated. Never triggers a negotiation.
    pub fn cached_certificate(&self) -> Option<ClientCertificate> {
        self.cache.certificate()
    }

    /// Obtain the peer's certificate, negotiating it if necessary.
    ///
    /// `Ok(None)` covers both "never requested" and "peer declined";
    /// use [`negotiate`](Self::negotiate) to tell them apart.
    pub async fn get_client_certificate(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<ClientCertificate>, NegotiationError> {
        self.negotiate(cancel)
            .await
            .map(NegotiationOutcome::into_certificate)
    }

    /// Obtain the negotiation outcome, starting or joining a renegotiation
    /// when nothing is cached yet.
    pub async fn negotiate(&self, cancel: &CancellationToken) -> Settled {
        if !self.handle.is_tls() || self.settings.mode == ClientCertMode::Ignore {
            metrics::record_negotiation(NegotiationOutcome::NotRequested.label());
            return Ok(NegotiationOutcome::NotRequested);
        }

        let settled = match self.cache.begin() {
            Begin::Settled(settled) => settled,
            Begin::Joined(waiter) => {
                tracing::trace!(connection_id = %self.connection_id, "Joining in-flight negotiation");
                self.wait(waiter, cancel).await
            }
            Begin::Started(ticket, waiter) => {
                self.spawn_renegotiation(ticket);
                self.wait(waiter, cancel).await
            }
        };

        self.apply_policy(settled)
    }

    /// Fail all pending waiters and forbid further negotiation.
    pub fn teardown(&self) {
        self.closed.cancel();
        self.cache.close();
    }

    fn spawn_renegotiation(&self, ticket: NegotiationTicket) {
        let connection_id = self.connection_id;
        let handle = Arc::clone(&self.handle);
        let timeout = self.settings.timeout;
        let closed = self.closed.clone();
        let gate = self.gate.clone();

        metrics::record_renegotiation_started();
        tracing::debug!(connection_id = %connection_id, ?timeout, "Starting client certificate renegotiation");

        tokio::spawn(async move {
            let result = tokio::select! {
                result = async {
                    // Body I/O is paused only if the transport cannot interleave.
                    let _exclusive = gate.exclusive().await;
                    match tokio::time::timeout(timeout, handle.renegotiate(timeout)).await {
                        Ok(Ok(cert)) => Ok(cert),
                        Ok(Err(e)) => Err(NegotiationError::NegotiationFailed(e)),
                        Err(_) => Err(NegotiationError::NegotiationFailed(TransportError::Timeout(timeout))),
                    }
                } => result,
                _ = closed.cancelled() => Err(NegotiationError::ConnectionClosed),
            };

            match &result {
                Ok(Some(cert)) => tracing::debug!(connection_id = %connection_id, subject = cert.subject(), "Peer presented a client certificate"),
                Ok(None) => tracing::debug!(connection_id = %connection_id, "Peer declined to present a client certificate"),
                Err(e) => tracing::warn!(connection_id = %connection_id, error = %e, "Client certificate renegotiation failed"),
            }
            ticket.complete(result);
        });
    }

    async fn wait(&self, waiter: Waiter, cancel: &CancellationToken) -> Settled {
        tokio::select! {
            biased;
            settled = waiter.settled() => settled,
            // Request tokens are children of `closed`; teardown wins over them.
            _ = self.closed.cancelled() => Err(NegotiationError::ConnectionClosed),
            _ = cancel.cancelled() => Err(NegotiationError::Cancelled),
        }
    }

    fn apply_policy(&self, settled: Settled) -> Settled {
        let settled = match settled {
            Ok(NegotiationOutcome::Declined) if self.settings.mode == ClientCertMode::Require => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    "Client certificate required but not presented, closing connection"
                );
                self.teardown();
                Err(NegotiationError::PeerDeclined)
            }
            other => other,
        };

        match &settled {
            Ok(outcome) => metrics::record_negotiation(outcome.label()),
            Err(e) => metrics::record_negotiation(e.kind()),
        }
        settled
    }
}
