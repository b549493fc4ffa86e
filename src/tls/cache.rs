//! Per-connection certificate cache.
//!
//! # State Transitions
//! ```text
//! NotAttempted ──begin──▶ InProgress ──complete──▶ Presented | Declined | Failed
//! Failed (retryable) ──begin──▶ InProgress
//! any non-terminal ──close──▶ Failed(ConnectionClosed)
//! ```
//!
//! `Presented` and `Declined` are terminal for the connection's lifetime, as
//! is a `Failed` state carrying a terminal error.
//!
//! Reads go through an `ArcSwap` and never wait on a writer. Transitions are
//! serialized by a small mutex that also owns the single in-flight slot.

use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use tokio::sync::watch;

use crate::tls::certificate::ClientCertificate;
use crate::tls::error::{NegotiationError, TransportError};

/// Negotiation state of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    NotAttempted,
    InProgress,
    Presented(ClientCertificate),
    /// The peer explicitly sent no certificate.
    Declined,
    Failed(NegotiationError),
}

impl NegotiationState {
    pub fn certificate(&self) -> Option<&ClientCertificate> {
        match self {
            NegotiationState::Presented(cert) => Some(cert),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            NegotiationState::NotAttempted => "not_attempted",
            NegotiationState::InProgress => "in_progress",
            NegotiationState::Presented(_) => "presented",
            NegotiationState::Declined => "declined",
            NegotiationState::Failed(_) => "failed",
        }
    }
}

/// What a finished negotiation produced, as seen by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationOutcome {
    /// The listener never asks for client certificates.
    NotRequested,
    /// The peer was asked and sent none.
    Declined,
    Presented(ClientCertificate),
}

impl NegotiationOutcome {
    pub fn certificate(&self) -> Option<&ClientCertificate> {
        match self {
            NegotiationOutcome::Presented(cert) => Some(cert),
            _ => None,
        }
    }

    pub fn into_certificate(self) -> Option<ClientCertificate> {
        match self {
            NegotiationOutcome::Presented(cert) => Some(cert),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            NegotiationOutcome::NotRequested => "not_requested",
            NegotiationOutcome::Declined => "declined",
            NegotiationOutcome::Presented(_) => "presented",
        }
    }
}

/// The value every waiter of one negotiation receives.
pub type Settled = Result<NegotiationOutcome, NegotiationError>;

type Slot = watch::Receiver<Option<Settled>>;

/// Single-slot store shared by every request on a connection.
#[derive(Clone)]
pub struct CertificateCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    state: ArcSwap<NegotiationState>,
    flight: Mutex<Flight>,
}

#[derive(Default)]
struct Flight {
    in_flight: Option<Slot>,
    closed: bool,
}

/// Result of [`CertificateCache::begin`].
pub enum Begin {
    /// A terminal result is already cached.
    Settled(Settled),
    /// Another caller is negotiating; wait on its outcome.
    Joined(Waiter),
    /// The caller owns the new negotiation and must complete the ticket.
    Started(NegotiationTicket, Waiter),
}

impl CertificateCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: ArcSwap::from_pointee(NegotiationState::NotAttempted),
                flight: Mutex::new(Flight::default()),
            }),
        }
    }

    /// A cache that already knows the certificate from the handshake.
    pub fn with_certificate(cert: ClientCertificate) -> Self {
        let cache = Self::new();
        cache.inner.state.store(Arc::new(NegotiationState::Presented(cert)));
        cache
    }

    /// Current state. Never blocks.
    pub fn query(&self) -> NegotiationState {
        (*self.inner.state.load_full()).clone()
    }

    /// Certificate if one is already known. Never blocks.
    pub fn certificate(&self) -> Option<ClientCertificate> {
        self.inner.state.load().certificate().cloned()
    }

    /// Start a negotiation, join the one in flight, or return the cached
    /// terminal result.
    pub fn begin(&self) -> Begin {
        let mut flight = self.lock();

        if let Some(slot) = &flight.in_flight {
            return Begin::Joined(Waiter(slot.clone()));
        }

        let current = self.inner.state.load_full();
        match &*current {
            NegotiationState::Presented(cert) => {
                return Begin::Settled(Ok(NegotiationOutcome::Presented(cert.clone())));
            }
            NegotiationState::Declined => return Begin::Settled(Ok(NegotiationOutcome::Declined)),
            NegotiationState::Failed(err) if flight.closed || err.is_terminal() => {
                return Begin::Settled(Err(err.clone()));
            }
            _ if flight.closed => return Begin::Settled(Err(NegotiationError::ConnectionClosed)),
            _ => {}
        }

        let (tx, rx) = watch::channel(None);
        flight.in_flight = Some(rx.clone());
        self.transition(NegotiationState::InProgress);

        let ticket = NegotiationTicket {
            cache: self.clone(),
            tx: Some(tx),
        };
        Begin::Started(ticket, Waiter(rx))
    }

    /// Tear down: no negotiation may start after this. Non-terminal states
    /// become `Failed(ConnectionClosed)`; known results stay readable.
    pub fn close(&self) {
        let mut flight = self.lock();
        if flight.closed {
            return;
        }
        flight.closed = true;

        let current = self.inner.state.load_full();
        match &*current {
            NegotiationState::Presented(_) | NegotiationState::Declined => {}
            _ => self.transition(NegotiationState::Failed(NegotiationError::ConnectionClosed)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn complete(
        &self,
        tx: watch::Sender<Option<Settled>>,
        result: Result<Option<ClientCertificate>, NegotiationError>,
    ) {
        let settled = {
            let mut flight = self.lock();
            flight.in_flight = None;

            if flight.closed {
                Err(NegotiationError::ConnectionClosed)
            } else {
                let (state, settled) = match result {
                    Ok(Some(cert)) => (
                        NegotiationState::Presented(cert.clone()),
                        Ok(NegotiationOutcome::Presented(cert)),
                    ),
                    Ok(None) => (NegotiationState::Declined, Ok(NegotiationOutcome::Declined)),
                    Err(err) => (NegotiationState::Failed(err.clone()), Err(err)),
                };
                self.transition(state);
                settled
            }
        };

        // State is committed before anyone is woken.
        let _ = tx.send(Some(settled));
    }

    fn transition(&self, next: NegotiationState) {
        tracing::debug!(state = next.label(), "Certificate cache transition");
        self.inner.state.store(Arc::new(next));
    }

    fn lock(&self) -> MutexGuard<'_, Flight> {
        self.inner
            .flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for CertificateCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive right to finish the in-flight negotiation.
///
/// Dropping an uncompleted ticket settles it as abandoned so waiters never hang.
pub struct NegotiationTicket {
    cache: CertificateCache,
    tx: Option<watch::Sender<Option<Settled>>>,
}

impl NegotiationTicket {
    pub fn complete(mut self, result: Result<Option<ClientCertificate>, NegotiationError>) {
        if let Some(tx) = self.tx.take() {
            self.cache.complete(tx, result);
        }
    }
}

impl Drop for NegotiationTicket {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            self.cache.complete(
                tx,
                Err(NegotiationError::NegotiationFailed(TransportError::Abandoned)),
            );
        }
    }
}

/// Subscription to one negotiation's outcome.
pub struct Waiter(Slot);

impl Waiter {
    /// Wait for the outcome. Dropping the future unsubscribes.
    pub async fn settled(mut self) -> Settled {
        match self.0.wait_for(Option::is_some).await {
            Ok(value) => value
                .as_ref()
                .cloned()
                .unwrap_or(Err(NegotiationError::ConnectionClosed)),
            Err(_) => Err(NegotiationError::ConnectionClosed),
        }
    }
}
