//! Per-request TLS capability.
//!
//! Handlers reach it through the request's [`ConnectionContext`]
//! (`ctx.tls()`), or directly with an `Option<TlsConnectionFeature>`
//! extractor. Plain HTTP connections have no feature.
//!
//! The certificate belongs to the connection, not the request: once one
//! request negotiates it, every other request on the same connection sees it.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::OptionalFromRequestParts;
use axum::http::request::Parts;
use tokio_util::sync::CancellationToken;

use crate::net::connection::ConnectionContext;
use crate::tls::cache::{NegotiationState, Settled};
use crate::tls::certificate::ClientCertificate;
use crate::tls::coordinator::NegotiationCoordinator;
use crate::tls::error::NegotiationError;

/// Read-mostly view onto the connection's certificate negotiation.
#[derive(Clone)]
pub struct TlsConnectionFeature {
    coordinator: Arc<NegotiationCoordinator>,
}

impl TlsConnectionFeature {
    pub fn new(coordinator: Arc<NegotiationCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Certificate if already negotiated, else `None`. Never negotiates.
    pub fn client_certificate(&self) -> Option<ClientCertificate> {
        self.coordinator.cached_certificate()
    }

    /// Get the client certificate, renegotiating once per connection if
    /// needed. Firing `cancel` abandons only this caller's wait.
    pub async fn get_client_certificate(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<ClientCertificate>, NegotiationError> {
        self.coordinator.get_client_certificate(cancel).await
    }

    /// Like [`get_client_certificate`](Self::get_client_certificate) but
    /// keeps "not requested" and "declined" apart.
    pub async fn negotiate(&self, cancel: &CancellationToken) -> Settled {
        self.coordinator.negotiate(cancel).await
    }

    pub fn state(&self) -> NegotiationState {
        self.coordinator.state()
    }

    pub(crate) fn coordinator(&self) -> &NegotiationCoordinator {
        &self.coordinator
    }
}

impl std::fmt::Debug for TlsConnectionFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnectionFeature")
            .field("connection_id", &self.coordinator.connection_id())
            .field("state", &self.coordinator.state())
            .finish()
    }
}

impl<S> OptionalFromRequestParts<S> for TlsConnectionFeature
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Option<Self>, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<ConnectionContext>()
            .and_then(|ctx| ctx.tls().cloned()))
    }
}
