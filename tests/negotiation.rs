//! Connection-level negotiation behavior against a scripted transport.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use tokio_util::sync::CancellationToken;

use common::{context, context_with_timeout, MockConnection, TestIdentity};
use https_listener::config::ClientCertMode;
use https_listener::http::RequestBody;
use https_listener::tls::{NegotiationError, NegotiationOutcome, NegotiationState, TransportError};

#[tokio::test]
async fn concurrent_callers_share_one_renegotiation() {
    let cert = TestIdentity::client("Concurrent Client").certificate();
    let mock = Arc::new(MockConnection::new(vec![Ok(Some(cert.clone()))]).held());
    let ctx = context(&mock, ClientCertMode::OnDemand);
    let tls = ctx.tls().unwrap().clone();

    let first = {
        let tls = tls.clone();
        tokio::spawn(async move { tls.get_client_certificate(&CancellationToken::new()).await })
    };
    mock.wait_started().await;
    let second = {
        let tls = tls.clone();
        tokio::spawn(async move { tls.get_client_certificate(&CancellationToken::new()).await })
    };

    assert_eq!(tls.state(), NegotiationState::InProgress);
    mock.release();

    assert_eq!(first.await.unwrap(), Ok(Some(cert.clone())));
    assert_eq!(second.await.unwrap(), Ok(Some(cert.clone())));
    assert_eq!(mock.renegotiations(), 1);

    // Settled results are served from the cache.
    assert_eq!(tls.client_certificate(), Some(cert.clone()));
    assert_eq!(tls.get_client_certificate(&CancellationToken::new()).await, Ok(Some(cert)));
    assert_eq!(mock.renegotiations(), 1);
}

#[tokio::test]
async fn cancelled_caller_does_not_abort_shared_renegotiation() {
    let cert = TestIdentity::client("Patient Client").certificate();
    let mock = Arc::new(MockConnection::new(vec![Ok(Some(cert.clone()))]).held());
    let ctx = context(&mock, ClientCertMode::OnDemand);
    let tls = ctx.tls().unwrap().clone();

    // The caller that starts the renegotiation is the one that gives up.
    let impatient = CancellationToken::new();
    let first = {
        let tls = tls.clone();
        let cancel = impatient.clone();
        tokio::spawn(async move { tls.get_client_certificate(&cancel).await })
    };
    mock.wait_started().await;
    let second = {
        let tls = tls.clone();
        tokio::spawn(async move { tls.get_client_certificate(&CancellationToken::new()).await })
    };

    impatient.cancel();
    assert_eq!(first.await.unwrap(), Err(NegotiationError::Cancelled));

    mock.release();
    assert_eq!(second.await.unwrap(), Ok(Some(cert.clone())));
    assert_eq!(tls.state(), NegotiationState::Presented(cert));
    assert_eq!(mock.renegotiations(), 1);
}

#[tokio::test]
async fn certificate_from_handshake_needs_no_renegotiation() {
    let cert = TestIdentity::client("Handshake Client").certificate();
    let mock = Arc::new(MockConnection::new(vec![]).with_current(cert.clone()));
    let ctx = context(&mock, ClientCertMode::OnDemand);
    let tls = ctx.tls().unwrap();

    assert_eq!(tls.client_certificate(), Some(cert.clone()));
    assert_eq!(tls.get_client_certificate(&CancellationToken::new()).await, Ok(Some(cert)));
    assert_eq!(mock.renegotiations(), 0);
}

#[tokio::test]
async fn declined_is_cached_for_the_connection() {
    let mock = Arc::new(MockConnection::new(vec![Ok(None)]));
    let ctx = context(&mock, ClientCertMode::OnDemand);
    let tls = ctx.tls().unwrap();

    let cancel = CancellationToken::new();
    assert_eq!(tls.negotiate(&cancel).await, Ok(NegotiationOutcome::Declined));
    assert_eq!(tls.get_client_certificate(&cancel).await, Ok(None));
    assert_eq!(tls.state(), NegotiationState::Declined);
    assert_eq!(mock.renegotiations(), 1);
    assert!(!ctx.is_closed());
}

#[tokio::test]
async fn ignore_policy_never_touches_the_transport() {
    let cert = TestIdentity::client("Ignored Client").certificate();
    let mock = Arc::new(MockConnection::new(vec![Ok(Some(cert))]));
    let ctx = context(&mock, ClientCertMode::Ignore);
    let tls = ctx.tls().unwrap();

    let cancel = CancellationToken::new();
    assert_eq!(tls.negotiate(&cancel).await, Ok(NegotiationOutcome::NotRequested));
    assert_eq!(tls.get_client_certificate(&cancel).await, Ok(None));
    assert_eq!(tls.client_certificate(), None);
    assert_eq!(mock.renegotiations(), 0);
}

#[tokio::test]
async fn non_tls_transport_reports_not_requested() {
    let mock = Arc::new(MockConnection::new(vec![Ok(None)]).without_tls());
    let ctx = context(&mock, ClientCertMode::Require);
    let tls = ctx.tls().unwrap();

    assert_eq!(
        tls.negotiate(&CancellationToken::new()).await,
        Ok(NegotiationOutcome::NotRequested)
    );
    assert_eq!(mock.renegotiations(), 0);
    assert!(!ctx.is_closed());
}

#[tokio::test]
async fn failed_attempt_can_be_retried() {
    let cert = TestIdentity::client("Retry Client").certificate();
    let mock = Arc::new(MockConnection::new(vec![
        Err(TransportError::PeerReset),
        Ok(Some(cert.clone())),
    ]));
    let ctx = context(&mock, ClientCertMode::OnDemand);
    let tls = ctx.tls().unwrap();
    let cancel = CancellationToken::new();

    assert_eq!(
        tls.get_client_certificate(&cancel).await,
        Err(NegotiationError::NegotiationFailed(TransportError::PeerReset))
    );
    assert!(matches!(tls.state(), NegotiationState::Failed(_)));

    assert_eq!(tls.get_client_certificate(&cancel).await, Ok(Some(cert)));
    assert_eq!(mock.renegotiations(), 2);
}

#[tokio::test]
async fn unresponsive_peer_times_out() {
    let mock = Arc::new(MockConnection::new(vec![Ok(None)]).held());
    let ctx = context_with_timeout(&mock, ClientCertMode::OnDemand, Duration::from_millis(50));
    let tls = ctx.tls().unwrap();

    let result = tls.get_client_certificate(&CancellationToken::new()).await;
    assert_eq!(
        result,
        Err(NegotiationError::NegotiationFailed(TransportError::Timeout(
            Duration::from_millis(50)
        )))
    );
}

#[tokio::test]
async fn teardown_fails_pending_and_future_callers() {
    let mock = Arc::new(MockConnection::new(vec![Ok(None)]).held());
    let ctx = context(&mock, ClientCertMode::OnDemand);
    let tls = ctx.tls().unwrap().clone();

    let pending = {
        let tls = tls.clone();
        tokio::spawn(async move { tls.get_client_certificate(&CancellationToken::new()).await })
    };
    mock.wait_started().await;

    ctx.close();
    assert_eq!(pending.await.unwrap(), Err(NegotiationError::ConnectionClosed));
    assert_eq!(
        tls.get_client_certificate(&CancellationToken::new()).await,
        Err(NegotiationError::ConnectionClosed)
    );
    assert_eq!(mock.renegotiations(), 1);
}

#[tokio::test]
async fn required_certificate_declined_closes_connection() {
    let mock = Arc::new(MockConnection::new(vec![Ok(None)]));
    let ctx = context(&mock, ClientCertMode::Require);
    let tls = ctx.tls().unwrap();

    assert_eq!(
        tls.get_client_certificate(&CancellationToken::new()).await,
        Err(NegotiationError::PeerDeclined)
    );
    assert!(ctx.is_closed());
    assert!(ctx.closed_token().is_cancelled());
}

#[tokio::test]
async fn serialized_transport_pauses_body_io_during_renegotiation() {
    let mock = Arc::new(MockConnection::new(vec![Ok(None)]).held().serialized());
    let ctx = context(&mock, ClientCertMode::OnDemand);
    assert!(ctx.gate().is_serialized());
    let mut body = RequestBody::new(Body::from("ping"), Some(4), &ctx);

    let negotiation = {
        let tls = ctx.tls().unwrap().clone();
        tokio::spawn(async move { tls.negotiate(&CancellationToken::new()).await })
    };
    mock.wait_started().await;

    let mut buf = [0u8; 8];
    let blocked = tokio::time::timeout(Duration::from_millis(50), body.read(&mut buf)).await;
    assert!(blocked.is_err(), "body read should wait for the renegotiation");

    mock.release();
    assert_eq!(negotiation.await.unwrap(), Ok(NegotiationOutcome::Declined));
    let n = body.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ping");
}

#[tokio::test]
async fn interleaving_transport_keeps_body_io_flowing() {
    let mock = Arc::new(MockConnection::new(vec![Ok(None)]).held());
    let ctx = context(&mock, ClientCertMode::OnDemand);
    assert!(!ctx.gate().is_serialized());
    let mut body = RequestBody::new(Body::from("pong"), Some(4), &ctx);

    let negotiation = {
        let tls = ctx.tls().unwrap().clone();
        tokio::spawn(async move { tls.negotiate(&CancellationToken::new()).await })
    };
    mock.wait_started().await;

    assert_eq!(body.read_to_end().await.unwrap(), b"pong");

    mock.release();
    assert_eq!(negotiation.await.unwrap(), Ok(NegotiationOutcome::Declined));
}

#[tokio::test]
async fn teardown_is_reported_to_request_scoped_waiters() {
    let mock = Arc::new(MockConnection::new(vec![Ok(None)]).held());
    let ctx = context(&mock, ClientCertMode::OnDemand);

    let pending = {
        let tls = ctx.tls().unwrap().clone();
        let cancel = ctx.request_token();
        tokio::spawn(async move { tls.get_client_certificate(&cancel).await })
    };
    mock.wait_started().await;

    ctx.close();
    assert_eq!(pending.await.unwrap(), Err(NegotiationError::ConnectionClosed));
}
