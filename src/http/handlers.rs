//! Built-in routes served by the binary.
//!
//! - `/` returns an empty 200
//! - `/hello` writes "Hello World" with a declared length
//! - `/echo` streams the request body back with the same declared length
//! - `/client-cert` negotiates the client certificate and describes it

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;

use crate::http::body::{RequestBody, ResponseBody};
use crate::net::connection::ConnectionContext;
use crate::tls::{NegotiationError, NegotiationOutcome};

const HELLO: &[u8] = b"Hello World";

/// State for the built-in routes.
#[derive(Clone, Copy, Debug)]
pub struct DemoState {
    /// Response chunks buffered per writer.
    pub body_channel_capacity: usize,
}

impl Default for DemoState {
    fn default() -> Self {
        Self {
            body_channel_capacity: 16,
        }
    }
}

pub fn demo_router(state: DemoState) -> Router {
    Router::new()
        .route("/", any(|| async { StatusCode::OK }))
        .route("/hello", get(hello))
        .route("/echo", any(echo))
        .route("/client-cert", get(client_cert))
        .with_state(state)
}

async fn hello(State(state): State<DemoState>, ctx: ConnectionContext) -> Response {
    let (mut writer, response) =
        ResponseBody::channel(Some(HELLO.len() as u64), state.body_channel_capacity, &ctx);

    tokio::spawn(async move {
        if let Err(e) = writer.write(HELLO).await {
            tracing::debug!(error = %e, "Hello write failed");
            return;
        }
        if let Err(e) = writer.finish().await {
            tracing::warn!(error = %e, "Hello body incomplete");
        }
    });
    response
}

async fn echo(State(state): State<DemoState>, ctx: ConnectionContext, mut body: RequestBody) -> Response {
    let input = match body.read_to_end().await {
        Ok(input) => input,
        Err(e) => {
            tracing::warn!(connection_id = %ctx.id(), error = %e, "Failed to read request body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let (mut writer, response) =
        ResponseBody::channel(Some(input.len() as u64), state.body_channel_capacity, &ctx);
    tokio::spawn(async move {
        let result = match writer.write(input).await {
            Ok(()) => writer.finish().await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "Echo body incomplete");
        }
    });
    response
}

async fn client_cert(ctx: ConnectionContext) -> Response {
    let Some(tls) = ctx.tls() else {
        return (StatusCode::NOT_FOUND, "connection is not TLS").into_response();
    };

    let cancel = ctx.request_token();
    match tls.negotiate(&cancel).await {
        Ok(NegotiationOutcome::Presented(cert)) => {
            let body = format!(
                "subject={}\nissuer={}\nserial={}\neku={}\n",
                cert.subject(),
                cert.issuer(),
                cert.serial(),
                cert.extended_key_usages().join(",")
            );
            (StatusCode::OK, body).into_response()
        }
        Ok(NegotiationOutcome::Declined) => (StatusCode::OK, "declined\n").into_response(),
        Ok(NegotiationOutcome::NotRequested) => (StatusCode::OK, "not requested\n").into_response(),
        Err(e) => negotiation_error_response(&e),
    }
}

fn negotiation_error_response(err: &NegotiationError) -> Response {
    let status = match err {
        NegotiationError::PeerDeclined => StatusCode::FORBIDDEN,
        NegotiationError::NegotiationFailed(_) => StatusCode::BAD_REQUEST,
        NegotiationError::ConnectionClosed => StatusCode::SERVICE_UNAVAILABLE,
        NegotiationError::Cancelled => StatusCode::REQUEST_TIMEOUT,
    };
    (status, err.to_string()).into_response()
}
