//! Request and response body streams.
//!
//! # Responsibilities
//! - Read the request body up to its declared length, then report EOF
//! - Write the response body and enforce its declared length
//! - Fail with `ConnectionAborted` once the connection is torn down
//!
//! Both sides take the connection's [`IoGate`] per chunk, which only ever
//! waits when the transport cannot interleave renegotiation with data.

use axum::body::{Body, BodyDataStream, Bytes};
use axum::extract::{FromRequest, Request};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use futures_util::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::net::connection::{ConnectionContext, IoGate};
use crate::observability::metrics;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BodyError {
    /// The connection was closed or cancelled.
    #[error("connection aborted")]
    ConnectionAborted,

    /// Bytes written do not match the declared content length.
    #[error("body contract violation: declared {declared} bytes, wrote {written}")]
    ContractViolation { declared: u64, written: u64 },

    #[error("body transport error: {0}")]
    Transport(String),
}

/// Sequential reader over a request body.
pub struct RequestBody {
    stream: BodyDataStream,
    content_length: Option<u64>,
    remaining: Option<u64>,
    pending: Bytes,
    closed: CancellationToken,
    gate: IoGate,
}

impl RequestBody {
    pub fn new(body: Body, content_length: Option<u64>, ctx: &ConnectionContext) -> Self {
        Self {
            stream: body.into_data_stream(),
            content_length,
            remaining: content_length,
            pending: Bytes::new(),
            closed: ctx.closed_token().clone(),
            gate: ctx.gate().clone(),
        }
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Read into `buf`. `Ok(0)` means end of stream, including any read
    /// past the declared content length.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, BodyError> {
        if self.closed.is_cancelled() {
            return Err(BodyError::ConnectionAborted);
        }
        if buf.is_empty() || self.remaining == Some(0) {
            return Ok(0);
        }

        while self.pending.is_empty() {
            let _shared = self.gate.shared().await;
            let next = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(BodyError::ConnectionAborted),
                next = self.stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => self.pending = chunk,
                Some(Err(e)) => return Err(BodyError::Transport(e.to_string())),
                None => return Ok(0),
            }
        }

        let mut n = buf.len().min(self.pending.len());
        if let Some(remaining) = self.remaining {
            n = n.min(usize::try_from(remaining).unwrap_or(usize::MAX));
        }

        let chunk = self.pending.split_to(n);
        buf[..n].copy_from_slice(&chunk);
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= n as u64;
        }
        Ok(n)
    }

    /// Read everything up to EOF.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, BodyError> {
        let capacity = self
            .content_length
            .and_then(|len| usize::try_from(len).ok())
            .unwrap_or(0)
            .min(64 * 1024);
        let mut out = Vec::with_capacity(capacity);
        let mut buf = [0u8; 8 * 1024];
        loop {
            match self.read(&mut buf).await? {
                0 => return Ok(out),
                n => out.extend_from_slice(&buf[..n]),
            }
        }
    }
}

impl<S> FromRequest<S> for RequestBody
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request(req: Request, _state: &S) -> Result<Self, Self::Rejection> {
        let ctx = req
            .extensions()
            .get::<ConnectionContext>()
            .cloned()
            .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;

        let content_length = req
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        Ok(Self::new(req.into_body(), content_length, &ctx))
    }
}

/// Factory for streamed responses.
pub struct ResponseBody;

/// Receiving side of a response channel.
///
/// Counts delivered bytes so a body that ends short of its declared length
/// is aborted no matter how the writer went away.
struct Feed {
    rx: mpsc::Receiver<Result<Bytes, BodyError>>,
    declared: Option<u64>,
    delivered: u64,
    done: bool,
}

impl Feed {
    async fn next(mut self) -> Option<(Result<Bytes, BodyError>, Self)> {
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(Ok(chunk)) => {
                self.delivered += chunk.len() as u64;
                Some((Ok(chunk), self))
            }
            Some(Err(e)) => {
                self.done = true;
                Some((Err(e), self))
            }
            None => match self.declared {
                Some(declared) if self.delivered != declared => {
                    metrics::record_body_contract_violation("response_short");
                    self.done = true;
                    let err = BodyError::ContractViolation {
                        declared,
                        written: self.delivered,
                    };
                    Some((Err(err), self))
                }
                _ => None,
            },
        }
    }
}

impl ResponseBody {
    /// Create a writer and the response it streams into.
    ///
    /// With `content_length`, the response carries a `content-length`
    /// header and the writer must produce exactly that many bytes.
    pub fn channel(
        content_length: Option<u64>,
        capacity: usize,
        ctx: &ConnectionContext,
    ) -> (BodyWriter, Response) {
        let (tx, rx) = mpsc::channel::<Result<Bytes, BodyError>>(capacity.max(1));
        let feed = Feed {
            rx,
            declared: content_length,
            delivered: 0,
            done: false,
        };

        let mut response = Response::new(Body::from_stream(stream::unfold(feed, Feed::next)));
        if let Some(len) = content_length {
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        }

        let writer = BodyWriter {
            tx,
            declared: content_length,
            written: 0,
            overflowed: None,
            closed: ctx.closed_token().clone(),
            gate: ctx.gate().clone(),
        };
        (writer, response)
    }
}

/// Sequential writer feeding a streamed response.
pub struct BodyWriter {
    tx: mpsc::Sender<Result<Bytes, BodyError>>,
    declared: Option<u64>,
    written: u64,
    /// Length the body would have reached when a write overflowed.
    overflowed: Option<u64>,
    closed: CancellationToken,
    gate: IoGate,
}

impl BodyWriter {
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Write a chunk. Exceeding the declared length is rejected before any
    /// byte of the chunk is sent, aborts the response and fails every later
    /// call on this writer.
    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<(), BodyError> {
        let data = data.into();
        if self.closed.is_cancelled() {
            return Err(BodyError::ConnectionAborted);
        }
        if let Some(err) = self.overflow_error() {
            return Err(err);
        }

        let attempted = self.written + data.len() as u64;
        if let Some(declared) = self.declared {
            if attempted > declared {
                metrics::record_body_contract_violation("response_overflow");
                tracing::warn!(declared, attempted, "Response body exceeds declared length");
                self.overflowed = Some(attempted);
                let err = BodyError::ContractViolation {
                    declared,
                    written: attempted,
                };
                let _ = self.tx.send(Err(err.clone())).await;
                return Err(err);
            }
        }
        if data.is_empty() {
            return Ok(());
        }

        let _shared = self.gate.shared().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(BodyError::ConnectionAborted),
            sent = self.tx.send(Ok(data)) => sent.map_err(|_| BodyError::ConnectionAborted)?,
        }
        self.written = attempted;
        Ok(())
    }

    /// Complete the body. A short or overflowed body is a contract
    /// violation and the response stream ends in an error.
    pub async fn finish(self) -> Result<u64, BodyError> {
        if let Some(err) = self.overflow_error() {
            return Err(err);
        }
        if let Some(declared) = self.declared {
            if self.written != declared {
                tracing::warn!(declared, written = self.written, "Response body shorter than declared length");
                return Err(BodyError::ContractViolation {
                    declared,
                    written: self.written,
                });
            }
        }
        Ok(self.written)
    }

    fn overflow_error(&self) -> Option<BodyError> {
        match (self.declared, self.overflowed) {
            (Some(declared), Some(written)) => Some(BodyError::ContractViolation { declared, written }),
            _ => None,
        }
    }
}
