//! HTTPS listener with deferred client certificate negotiation.
//!
//! Connections are accepted without demanding a client certificate up
//! front. A handler that needs one asks for it through the request's
//! [`TlsConnectionFeature`]; the connection negotiates it at most once and
//! every request on that connection shares the result.

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod tls;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::ServerConfig;
pub use http::HttpsServer;
pub use lifecycle::Shutdown;
pub use net::ConnectionContext;
pub use tls::{ClientCertificate, NegotiationError, NegotiationOutcome, TlsConnectionFeature};
