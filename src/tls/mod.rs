//! Deferred client certificate negotiation.
//!
//! # Data Flow
//! ```text
//! handler
//!     → feature.rs (TlsConnectionFeature, per request)
//!     → coordinator.rs (policy, single-flight, cancellation)
//!     → cache.rs (per-connection state + waiters)
//!     → transport.rs (ConnectionHandle: current cert, renegotiate)
//! ```
//!
//! # Design Decisions
//! - The cache is owned by the connection; there is no global registry
//! - At most one renegotiation in flight per connection
//! - A waiter's cancellation never aborts the shared renegotiation
//! - "No certificate" is an outcome, not an error

pub mod cache;
pub mod certificate;
pub mod coordinator;
pub mod error;
pub mod feature;
pub mod transport;

pub use cache::{CertificateCache, NegotiationOutcome, NegotiationState};
pub use certificate::ClientCertificate;
pub use coordinator::{NegotiationCoordinator, NegotiationSettings};
pub use error::{NegotiationError, TransportError};
pub use feature::TlsConnectionFeature;
pub use transport::{ConnectionHandle, RenegotiationResult};
