//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → tls.rs (optional TLS handshake, rustls ConnectionHandle)
//!     → connection.rs (id, tracking, ConnectionContext)
//!     → Hand off to HTTP layer
//!
//! Connection States:
//!     Accepting → Handshaking → Active → Draining → Closed
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - TLS is optional; plain connections simply carry no TLS feature

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{ConnectionContext, ConnectionId, ConnectionTracker, IoGate};
pub use listener::{Listener, ListenerError};
