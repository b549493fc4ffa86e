//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (hyper auto builder, ConnectionContext per connection)
//!     → middleware (request id, trace, timeout, body limit)
//!     → application router
//!     → body.rs (RequestBody / BodyWriter streams)
//!     → Send to client
//! ```

pub mod body;
pub mod handlers;
pub mod server;

pub use body::{BodyError, BodyWriter, RequestBody, ResponseBody};
pub use handlers::{demo_router, DemoState};
pub use server::HttpsServer;
