//! HTTP/1.1 protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS/unix connection
//!     → server.rs (accept loop, per-connection state machine)
//!     → request.rs (request line, headers, framing)
//!     → environ.rs (calling convention environment, body input)
//!         → chunked.rs (when Transfer-Encoding: chunked)
//!     → [hosted application]
//!     → response.rs (framing, serialization)
//!     → Send to client, persist or close
//! ```

pub mod chunked;
pub mod environ;
pub(crate) mod line;
pub mod request;
pub mod response;
pub mod server;

/// Value of `SERVER_SOFTWARE` and the `Server` response header.
pub const SERVER_SOFTWARE: &str = concat!("devserve/", env!("CARGO_PKG_VERSION"));

pub use chunked::{ChunkedError, ChunkedStream};
pub use environ::{Environ, EnvironBuilder, Input, InputError};
pub use request::{ParseError, RequestHead};
pub use response::{Body, Response, ResponseError};
pub use server::{BoundServer, HttpServer};
