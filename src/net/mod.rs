//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Listen target (host:port | unix://path | inherited fd)
//!     → listener.rs (bind, accept loop, connection limits)
//!     → tls.rs (optional TLS handshake)
//!     → connection.rs (identity, lifecycle tracking)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - TLS context built before the first accept, shared read-only

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionState, ConnectionTracker};
pub use listener::{BindError, BoundAddr, ListenTarget, Listener, PeerAddr, StdListener, Stream};
pub use tls::{HandshakeError, TlsContext, TlsError, TlsMode};
