//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validate config → pick role → bind (or adopt) listener → serve
//!         role standalone: bind, serve
//!         role supervisor: bind, hand socket to reload::Supervisor
//!         role worker:     adopt DEVSERVE_SERVER_FD, serve
//!
//! Shutdown (shutdown.rs):
//!     Signal received → stop accepting → drain connections → exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal and returned to the caller
//! - Listeners start last (traffic only when ready)
//! - Shutdown has a grace period: connections still open after it are abandoned

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{run_simple, run_simple_with_tls, Role, StartupError};
