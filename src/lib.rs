//! devserve: a development HTTP server for hosted applications.
//!
//! Serves an [`Application`] over TCP, TLS or a unix domain socket, with an
//! optional reload supervisor that restarts the worker process when source
//! files change while keeping the listening socket bound.

// Core subsystems
pub mod app;
pub mod config;
pub mod http;
pub mod net;
pub mod proxy;
pub mod reload;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use app::{AppError, Application, ApplicationFault, EchoEnviron, Fixed, FnApp};
pub use config::schema::ServerConfig;
pub use http::{BoundServer, Environ, HttpServer, Response};
pub use lifecycle::{run_simple, run_simple_with_tls, Shutdown};
pub use net::{ListenTarget, TlsMode};
pub use proxy::ProxyMiddleware;
