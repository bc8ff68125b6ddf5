//! Proxy forwarder subsystem.
//!
//! # Data Flow
//! ```text
//! Environ (from the connection handler)
//!     → router.rs (prefix match, first wins)
//!         → no match: fallback application
//!     → forward.rs (rewrite path, Host and headers, send to backend)
//!     → Response streamed back, status relayed unchanged
//! ```
//!
//! # Design Decisions
//! - Request bodies are buffered (bounded) before forwarding; responses stream
//! - Backend connection failure is 502, backend timeout is 504
//! - Only plain `http://` backends

pub mod forward;
pub mod router;

use std::time::Duration;

use futures_util::future::BoxFuture;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::app::{AppError, Application};
use crate::config::ProxyRouteConfig;
use crate::http::environ::Environ;
use crate::http::response::Response;

pub use forward::BackendClient;
pub use router::{HostRewrite, ProxyRoute, ProxyTable};

/// Default time allowed for a backend to start responding.
const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on a forwarded request body.
const DEFAULT_MAX_BODY: u64 = 64 * 1024 * 1024;

/// Errors configuring or performing a proxied request.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid proxy target {target}: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("unsupported proxy target scheme {0:?}; only http is supported")]
    UnsupportedScheme(String),

    #[error("invalid proxy header {name:?}")]
    InvalidHeader { name: String },

    #[error("failed to build backend request: {0}")]
    Request(#[from] http::Error),

    #[error("backend request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    #[error("backend did not respond within {0:?}")]
    Timeout(Duration),
}

/// Routes prefixed paths to backends and everything else to `fallback`.
pub struct ProxyMiddleware<A> {
    fallback: A,
    table: ProxyTable,
    client: BackendClient,
    timeout: Duration,
    max_body: u64,
}

impl<A> ProxyMiddleware<A> {
    pub fn new(fallback: A, routes: &[ProxyRouteConfig]) -> Result<Self, ProxyError> {
        let table = ProxyTable::from_config(routes)?;
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        tracing::info!(routes = table.len(), "Proxy routing table loaded");
        Ok(Self {
            fallback,
            table,
            client,
            timeout: DEFAULT_BACKEND_TIMEOUT,
            max_body: DEFAULT_MAX_BODY,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_body(mut self, max_body: u64) -> Self {
        self.max_body = max_body;
        self
    }

    pub fn table(&self) -> &ProxyTable {
        &self.table
    }
}

impl<A: Application> Application for ProxyMiddleware<A> {
    fn call<'a>(&'a self, environ: &'a mut Environ<'_>) -> BoxFuture<'a, Result<Response, AppError>> {
        Box::pin(async move {
            match self.table.match_path(environ.path_info()) {
                Some(route) => {
                    forward::forward(&self.client, route, environ, self.timeout, self.max_body).await
                }
                None => self.fallback.call(environ).await,
            }
        })
    }
}
