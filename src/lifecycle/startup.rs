//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration
//! - Decide whether this process serves, supervises, or is a reload worker
//! - Bind (or adopt) the listener and begin accepting traffic
//! - Install the metrics exporter and signal handlers
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - The supervisor never loads the application; only workers serve
//! - Listeners start last (traffic only when ready)

use std::net::SocketAddr;

use crate::app::Application;
use crate::config::{validate_config, ConfigError, ServerConfig};
use crate::http::{BoundServer, HttpServer};
use crate::lifecycle::signals::spawn_signal_handler;
use crate::lifecycle::Shutdown;
use crate::net::{BindError, ListenTarget, StdListener, TlsMode};
use crate::observability::metrics;
use crate::reload::{self, ReloadError};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Reload(#[from] ReloadError),

    #[error("invalid metrics address {0:?}")]
    MetricsAddress(String),

    #[error("failed to install metrics exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

/// What this process does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Serve directly.
    Standalone,
    /// Hold the socket and restart workers on change.
    Supervisor,
    /// Serve on the socket inherited from a supervisor.
    Worker,
}

impl Role {
    pub fn detect(config: &ServerConfig) -> Self {
        if reload::is_running_from_reloader() {
            Role::Worker
        } else if config.use_reloader {
            Role::Supervisor
        } else {
            Role::Standalone
        }
    }
}

/// Serve `app` according to `config` until a termination signal.
pub async fn run_simple<A>(config: ServerConfig, app: A) -> Result<(), StartupError>
where
    A: Application + 'static,
{
    run_simple_with_tls(config, app, None).await
}

/// Like [`run_simple`], with a TLS mode that overrides `config.tls`
/// (e.g. a caller-owned rustls configuration).
pub async fn run_simple_with_tls<A>(
    config: ServerConfig,
    app: A,
    tls: Option<TlsMode>,
) -> Result<(), StartupError>
where
    A: Application + 'static,
{
    validate_config(&config).map_err(ConfigError::Validation)?;

    let role = Role::detect(&config);
    tracing::debug!(?role, "Process role");

    let shutdown = Shutdown::new();
    if role == Role::Supervisor {
        return supervise(&config, shutdown).await;
    }

    if let Some(addr) = &config.observability.metrics_address {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| StartupError::MetricsAddress(addr.clone()))?;
        metrics::install_exporter(addr)?;
    }

    let mut server = HttpServer::new(config, app);
    if let Some(tls) = tls {
        server = server.with_tls_mode(tls);
    }
    let server = bind(server, role)?;

    if role == Role::Standalone {
        banner(&server.url());
    }

    spawn_signal_handler(shutdown.clone());
    server.run(shutdown.subscribe()).await?;
    tracing::info!("Shutdown complete");
    Ok(())
}

fn bind(server: HttpServer, role: Role) -> Result<BoundServer, StartupError> {
    #[cfg(unix)]
    if role == Role::Worker {
        if let Some(fd) = reload::inherited_fd()? {
            // SAFETY: the supervisor hands down its own listening socket and
            // nothing else in this process has taken ownership of it.
            let listener = unsafe { StdListener::from_raw_fd(fd) }?;
            tracing::debug!(fd, "Adopted listening socket from reloader");
            return Ok(server.from_std(listener)?);
        }
        tracing::warn!("Running as reload worker without an inherited socket; binding directly");
    }
    #[cfg(not(unix))]
    let _ = role;

    Ok(server.bind()?)
}

#[cfg(unix)]
async fn supervise(config: &ServerConfig, shutdown: Shutdown) -> Result<(), StartupError> {
    use crate::reload::{Supervisor, WorkerCommand};

    let target = ListenTarget::parse(&config.hostname, config.port);
    let listener = StdListener::bind(&target)?;
    let bound = listener.local_addr()?;
    banner(&bound.url(config.scheme()));

    let supervisor = Supervisor::new(&config.reloader, listener, WorkerCommand::current_process()?)?;
    spawn_signal_handler(shutdown.clone());
    let restarts = supervisor.run(shutdown.subscribe()).await?;
    tracing::info!(restarts, "Reloader stopped");
    Ok(())
}

#[cfg(not(unix))]
async fn supervise(_config: &ServerConfig, _shutdown: Shutdown) -> Result<(), StartupError> {
    Err(ReloadError::Unsupported.into())
}

fn banner(url: &str) {
    tracing::warn!("This is a development server. Do not use it in a production deployment.");
    tracing::info!(url, "Running on {url} (Press CTRL+C to quit)");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::Fixed;

    #[test]
    fn role_follows_config() {
        // The test process is never a reload worker.
        let mut config = ServerConfig::default();
        assert_eq!(Role::detect(&config), Role::Standalone);
        config.use_reloader = true;
        assert_eq!(Role::detect(&config), Role::Supervisor);
    }

    #[tokio::test]
    async fn invalid_config_fails_fast() {
        let config = ServerConfig {
            port: 8080,
            hostname: String::new(),
            ..ServerConfig::default()
        };
        let err = run_simple(config, Fixed::not_found()).await.unwrap_err();
        assert!(matches!(err, StartupError::Config(ConfigError::Validation(_))));
    }

    #[tokio::test]
    async fn bad_metrics_address_is_reported() {
        let mut config = ServerConfig::default();
        config.port = 0;
        config.observability.metrics_address = Some("not-an-address".into());
        let err = run_simple(config, Fixed::not_found()).await.unwrap_err();
        assert!(matches!(err, StartupError::MetricsAddress(_)));
    }
}
