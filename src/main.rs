//! devserve command line.
//!
//! ```text
//! devserve serve [--config devserve.toml] [--host H] [--port P] [--reload] ...
//! devserve gen-cert ./dev --host localhost
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use devserve::app::{Application, EchoEnviron, Fixed};
use devserve::config::{load_config, LogFormat, ProxyRouteConfig, ReloaderKind, ServerConfig, TlsConfig};
use devserve::net::tls::generate_dev_cert;
use devserve::observability::logging;
use devserve::proxy::ProxyMiddleware;

#[derive(Parser)]
#[command(name = "devserve")]
#[command(about = "Development HTTP server with live reload", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve an application
    Serve(ServeArgs),
    /// Write a development certificate and key
    GenCert {
        /// Output base path; writes <BASE>.crt and <BASE>.key
        base: PathBuf,

        #[arg(long, default_value = "localhost")]
        host: String,
    },
}

#[derive(clap::Args)]
struct ServeArgs {
    /// TOML configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Interface to bind, or unix://<path>
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to bind (0 picks a free port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Restart the server when watched files change
    #[arg(long)]
    reload: bool,

    #[arg(long, value_enum)]
    reloader_type: Option<ReloaderArg>,

    /// Extra files that trigger a reload
    #[arg(long = "extra-file")]
    extra_files: Vec<PathBuf>,

    /// Directories watched recursively
    #[arg(long = "watch-dir")]
    watch_dirs: Vec<PathBuf>,

    /// Path prefixes ignored by the reloader
    #[arg(long = "exclude")]
    exclude_paths: Vec<PathBuf>,

    /// Serve HTTPS with a generated self-signed certificate
    #[arg(long, conflicts_with_all = ["cert", "key"])]
    adhoc: bool,

    /// Certificate chain (PEM)
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// Private key (PEM)
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Proxy route, PREFIX=URL (repeatable)
    #[arg(long = "proxy", value_parser = parse_route)]
    routes: Vec<ProxyRouteConfig>,

    #[arg(long, value_enum, default_value = "echo")]
    app: AppArg,

    #[arg(long, value_enum)]
    log_format: Option<LogFormatArg>,

    /// Prometheus scrape address, e.g. 127.0.0.1:9000
    #[arg(long)]
    metrics_address: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ReloaderArg {
    Stat,
    Notify,
}

#[derive(Clone, Copy, ValueEnum)]
enum AppArg {
    /// Respond with the request environment as JSON
    Echo,
    /// Forward configured prefixes, 404 for everything else
    Proxy,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Full,
    Compact,
    Pretty,
    Json,
}

fn parse_route(value: &str) -> Result<ProxyRouteConfig, String> {
    let (prefix, target) = value
        .split_once('=')
        .ok_or_else(|| format!("expected PREFIX=URL, got {value:?}"))?;
    Ok(ProxyRouteConfig {
        prefix: prefix.to_string(),
        target: target.to_string(),
        host: None,
        preserve_host: false,
        remove_prefix: false,
        headers: Default::default(),
    })
}

impl ServeArgs {
    fn into_config(self) -> Result<(ServerConfig, AppArg), Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ServerConfig::default(),
        };

        if let Some(host) = self.host {
            config.hostname = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.reload {
            config.use_reloader = true;
        }
        if let Some(kind) = self.reloader_type {
            config.reloader.kind = match kind {
                ReloaderArg::Stat => ReloaderKind::Stat,
                ReloaderArg::Notify => ReloaderKind::Notify,
            };
        }
        config.reloader.extra_files.extend(self.extra_files);
        config.reloader.watch_dirs.extend(self.watch_dirs);
        config.reloader.exclude_paths.extend(self.exclude_paths);

        if self.adhoc {
            config.tls = TlsConfig::Adhoc;
        } else if let (Some(cert_path), Some(key_path)) = (self.cert, self.key) {
            config.tls = TlsConfig::Files { cert_path, key_path };
        }

        config.proxy.extend(self.routes);
        if let Some(format) = self.log_format {
            config.observability.log_format = match format {
                LogFormatArg::Full => LogFormat::Full,
                LogFormatArg::Compact => LogFormat::Compact,
                LogFormatArg::Pretty => LogFormat::Pretty,
                LogFormatArg::Json => LogFormat::Json,
            };
        }
        if self.metrics_address.is_some() {
            config.observability.metrics_address = self.metrics_address;
        }

        Ok((config, self.app))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let (config, app) = args.into_config()?;
            logging::init(config.observability.log_format)?;

            tracing::info!(
                hostname = %config.hostname,
                port = config.port,
                reloader = config.use_reloader,
                tls = config.tls.is_enabled(),
                proxy_routes = config.proxy.len(),
                "devserve v{} starting",
                env!("CARGO_PKG_VERSION")
            );

            let app: Box<dyn Application> = match app {
                AppArg::Echo => Box::new(EchoEnviron::new(config.limits.max_body_size)),
                AppArg::Proxy => Box::new(
                    ProxyMiddleware::new(Fixed::not_found(), &config.proxy)?
                        .with_max_body(config.limits.max_body_size),
                ),
            };

            devserve::run_simple(config, app).await?;
        }
        Commands::GenCert { base, host } => {
            let (cert, key) = generate_dev_cert(&base, &host)?;
            println!("Certificate: {}", cert.display());
            println!("Private key: {}", key.display());
        }
    }

    Ok(())
}
