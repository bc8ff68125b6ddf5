//! Configuration schema definitions.
//!
//! This module defines the complete startup configuration for the server.
//! All types derive Serde traits for deserialization from config files, and
//! every field has a default so a minimal (or empty) file is valid.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Prefix selecting unix domain socket mode in `hostname`.
pub const UNIX_SCHEME: &str = "unix://";

/// Root configuration for the development server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind, or `unix://<path>` for a domain socket.
    pub hostname: String,

    /// TCP port; 0 lets the OS pick a free one.
    pub port: u16,

    /// Run the worker under the reload supervisor.
    pub use_reloader: bool,

    /// Reserved path answering with the worker pid. `None` disables it.
    pub readiness_path: Option<String>,

    /// TLS settings for the listener.
    pub tls: TlsConfig,

    /// Per-connection timeouts.
    pub timeouts: TimeoutConfig,

    /// Request and connection limits.
    pub limits: LimitsConfig,

    /// Reload supervisor settings.
    pub reloader: ReloaderConfig,

    /// Logging and metrics settings.
    pub observability: ObservabilityConfig,

    /// Proxy routing table used by the proxy application.
    pub proxy: Vec<ProxyRouteConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            port: 5000,
            use_reloader: false,
            readiness_path: Some("/get-pid".to_string()),
            tls: TlsConfig::default(),
            timeouts: TimeoutConfig::default(),
            limits: LimitsConfig::default(),
            reloader: ReloaderConfig::default(),
            observability: ObservabilityConfig::default(),
            proxy: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// URL scheme clients use to reach this server.
    pub fn scheme(&self) -> &'static str {
        if self.hostname.starts_with(UNIX_SCHEME) {
            "unix"
        } else if self.tls.is_enabled() {
            "https"
        } else {
            "http"
        }
    }
}

/// TLS configuration for the listener.
///
/// A caller-owned `rustls::ServerConfig` cannot be expressed in a file; it is
/// passed through [`crate::net::tls::TlsMode::Custom`] instead.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum TlsConfig {
    /// Plain HTTP.
    #[default]
    None,
    /// Self-signed certificate generated at startup.
    Adhoc,
    /// Certificate and key loaded from PEM files.
    Files {
        /// Path to certificate chain file (PEM).
        cert_path: PathBuf,
        /// Path to private key file (PEM).
        key_path: PathBuf,
    },
}

impl TlsConfig {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, TlsConfig::None)
    }
}

/// Timeout configuration for connection handling.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Read timeout for request heads and body reads, in seconds.
    pub read_secs: u64,

    /// Write timeout for a complete response, in seconds.
    pub write_secs: u64,

    /// TLS handshake timeout in seconds.
    pub handshake_secs: u64,

    /// Idle time allowed between requests on a persistent connection.
    pub keep_alive_secs: u64,

    /// How long in-flight connections may run after shutdown starts.
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_secs: 30,
            write_secs: 30,
            handshake_secs: 10,
            keep_alive_secs: 15,
            shutdown_grace_secs: 5,
        }
    }
}

impl TimeoutConfig {
    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }

    pub fn write(&self) -> Duration {
        Duration::from_secs(self.write_secs)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Request and connection limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Maximum request body size in bytes, declared or decoded.
    pub max_body_size: u64,

    /// Maximum number of header fields per request.
    pub max_header_count: usize,

    /// Maximum length of the request line and of each header line.
    pub max_line_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            max_body_size: 64 * 1024 * 1024, // 64MB
            max_header_count: 100,
            max_line_size: 65536,
        }
    }
}

/// How the reload supervisor detects changes.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReloaderKind {
    /// Poll modification times every interval.
    #[default]
    Stat,
    /// Filesystem events, coalesced per interval.
    Notify,
}

/// Reload supervisor configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReloaderConfig {
    pub kind: ReloaderKind,

    /// Poll interval in milliseconds.
    pub interval_ms: u64,

    /// Files watched in addition to the running executable.
    pub extra_files: Vec<PathBuf>,

    /// Directories watched recursively.
    pub watch_dirs: Vec<PathBuf>,

    /// Path prefixes never watched.
    pub exclude_paths: Vec<PathBuf>,
}

impl Default for ReloaderConfig {
    fn default() -> Self {
        Self {
            kind: ReloaderKind::Stat,
            interval_ms: 1000,
            extra_files: Vec::new(),
            watch_dirs: Vec::new(),
            exclude_paths: Vec::new(),
        }
    }
}

impl ReloaderConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
    Pretty,
    Json,
}

/// Observability settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,

    /// Prometheus scrape address (e.g., "127.0.0.1:9000"). Disabled when unset.
    pub metrics_address: Option<String>,
}

/// One entry of the proxy routing table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyRouteConfig {
    /// Path prefix to match, e.g. "/api".
    pub prefix: String,

    /// Backend base URL, e.g. "http://127.0.0.1:3000".
    pub target: String,

    /// Host header sent to the backend. Defaults to the target's host.
    #[serde(default)]
    pub host: Option<String>,

    /// Keep the client's Host header instead of rewriting it.
    #[serde(default)]
    pub preserve_host: bool,

    /// Strip the matched prefix from the forwarded path.
    #[serde(default)]
    pub remove_prefix: bool,

    /// Headers added to every forwarded request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.hostname, "127.0.0.1");
        assert_eq!(config.readiness_path.as_deref(), Some("/get-pid"));
        assert_eq!(config.tls, TlsConfig::None);
        assert_eq!(config.scheme(), "http");
    }

    #[test]
    fn tls_modes_deserialize() {
        let config: ServerConfig = toml::from_str("[tls]\nmode = \"adhoc\"\n").unwrap();
        assert_eq!(config.tls, TlsConfig::Adhoc);
        assert_eq!(config.scheme(), "https");

        let config: ServerConfig = toml::from_str(
            "[tls]\nmode = \"files\"\ncert_path = \"dev.crt\"\nkey_path = \"dev.key\"\n",
        )
        .unwrap();
        assert!(matches!(config.tls, TlsConfig::Files { .. }));
    }

    #[test]
    fn proxy_routes_deserialize() {
        let config: ServerConfig = toml::from_str(
            r#"
            [[proxy]]
            prefix = "/bar"
            target = "http://127.0.0.1:3000"
            remove_prefix = true
            headers = { "X-Special" = "bar" }
            "#,
        )
        .unwrap();
        assert_eq!(config.proxy.len(), 1);
        assert!(config.proxy[0].remove_prefix);
        assert_eq!(config.proxy[0].host, None);
        assert_eq!(config.proxy[0].headers["X-Special"], "bar");
    }

    #[test]
    fn unix_hostname_reports_unix_scheme() {
        let config = ServerConfig {
            hostname: "unix:///tmp/dev.sock".into(),
            ..Default::default()
        };
        assert_eq!(config.scheme(), "unix");
    }
}
