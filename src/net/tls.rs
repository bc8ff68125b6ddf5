//! TLS configuration, certificate loading and handshakes.
//!
//! # Responsibilities
//! - Build the shared rustls context before the first accept
//! - Generate self-signed certificates for adhoc mode and `gen-cert`
//! - Run the per-connection handshake under a deadline
//!
//! # Design Decisions
//! - A missing or invalid certificate fails at bind time, never on first connection
//! - The ring provider is selected explicitly so no process-wide default is needed
//! - Handshake failures are returned as values; the caller closes silently

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;

/// Errors building a TLS context.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("invalid certificate or key: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),
}

/// Errors during a single connection's handshake.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("TLS handshake failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS handshake timed out after {0:?}")]
    TimedOut(Duration),
}

/// How the listener secures connections.
#[derive(Clone, Default)]
pub enum TlsMode {
    #[default]
    None,
    /// Generate a self-signed certificate at startup.
    Adhoc,
    /// Load certificate chain and key from PEM files.
    Files { cert_path: PathBuf, key_path: PathBuf },
    /// Caller-owned rustls configuration.
    Custom(Arc<ServerConfig>),
}

impl std::fmt::Debug for TlsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsMode::None => f.write_str("None"),
            TlsMode::Adhoc => f.write_str("Adhoc"),
            TlsMode::Files { cert_path, key_path } => f
                .debug_struct("Files")
                .field("cert_path", cert_path)
                .field("key_path", key_path)
                .finish(),
            TlsMode::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl From<&TlsConfig> for TlsMode {
    fn from(config: &TlsConfig) -> Self {
        match config {
            TlsConfig::None => TlsMode::None,
            TlsConfig::Adhoc => TlsMode::Adhoc,
            TlsConfig::Files { cert_path, key_path } => TlsMode::Files {
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
            },
        }
    }
}

/// Shared, read-only TLS context for all connections of a listener.
#[derive(Clone)]
pub struct TlsContext {
    acceptor: TlsAcceptor,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext").finish_non_exhaustive()
    }
}

impl TlsContext {
    /// Build the context for a mode. Returns `None` for plain HTTP.
    pub fn build(mode: &TlsMode) -> Result<Option<Self>, TlsError> {
        let context = match mode {
            TlsMode::None => return Ok(None),
            TlsMode::Adhoc => Self::adhoc()?,
            TlsMode::Files { cert_path, key_path } => Self::from_pem_files(cert_path, key_path)?,
            TlsMode::Custom(config) => Self::from_config(Arc::clone(config)),
        };
        Ok(Some(context))
    }

    /// Self-signed context owned by this process for its lifetime.
    pub fn adhoc() -> Result<Self, TlsError> {
        let CertifiedKey { cert, signing_key } =
            generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()])?;
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));

        tracing::debug!("Generated adhoc self-signed certificate");
        Ok(Self::from_config(Arc::new(server_config(
            vec![cert.der().clone()],
            key,
        )?)))
    }

    /// Load certificate and key from PEM files.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;
        Ok(Self::from_config(Arc::new(server_config(certs, key)?)))
    }

    /// Wrap a caller-supplied rustls configuration.
    pub fn from_config(config: Arc<ServerConfig>) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
        }
    }

    /// Run the server side of the handshake, bounded by `timeout`.
    pub async fn accept<S>(&self, stream: S, timeout: Duration) -> Result<TlsStream<S>, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match tokio::time::timeout(timeout, self.acceptor.accept(stream)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(HandshakeError::TimedOut(timeout)),
        }
    }
}

fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig, TlsError> {
    let mut config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = read_file(path)?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = read_file(path)?;
    rustls_pemfile::private_key(&mut BufReader::new(pem.as_slice()))
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Write a development certificate and key for `host`.
///
/// Files are named `<base>.crt` and `<base>.key`; their paths are returned.
pub fn generate_dev_cert(base: &Path, host: &str) -> Result<(PathBuf, PathBuf), TlsError> {
    let CertifiedKey { cert, signing_key } =
        generate_simple_self_signed(vec![host.to_string(), format!("*.{host}")])?;

    let cert_path = with_suffix(base, "crt");
    let key_path = with_suffix(base, "key");

    for (path, contents) in [
        (&cert_path, cert.pem()),
        (&key_path, signing_key.serialize_pem()),
    ] {
        std::fs::write(path, contents).map_err(|source| TlsError::Io {
            path: path.clone(),
            source,
        })?;
    }

    tracing::info!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        host,
        "Generated development certificate"
    );
    Ok((cert_path, key_path))
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}
