//! Listen target resolution and the bounded accept loop.
//!
//! # Responsibilities
//! - Resolve `host:port`, `unix://path` and port 0 into a bound socket
//! - Remove stale unix socket files before binding, and on drop
//! - Adopt a listening socket inherited from the reload supervisor
//! - Enforce max_connections via semaphore
//! - Graceful handling of accept errors

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;

use crate::config::schema::UNIX_SCHEME;
use crate::net::tls::TlsError;

const BACKLOG: i32 = 1024;

/// Where the server listens. Exactly one addressing mode is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenTarget {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl ListenTarget {
    /// Interpret the `hostname`/`port` startup options.
    pub fn parse(hostname: &str, port: u16) -> Self {
        match hostname.strip_prefix(UNIX_SCHEME) {
            Some(path) => ListenTarget::Unix {
                path: PathBuf::from(path),
            },
            None => ListenTarget::Tcp {
                host: hostname.trim_start_matches('[').trim_end_matches(']').to_string(),
                port,
            },
        }
    }
}

impl fmt::Display for ListenTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenTarget::Tcp { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            ListenTarget::Tcp { host, port } => write!(f, "{host}:{port}"),
            ListenTarget::Unix { path } => write!(f, "{UNIX_SCHEME}{}", path.display()),
        }
    }
}

/// Error type for binding a listener.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("invalid listen address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("address {addr} is already in use")]
    AddrInUse { addr: String },

    #[error("permission denied binding {addr}")]
    PermissionDenied { addr: String },

    #[error("{path} exists and is not a socket")]
    PathExists { path: PathBuf },

    #[error("failed to bind {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("inherited socket descriptor {fd} is unusable: {reason}")]
    Inherited { fd: i32, reason: String },

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

impl BindError {
    fn from_io(addr: impl Into<String>, source: io::Error) -> Self {
        let addr = addr.into();
        match source.kind() {
            io::ErrorKind::AddrInUse => BindError::AddrInUse { addr },
            io::ErrorKind::PermissionDenied => BindError::PermissionDenied { addr },
            _ => BindError::Io { addr, source },
        }
    }
}

/// The address a listener is actually bound to.
///
/// This is the only source for `SERVER_NAME` and `SERVER_PORT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl BoundAddr {
    pub fn server_name(&self) -> String {
        match self {
            BoundAddr::Tcp(addr) => addr.ip().to_string(),
            BoundAddr::Unix(path) => path.display().to_string(),
        }
    }

    pub fn server_port(&self) -> u16 {
        match self {
            BoundAddr::Tcp(addr) => addr.port(),
            BoundAddr::Unix(_) => 0,
        }
    }

    /// Base URL clients use, for a given scheme ("http"/"https").
    pub fn url(&self, scheme: &str) -> String {
        match self {
            BoundAddr::Tcp(addr) => format!("{scheme}://{addr}"),
            BoundAddr::Unix(path) => format!("{UNIX_SCHEME}{}", path.display()),
        }
    }
}

impl fmt::Display for BoundAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundAddr::Tcp(addr) => write!(f, "{addr}"),
            BoundAddr::Unix(path) => write!(f, "{UNIX_SCHEME}{}", path.display()),
        }
    }
}

/// The remote end of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddr {
    Tcp(SocketAddr),
    /// Unix domain socket peers are unnamed.
    Local,
}

impl PeerAddr {
    pub fn ip(&self) -> String {
        match self {
            PeerAddr::Tcp(addr) => addr.ip().to_string(),
            PeerAddr::Local => "<local>".to_string(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            PeerAddr::Tcp(addr) => addr.port(),
            PeerAddr::Local => 0,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Tcp(addr) => write!(f, "{addr}"),
            PeerAddr::Local => f.write_str("<local>"),
        }
    }
}

/// A bound, listening std socket not yet registered with the runtime.
///
/// The reload supervisor holds one of these for the whole session and hands
/// its descriptor to each worker.
#[derive(Debug)]
pub enum StdListener {
    Tcp(std::net::TcpListener),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixListener),
}

impl StdListener {
    /// Bind a target. Stale unix socket files are removed first.
    pub fn bind(target: &ListenTarget) -> Result<Self, BindError> {
        match target {
            ListenTarget::Tcp { host, port } => bind_tcp(host, *port),
            #[cfg(unix)]
            ListenTarget::Unix { path } => bind_unix(path),
            #[cfg(not(unix))]
            ListenTarget::Unix { .. } => Err(BindError::Unsupported("unix domain sockets")),
        }
    }

    /// Adopt a listening socket from an inherited descriptor.
    ///
    /// # Safety
    ///
    /// `fd` must be an open listening socket that nothing else in this
    /// process owns; ownership moves into the returned value.
    #[cfg(unix)]
    pub unsafe fn from_raw_fd(fd: std::os::fd::RawFd) -> Result<Self, BindError> {
        use std::os::fd::FromRawFd;

        let socket = Socket::from_raw_fd(fd);
        let inherited = |reason: String| BindError::Inherited { fd, reason };

        let local = socket.local_addr().map_err(|e| inherited(e.to_string()))?;
        socket
            .set_cloexec(true)
            .map_err(|e| inherited(e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| inherited(e.to_string()))?;

        if local.as_socket().is_some() {
            Ok(StdListener::Tcp(socket.into()))
        } else if local.domain() == Domain::UNIX {
            Ok(StdListener::Unix(socket.into()))
        } else {
            Err(inherited("unsupported address family".to_string()))
        }
    }

    pub fn local_addr(&self) -> io::Result<BoundAddr> {
        match self {
            StdListener::Tcp(listener) => listener.local_addr().map(BoundAddr::Tcp),
            #[cfg(unix)]
            StdListener::Unix(listener) => {
                let addr = listener.local_addr()?;
                let path = addr
                    .as_pathname()
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                Ok(BoundAddr::Unix(path))
            }
        }
    }

    /// Allow (or forbid) child processes to inherit the descriptor.
    #[cfg(unix)]
    pub fn set_inheritable(&self, inheritable: bool) -> io::Result<()> {
        let socket = match self {
            StdListener::Tcp(listener) => socket2::SockRef::from(listener),
            StdListener::Unix(listener) => socket2::SockRef::from(listener),
        };
        socket.set_cloexec(!inheritable)
    }

    #[cfg(unix)]
    pub fn as_raw_fd(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;

        match self {
            StdListener::Tcp(listener) => listener.as_raw_fd(),
            StdListener::Unix(listener) => listener.as_raw_fd(),
        }
    }
}

fn bind_tcp(host: &str, port: u16) -> Result<StdListener, BindError> {
    let display = ListenTarget::Tcp {
        host: host.to_string(),
        port,
    }
    .to_string();

    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| BindError::InvalidAddress {
            addr: display.clone(),
            reason: e.to_string(),
        })?
        .next()
        .ok_or_else(|| BindError::InvalidAddress {
            addr: display.clone(),
            reason: "host resolved to no addresses".to_string(),
        })?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| BindError::from_io(display.clone(), e))?;

    // Lets a restarted server rebind while old connections sit in TIME_WAIT.
    #[cfg(unix)]
    socket
        .set_reuse_address(true)
        .map_err(|e| BindError::from_io(display.clone(), e))?;

    socket
        .bind(&addr.into())
        .map_err(|e| BindError::from_io(display.clone(), e))?;
    socket
        .listen(BACKLOG)
        .map_err(|e| BindError::from_io(display.clone(), e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| BindError::from_io(display, e))?;

    Ok(StdListener::Tcp(socket.into()))
}

#[cfg(unix)]
fn bind_unix(path: &Path) -> Result<StdListener, BindError> {
    use std::os::unix::fs::FileTypeExt;

    let display = format!("{UNIX_SCHEME}{}", path.display());

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            tracing::debug!(path = %path.display(), "Removing stale socket file");
            std::fs::remove_file(path).map_err(|e| BindError::from_io(display.clone(), e))?;
        }
        Ok(_) => {
            return Err(BindError::PathExists {
                path: path.to_path_buf(),
            })
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(BindError::from_io(display, e)),
    }

    let listener = std::os::unix::net::UnixListener::bind(path)
        .map_err(|e| BindError::from_io(display.clone(), e))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| BindError::from_io(display, e))?;
    Ok(StdListener::Unix(listener))
}

enum Inner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// A bounded listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections will wait until a slot becomes available.
pub struct Listener {
    inner: Inner,
    local_addr: BoundAddr,
    connection_limit: Arc<Semaphore>,
    /// Socket file removed on drop, for sockets this listener created.
    cleanup: Option<PathBuf>,
}

impl Listener {
    /// Bind to a target with connection limits.
    pub fn bind(target: &ListenTarget, max_connections: usize) -> Result<Self, BindError> {
        let std_listener = StdListener::bind(target)?;
        let mut listener = Self::from_std(std_listener, max_connections)?;
        if let ListenTarget::Unix { path } = target {
            listener.cleanup = Some(path.clone());
        }
        Ok(listener)
    }

    /// Register an already-bound socket with the runtime.
    ///
    /// Socket files of adopted unix listeners are left in place on drop; the
    /// process that bound them owns the path.
    pub fn from_std(listener: StdListener, max_connections: usize) -> Result<Self, BindError> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| BindError::from_io("inherited socket", e))?;
        let display = local_addr.to_string();

        let inner = match listener {
            StdListener::Tcp(l) => {
                Inner::Tcp(TcpListener::from_std(l).map_err(|e| BindError::from_io(display, e))?)
            }
            #[cfg(unix)]
            StdListener::Unix(l) => {
                Inner::Unix(UnixListener::from_std(l).map_err(|e| BindError::from_io(display, e))?)
            }
        };

        tracing::info!(
            address = %local_addr,
            max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner,
            local_addr,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            cleanup: None,
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// This will wait if the connection limit has been reached.
    /// Returns the stream and a permit that must be held for the connection's lifetime.
    pub async fn accept(&self) -> io::Result<(Stream, PeerAddr, ConnectionPermit)> {
        // Acquire permit first (backpressure)
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| io::Error::other("connection limiter closed"))?;

        let (stream, peer) = match &self.inner {
            Inner::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                (Stream::Tcp(stream), PeerAddr::Tcp(addr))
            }
            #[cfg(unix)]
            Inner::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                (Stream::Unix(stream), PeerAddr::Local)
            }
        };

        tracing::debug!(
            peer_addr = %peer,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, peer, ConnectionPermit { _permit: permit }))
    }

    /// The address this listener is bound to.
    pub fn local_addr(&self) -> &BoundAddr {
        &self.local_addr
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(path) = self.cleanup.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!(path = %path.display(), error = %e, "Could not remove socket file");
            }
        }
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
/// Backpressure holds even if the connection task panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

/// An accepted plaintext connection.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_targets() {
        assert_eq!(
            ListenTarget::parse("127.0.0.1", 0),
            ListenTarget::Tcp {
                host: "127.0.0.1".into(),
                port: 0
            }
        );
        assert_eq!(
            ListenTarget::parse("unix:///tmp/dev.sock", 8080),
            ListenTarget::Unix {
                path: "/tmp/dev.sock".into()
            }
        );
        assert_eq!(ListenTarget::parse("[::1]", 80).to_string(), "[::1]:80");
    }

    #[tokio::test]
    async fn port_zero_resolves_to_fixed_port() {
        let listener = Listener::bind(&ListenTarget::parse("127.0.0.1", 0), 4).unwrap();
        let port = listener.local_addr().server_port();
        assert_ne!(port, 0);
        assert_eq!(listener.local_addr().server_name(), "127.0.0.1");
        assert_eq!(listener.local_addr().server_port(), port);
    }

    #[tokio::test]
    async fn port_in_use_is_reported() {
        let first = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = first.local_addr().unwrap().port();
        let err = Listener::bind(&ListenTarget::parse("127.0.0.1", port), 4)
            .err()
            .unwrap();
        assert!(matches!(err, BindError::AddrInUse { .. }), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_socket_replaces_stale_file_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let listener = Listener::bind(&ListenTarget::Unix { path: path.clone() }, 4).unwrap();
        assert_eq!(listener.local_addr(), &BoundAddr::Unix(path.clone()));
        drop(listener);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn unix_path_occupied_by_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.sock");
        std::fs::write(&path, b"not a socket").unwrap();

        let err = StdListener::bind(&ListenTarget::Unix { path }).unwrap_err();
        assert!(matches!(err, BindError::PathExists { .. }));
    }

    #[tokio::test]
    async fn accept_respects_limit() {
        let listener = Listener::bind(&ListenTarget::parse("127.0.0.1", 0), 1).unwrap();
        let BoundAddr::Tcp(addr) = listener.local_addr().clone() else {
            unreachable!()
        };
        let _client = TcpStream::connect(addr).await.unwrap();

        let (_stream, peer, permit) = listener.accept().await.unwrap();
        assert!(matches!(peer, PeerAddr::Tcp(_)));
        assert_eq!(listener.available_permits(), 0);
        drop(permit);
        assert_eq!(listener.available_permits(), 1);
    }
}
