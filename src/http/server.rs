//! HTTP server: accept loop and per-connection state machine.
//!
//! # Responsibilities
//! - Accept connections until shutdown, optionally through TLS
//! - Parse requests, dispatch to the application, write responses
//! - Persist connections when both sides allow it
//! - Isolate application, protocol and TLS failures to their connection
//!
//! # Connection States
//! ```text
//! Accepted → (Handshaking) → ReadingRequest → Dispatching → WritingResponse
//!     → ReadingRequest (persist) | Closed
//! ```
//!
//! # Design Decisions
//! - Every read and write runs under a deadline; a stalled peer never holds a task forever
//! - Application errors and panics become a generic 500; detail goes to the log only
//! - Handshake failures and TLS-on-plaintext close silently (debug log)

use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::sync::broadcast;
use tokio::time::Sleep;
use tracing::Instrument;
use uuid::Uuid;

use crate::app::{Application, ApplicationFault};
use crate::config::ServerConfig;
use crate::http::environ::InputError;
use crate::http::request::{build_environ, read_head, BodyFraming, ConnectionInfo, ParseError, RequestHead};
use crate::http::response::{prepare, Response, ResponseContext, ResponseError, WriteOutcome};
use crate::http::chunked::ChunkedError;
use crate::net::{
    BindError, BoundAddr, ConnectionGuard, ConnectionState, ConnectionTracker, ListenTarget, Listener,
    PeerAddr, StdListener, TlsContext, TlsMode,
};
use crate::observability::metrics;

/// First byte of a TLS handshake record.
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Unread request body discarded before a connection is reused.
const DRAIN_LIMIT: u64 = 64 * 1024;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// HTTP server for a hosted application.
pub struct HttpServer {
    config: ServerConfig,
    app: Arc<dyn Application>,
    tls: TlsMode,
}

impl HttpServer {
    /// Create a server; TLS follows `config.tls` unless overridden.
    pub fn new<A>(config: ServerConfig, app: A) -> Self
    where
        A: Application + 'static,
    {
        let tls = TlsMode::from(&config.tls);
        Self {
            config,
            app: Arc::new(app),
            tls,
        }
    }

    /// Override the TLS mode, e.g. with a caller-owned rustls configuration.
    pub fn with_tls_mode(mut self, mode: TlsMode) -> Self {
        self.tls = mode;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured listen target.
    ///
    /// The TLS context is built first, so a bad certificate fails before
    /// any socket exists.
    pub fn bind(self) -> Result<BoundServer, BindError> {
        let tls = TlsContext::build(&self.tls)?;
        let target = ListenTarget::parse(&self.config.hostname, self.config.port);
        let listener = Listener::bind(&target, self.config.limits.max_connections)?;
        Ok(self.finish(listener, tls))
    }

    /// Serve on an already-bound socket, e.g. one inherited from the reloader.
    pub fn from_std(self, listener: StdListener) -> Result<BoundServer, BindError> {
        let tls = TlsContext::build(&self.tls)?;
        let listener = Listener::from_std(listener, self.config.limits.max_connections)?;
        Ok(self.finish(listener, tls))
    }

    fn finish(self, listener: Listener, tls: Option<TlsContext>) -> BoundServer {
        let url_scheme = if tls.is_some() { "https" } else { "http" };
        let shared = Arc::new(Shared {
            app: self.app,
            local_addr: listener.local_addr().clone(),
            url_scheme,
            config: self.config,
        });
        BoundServer {
            listener,
            tls,
            shared,
            tracker: ConnectionTracker::new(),
        }
    }
}

/// State shared by every connection of one server.
struct Shared {
    app: Arc<dyn Application>,
    config: ServerConfig,
    local_addr: BoundAddr,
    url_scheme: &'static str,
}

/// A server with a bound listener, ready to run.
pub struct BoundServer {
    listener: Listener,
    tls: Option<TlsContext>,
    shared: Arc<Shared>,
    tracker: ConnectionTracker,
}

impl BoundServer {
    /// The address actually bound (port 0 resolved).
    pub fn local_addr(&self) -> &BoundAddr {
        &self.shared.local_addr
    }

    /// Base URL for clients, e.g. `https://127.0.0.1:41234`.
    pub fn url(&self) -> String {
        self.shared.local_addr.url(self.shared.url_scheme)
    }

    pub fn url_scheme(&self) -> &'static str {
        self.shared.url_scheme
    }

    /// Connection tracker, for observing live connections.
    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept connections until `shutdown` fires, then wait for in-flight
    /// connections up to the shutdown grace period.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> io::Result<()> {
        let BoundServer {
            listener,
            tls,
            shared,
            tracker,
        } = self;

        tracing::info!(
            address = %shared.local_addr,
            scheme = shared.url_scheme,
            "HTTP server starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, no longer accepting");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        let guard = tracker.track();
                        let shared = Arc::clone(&shared);
                        let tls = tls.clone();
                        let shutdown = shutdown.resubscribe();
                        tokio::spawn(async move {
                            let _permit = permit;
                            handle_connection(stream, peer, tls, shared, guard, shutdown).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                    }
                },
            }
        }

        drop(listener);

        let grace = shared.config.timeouts.shutdown_grace();
        if !tracker.wait_for_idle(grace).await {
            tracing::warn!(
                remaining = tracker.active_count(),
                grace_secs = grace.as_secs(),
                "Shutdown grace period elapsed with connections still open"
            );
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    peer: PeerAddr,
    tls: Option<TlsContext>,
    shared: Arc<Shared>,
    guard: ConnectionGuard,
    shutdown: broadcast::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let span = tracing::debug_span!("connection", connection_id = %guard.id(), peer = %peer);

    async move {
        match tls {
            Some(tls) => {
                tracing::trace!(state = ?ConnectionState::Handshaking, "Connection state");
                match tls.accept(stream, shared.config.timeouts.handshake()).await {
                    Ok(stream) => serve_connection(stream, peer, true, &shared, shutdown).await,
                    Err(e) => tracing::debug!(error = %e, "TLS handshake failed"),
                }
            }
            None => serve_connection(stream, peer, false, &shared, shutdown).await,
        }
        tracing::trace!(state = ?ConnectionState::Closed, "Connection state");
    }
    .instrument(span)
    .await;

    drop(guard);
}

/// What arrived at the start of a request cycle.
enum Incoming {
    Request(RequestHead),
    Closed,
    TlsOnPlaintext,
}

async fn next_request<R>(
    conn: &mut R,
    check_tls: bool,
    shared: &Shared,
) -> Result<Incoming, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    if check_tls {
        let buf = conn.fill_buf().await?;
        if buf.first() == Some(&TLS_HANDSHAKE_RECORD) {
            return Ok(Incoming::TlsOnPlaintext);
        }
    }
    Ok(match read_head(conn, &shared.config.limits).await? {
        Some(head) => Incoming::Request(head),
        None => Incoming::Closed,
    })
}

fn shutdown_pending(shutdown: &mut broadcast::Receiver<()>) -> bool {
    !matches!(
        shutdown.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    )
}

async fn serve_connection<S>(
    stream: S,
    peer: PeerAddr,
    is_tls: bool,
    shared: &Shared,
    mut shutdown: broadcast::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut conn = BufReader::new(stream);
    let timeouts = &shared.config.timeouts;
    let mut served = 0u64;

    loop {
        tracing::trace!(state = ?ConnectionState::ReadingRequest, "Connection state");
        let first = served == 0;
        let idle = if first { timeouts.read() } else { timeouts.keep_alive() };

        let incoming = tokio::select! {
            biased;
            _ = shutdown.recv(), if !first => {
                tracing::debug!("Closing idle connection for shutdown");
                break;
            }
            incoming = tokio::time::timeout(idle, next_request(&mut conn, first && !is_tls, shared)) => incoming,
        };

        let head = match incoming {
            Err(_) => {
                tracing::debug!(timeout_secs = idle.as_secs(), "Connection idle timeout");
                break;
            }
            Ok(Ok(Incoming::Request(head))) => head,
            Ok(Ok(Incoming::Closed)) => break,
            Ok(Ok(Incoming::TlsOnPlaintext)) => {
                tracing::debug!("TLS handshake received on a plaintext listener");
                break;
            }
            Ok(Err(e)) => {
                reject(&mut conn, &e, None, peer, shared).await;
                break;
            }
        };

        let keep_alive = !shutdown_pending(&mut shutdown);
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("request", request_id = %request_id);

        let persist = handle_request(&mut conn, head, peer, shared, keep_alive)
            .instrument(span)
            .await;
        served += 1;

        if !persist {
            break;
        }
    }

    let _ = conn.get_mut().shutdown().await;
}

/// Answer an unparseable request, when it deserves an answer.
///
/// When the head itself parsed, the answer matches its version and method.
async fn reject<S>(
    conn: &mut BufReader<S>,
    error: &ParseError,
    head: Option<&RequestHead>,
    peer: PeerAddr,
    shared: &Shared,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(status) = error.status() else {
        tracing::debug!(error = %error, "Connection closed mid-request");
        return;
    };

    tracing::info!(client = %peer, status = status.as_u16(), error = %error, "Rejected malformed request");
    metrics::record_request(head.map_or("-", |h| h.method.as_str()), status.as_u16(), Instant::now());

    let ctx = ResponseContext {
        version: head.map_or(Version::HTTP_11, |h| h.version),
        method: head
            .and_then(|h| Method::from_bytes(h.method.as_bytes()).ok())
            .unwrap_or(Method::GET),
        keep_alive: false,
    };
    if let Err(e) = send(conn.get_mut(), Response::error_page(status), &ctx, shared).await {
        tracing::debug!(error = %e, "Failed to send error response");
    }
}

/// Run one request through the application. Returns whether to persist.
async fn handle_request<S>(
    conn: &mut BufReader<S>,
    head: RequestHead,
    peer: PeerAddr,
    shared: &Shared,
    keep_alive_allowed: bool,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let start = Instant::now();
    let timeouts = &shared.config.timeouts;
    let mut keep_alive = keep_alive_allowed && head.wants_keep_alive();
    let method = Method::from_bytes(head.method.as_bytes()).unwrap_or_default();

    let framing = match head.framing(shared.config.limits.max_body_size) {
        Ok(framing) => framing,
        Err(e) => {
            reject(conn, &e, Some(&head), peer, shared).await;
            return false;
        }
    };

    if head.expects_continue() && framing != BodyFraming::None {
        let interim = async {
            let writer = conn.get_mut();
            writer.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
            writer.flush().await
        };
        match tokio::time::timeout(timeouts.write(), interim).await {
            Ok(Ok(())) => {}
            _ => return false,
        }
    }

    let info = ConnectionInfo {
        server: &shared.local_addr,
        peer,
        url_scheme: shared.url_scheme,
        limits: &shared.config.limits,
    };

    let response = {
        let mut reader = TimedReader::new(&mut *conn, timeouts.read());
        let mut environ = match build_environ(&head, &mut reader, info) {
            Ok(environ) => environ,
            Err(e) => {
                drop(reader);
                reject(conn, &e, Some(&head), peer, shared).await;
                return false;
            }
        };

        tracing::trace!(state = ?ConnectionState::Dispatching, "Connection state");
        let is_readiness = shared
            .config
            .readiness_path
            .as_deref()
            .is_some_and(|path| path == environ.path_info());

        let response = if is_readiness {
            Response::text(StatusCode::OK, std::process::id().to_string())
        } else {
            let outcome = AssertUnwindSafe(shared.app.call(&mut environ))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(response)) => response,
                Ok(Err(error)) => {
                    keep_alive = false;
                    match error.downcast_ref::<InputError>() {
                        Some(input) => {
                            tracing::info!(error = %input, "Request body could not be read");
                            Response::error_page(input_error_status(input))
                        }
                        None => {
                            let fault = ApplicationFault::Failed(error);
                            tracing::error!(error = %fault, "Application error");
                            Response::error_page(StatusCode::INTERNAL_SERVER_ERROR)
                        }
                    }
                }
                Err(panic) => {
                    keep_alive = false;
                    let fault = ApplicationFault::from_panic(panic);
                    tracing::error!(error = %fault, "Application error");
                    Response::error_page(StatusCode::INTERNAL_SERVER_ERROR)
                }
            }
        };

        if keep_alive {
            match environ.input().drain(DRAIN_LIMIT).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!("Unread request body too large to drain, closing after response");
                    keep_alive = false;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Request body failed while draining");
                    keep_alive = false;
                }
            }
        }
        response
    };

    tracing::trace!(state = ?ConnectionState::WritingResponse, "Connection state");
    let ctx = ResponseContext {
        version: head.version,
        method,
        keep_alive,
    };

    match send(conn.get_mut(), response, &ctx, shared).await {
        Ok(outcome) => {
            let status = outcome.status.as_u16();
            tracing::info!(
                client = %peer,
                status,
                bytes = outcome.body_bytes,
                duration_ms = start.elapsed().as_millis() as u64,
                "\"{}\" {}",
                head.request_line(),
                status
            );
            metrics::record_request(&head.method, status, start);
            outcome.reusable
        }
        Err(ResponseError::Io(e)) => {
            tracing::debug!(error = %e, "Client connection lost while writing response");
            false
        }
        Err(e) => {
            tracing::error!(error = %e, request = %head.request_line(), "Response aborted");
            false
        }
    }
}

fn input_error_status(error: &InputError) -> StatusCode {
    match error {
        InputError::TooLarge { .. } | InputError::Chunked(ChunkedError::TooLarge { .. }) => {
            StatusCode::PAYLOAD_TOO_LARGE
        }
        _ => StatusCode::BAD_REQUEST,
    }
}

/// Validate and write a response under the write timeout.
///
/// An invalid response (declared length mismatch) is replaced by a 500 as
/// long as nothing has been written yet.
async fn send<W>(
    writer: &mut W,
    response: Response,
    ctx: &ResponseContext,
    shared: &Shared,
) -> Result<WriteOutcome, ResponseError>
where
    W: AsyncWrite + Unpin,
{
    let prepared = match prepare(response, ctx) {
        Ok(prepared) => prepared,
        Err(e) if e.before_head() => {
            let fault = ApplicationFault::InvalidResponse(e);
            tracing::error!(error = %fault, "Application error");
            let ctx = ResponseContext {
                keep_alive: false,
                ..ctx.clone()
            };
            prepare(Response::error_page(StatusCode::INTERNAL_SERVER_ERROR), &ctx)?
        }
        Err(e) => return Err(e),
    };

    let timeout = shared.config.timeouts.write();
    match tokio::time::timeout(timeout, prepared.write_to(writer)).await {
        Ok(result) => result,
        Err(_) => Err(ResponseError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "response write timed out",
        ))),
    }
}

/// Buffered reader whose reads fail once no progress is made for `timeout`.
struct TimedReader<R> {
    inner: R,
    timeout: Duration,
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl<R> TimedReader<R> {
    fn new(inner: R, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            sleep: Box::pin(tokio::time::sleep(timeout)),
            armed: false,
        }
    }
}

/// Poll the stall deadline, arming it on the first pending read.
fn poll_deadline(
    sleep: &mut Pin<Box<Sleep>>,
    armed: &mut bool,
    timeout: Duration,
    cx: &mut Context<'_>,
) -> Poll<io::Error> {
    if !*armed {
        sleep.as_mut().reset(tokio::time::Instant::now() + timeout);
        *armed = true;
    }
    sleep.as_mut().poll(cx).map(|()| {
        io::Error::new(io::ErrorKind::TimedOut, "timed out reading request body")
    })
}

impl<R: AsyncRead + Unpin> AsyncRead for TimedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let TimedReader {
            inner,
            timeout,
            sleep,
            armed,
        } = self.get_mut();
        match Pin::new(inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                *armed = false;
                Poll::Ready(result)
            }
            Poll::Pending => poll_deadline(sleep, armed, *timeout, cx).map(Err),
        }
    }
}

impl<R: AsyncBufRead + Unpin> AsyncBufRead for TimedReader<R> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let TimedReader {
            inner,
            timeout,
            sleep,
            armed,
        } = self.get_mut();
        match Pin::new(inner).poll_fill_buf(cx) {
            Poll::Ready(result) => {
                *armed = false;
                Poll::Ready(result)
            }
            Poll::Pending => poll_deadline(sleep, armed, *timeout, cx).map(Err),
        }
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        Pin::new(&mut self.get_mut().inner).consume(amt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppError, FnApp};
    use crate::http::environ::Environ;
    use futures_util::future::BoxFuture;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn shared_with(app: impl Application + 'static) -> Shared {
        let mut config = ServerConfig::default();
        config.timeouts.read_secs = 2;
        config.timeouts.keep_alive_secs = 2;
        Shared {
            app: Arc::new(app),
            config,
            local_addr: BoundAddr::Tcp("127.0.0.1:5000".parse().unwrap()),
            url_scheme: "http",
        }
    }

    fn path_app() -> impl Application {
        FnApp(|environ: &Environ<'_>| {
            let path = environ.path_info().to_string();
            async move {
                if path == "/crash" {
                    return Err::<Response, AppError>("database password is hunter2".into());
                }
                Ok(Response::text(StatusCode::OK, path))
            }
        })
    }

    struct Panics;

    impl Application for Panics {
        fn call<'a>(&'a self, _environ: &'a mut Environ<'_>) -> BoxFuture<'a, Result<Response, AppError>> {
            Box::pin(async { panic!("secret state") })
        }
    }

    /// Serve one connection over an in-memory pipe and return everything the
    /// server wrote once it closes.
    async fn exchange(shared: Shared, input: &[u8]) -> String {
        let (mut client, server): (DuplexStream, DuplexStream) = tokio::io::duplex(64 * 1024);
        let (_tx, rx) = broadcast::channel(1);
        let peer = PeerAddr::Tcp("127.0.0.1:40000".parse().unwrap());
        let task = tokio::spawn(async move {
            serve_connection(server, peer, false, &shared, rx).await;
        });

        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        task.await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn persists_across_requests() {
        let out = exchange(
            shared_with(path_app()),
            b"GET /one HTTP/1.1\r\nHost: a\r\n\r\nGET //two HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(out.contains("\r\n\r\n/one"));
        assert!(out.ends_with("\r\n\r\n/two"));
    }

    #[tokio::test]
    async fn application_error_is_generic_500() {
        let out = exchange(shared_with(path_app()), b"GET /crash HTTP/1.1\r\nHost: a\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(out.contains("Internal Server Error"));
        assert!(!out.contains("hunter2"));
    }

    #[tokio::test]
    async fn application_panic_is_generic_500() {
        let out = exchange(shared_with(Panics), b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(!out.contains("secret state"));
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let out = exchange(shared_with(path_app()), b"NONSENSE\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn readiness_path_reports_pid() {
        let out = exchange(shared_with(path_app()), b"GET /get-pid HTTP/1.1\r\nHost: a\r\n\r\n").await;
        assert!(out.ends_with(&format!("\r\n\r\n{}", std::process::id())));
    }

    #[tokio::test]
    async fn tls_client_hello_on_plaintext_closes_silently() {
        let out = exchange(shared_with(path_app()), &[0x16, 0x03, 0x01, 0x00, 0x05]).await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn expect_continue_is_acknowledged() {
        let out = exchange(
            shared_with(crate::app::EchoEnviron::default()),
            b"POST /upload HTTP/1.1\r\nHost: a\r\nExpect: 100-continue\r\nContent-Length: 3\r\nConnection: close\r\n\r\nabc",
        )
        .await;
        assert!(out.starts_with("HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\n"));
        assert!(out.contains("\"devserve.body\":\"abc\""));
    }

    #[tokio::test]
    async fn unread_body_is_drained_before_next_request() {
        let out = exchange(
            shared_with(path_app()),
            b"POST /a HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhelloGET /b HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(out.contains("\r\n\r\n/a"));
        assert!(out.ends_with("\r\n\r\n/b"));
    }

    #[tokio::test]
    async fn http10_closes_after_response() {
        let out = exchange(
            shared_with(path_app()),
            b"GET /x HTTP/1.0\r\n\r\nGET /y HTTP/1.0\r\n\r\n",
        )
        .await;
        assert!(out.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(!out.contains("/y"));
    }

    #[tokio::test]
    async fn rejection_follows_request_version_and_method() {
        let out = exchange(
            shared_with(path_app()),
            b"POST /x HTTP/1.0\r\nContent-Length: nope\r\n\r\n",
        )
        .await;
        assert!(out.starts_with("HTTP/1.0 400 Bad Request\r\n"));

        let mut shared = shared_with(path_app());
        shared.config.limits.max_body_size = 10;
        let out = exchange(shared, b"HEAD /x HTTP/1.1\r\nContent-Length: 11\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 413 "));
        assert!(out.ends_with("\r\n\r\n"), "HEAD answer carries no body: {out:?}");
    }

    #[tokio::test]
    async fn bad_chunked_body_is_400() {
        let out = exchange(
            shared_with(crate::app::EchoEnviron::default()),
            b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n",
        )
        .await;
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_reader_fails_on_stall() {
        let (_client, server) = tokio::io::duplex(64);
        let mut reader = TimedReader::new(BufReader::new(server), Duration::from_secs(1));
        let err = reader.fill_buf().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
