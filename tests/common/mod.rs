//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use devserve::app::{AppError, Application, EchoEnviron};
use devserve::config::ServerConfig;
use devserve::http::{BoundServer, Environ, HttpServer, Response};
use devserve::lifecycle::Shutdown;
use devserve::net::BoundAddr;

/// A server running in-process on an OS-assigned port.
pub struct TestServer {
    pub url: String,
    pub addr: BoundAddr,
    shutdown: Shutdown,
    task: JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    pub async fn start(config: ServerConfig, app: impl Application + 'static) -> Self {
        Self::start_server(HttpServer::new(config, app)).await
    }

    pub async fn start_server(server: HttpServer) -> Self {
        Self::start_bound(server.bind().expect("bind test server")).await
    }

    pub async fn start_bound(bound: BoundServer) -> Self {
        let url = bound.url();
        let addr = bound.local_addr().clone();
        let shutdown = Shutdown::new();
        let task = tokio::spawn(bound.run(shutdown.subscribe()));
        Self {
            url,
            addr,
            shutdown,
            task,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        match &self.addr {
            BoundAddr::Tcp(addr) => *addr,
            other => panic!("not a TCP server: {other}"),
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.server_port()
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server stopped in time")
            .expect("server task")
            .expect("server result");
    }
}

/// Loopback config on port 0 with short timeouts.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.hostname = "127.0.0.1".into();
    config.port = 0;
    config.timeouts.read_secs = 5;
    config.timeouts.keep_alive_secs = 5;
    config.timeouts.handshake_secs = 2;
    config.timeouts.shutdown_grace_secs = 1;
    config
}

/// Echoes the environment as JSON; `/crash` fails with a secret message.
pub struct TestApp {
    echo: EchoEnviron,
}

pub const SECRET: &str = "connection string postgres://admin:hunter2@db";

pub fn test_app() -> TestApp {
    TestApp {
        echo: EchoEnviron::default(),
    }
}

impl Application for TestApp {
    fn call<'a>(&'a self, environ: &'a mut Environ<'_>) -> BoxFuture<'a, Result<Response, AppError>> {
        if environ.path_info() == "/crash" {
            return Box::pin(async { Err(SECRET.into()) });
        }
        self.echo.call(environ)
    }
}

/// A parsed HTTP/1.1 response.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("JSON body")
    }
}

/// Split a raw response stream into responses framed by Content-Length.
pub fn parse_responses(mut raw: &[u8]) -> Vec<RawResponse> {
    let mut responses = Vec::new();
    while !raw.is_empty() {
        let end = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("complete response head");
        let head = String::from_utf8_lossy(&raw[..end]).into_owned();
        let mut lines = head.split("\r\n");
        let status = lines
            .next()
            .and_then(|line| line.split(' ').nth(1))
            .and_then(|code| code.parse().ok())
            .expect("status line");
        let headers: Vec<(String, String)> = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
            .collect();
        let rest = &raw[end + 4..];
        let length = headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
            .map(|(_, v)| v.parse::<usize>().expect("numeric length"))
            .unwrap_or(rest.len());
        responses.push(RawResponse {
            status,
            headers,
            body: rest[..length].to_vec(),
        });
        raw = &rest[length..];
    }
    responses
}

/// Write `request` and read until the server closes.
pub async fn exchange<S>(mut stream: S, request: &[u8]) -> Vec<u8>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request).await.unwrap();
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .expect("server closed the connection")
        .ok();
    out
}

pub async fn tcp_request(addr: SocketAddr, request: &[u8]) -> Vec<RawResponse> {
    let stream = TcpStream::connect(addr).await.unwrap();
    parse_responses(&exchange(stream, request).await)
}

#[cfg(unix)]
pub async fn unix_request(path: &std::path::Path, request: &[u8]) -> Vec<RawResponse> {
    let stream = tokio::net::UnixStream::connect(path).await.unwrap();
    parse_responses(&exchange(stream, request).await)
}

/// HTTPS client that accepts self-signed certificates.
pub fn insecure_client() -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// Collects `tracing` output from the current thread.
///
/// `#[tokio::test]` runs server tasks on the test thread, so a thread-local
/// default subscriber sees everything the server logs.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    /// Lines logged at `level` ("WARN", "ERROR", ...).
    pub fn lines_at(&self, level: &str) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|line| line.split_whitespace().nth(1) == Some(level))
            .map(str::to_string)
            .collect()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
