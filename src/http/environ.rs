//! The calling convention environment handed to applications.
//!
//! An [`Environ`] holds the CGI-style variables of one request plus the
//! request body, which streams directly off the connection it borrows.

use std::collections::BTreeMap;
use std::io;

use bytes::{Buf, Bytes};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::http::chunked::{ChunkedError, ChunkedStream};
use crate::http::SERVER_SOFTWARE;

/// The connection a request body is read from.
pub type Connection<'c> = &'c mut (dyn AsyncBufRead + Send + Unpin);

/// Errors reading a request body.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("malformed chunked body: {0}")]
    Chunked(#[from] ChunkedError),

    #[error("request body ended after {received} of {expected} bytes")]
    Truncated { expected: u64, received: u64 },

    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("I/O error reading request body: {0}")]
    Io(#[from] io::Error),
}

/// The request body.
pub enum Input<'c> {
    /// No body was declared.
    Empty,
    /// A `Content-Length` delimited body.
    Sized {
        reader: Connection<'c>,
        expected: u64,
        remaining: u64,
    },
    /// A chunked body, framed by the decoder alone.
    Chunked(ChunkedStream<Connection<'c>>),
    /// A body already in memory.
    Buffered(Bytes),
}

impl std::fmt::Debug for Input<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Input::Empty => f.write_str("Empty"),
            Input::Sized { remaining, .. } => {
                f.debug_struct("Sized").field("remaining", remaining).finish()
            }
            Input::Chunked(stream) => f
                .debug_struct("Chunked")
                .field("decoded", &stream.decoded())
                .field("terminated", &stream.is_terminated())
                .finish(),
            Input::Buffered(bytes) => f.debug_tuple("Buffered").field(&bytes.len()).finish(),
        }
    }
}

impl<'c> Input<'c> {
    /// Read body bytes into `buf`. Returns 0 at end of body.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, InputError> {
        if buf.is_empty() {
            return Ok(0);
        }

        match self {
            Input::Empty => Ok(0),
            Input::Sized {
                reader,
                expected,
                remaining,
            } => {
                if *remaining == 0 {
                    return Ok(0);
                }
                let available = reader.fill_buf().await?;
                if available.is_empty() {
                    return Err(InputError::Truncated {
                        expected: *expected,
                        received: *expected - *remaining,
                    });
                }
                let n = available
                    .len()
                    .min(buf.len())
                    .min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                buf[..n].copy_from_slice(&available[..n]);
                reader.consume(n);
                *remaining -= n as u64;
                Ok(n)
            }
            Input::Chunked(stream) => Ok(stream.read(buf).await?),
            Input::Buffered(bytes) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                bytes.advance(n);
                Ok(n)
            }
        }
    }

    /// Read the whole remaining body, failing once it exceeds `limit` bytes.
    pub async fn read_to_end(&mut self, limit: u64) -> Result<Bytes, InputError> {
        if let Input::Buffered(bytes) = self {
            if bytes.len() as u64 > limit {
                return Err(InputError::TooLarge { limit });
            }
            return Ok(std::mem::take(bytes));
        }

        let mut out = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(Bytes::from(out));
            }
            if (out.len() + n) as u64 > limit {
                return Err(InputError::TooLarge { limit });
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Discard up to `budget` unread bytes.
    ///
    /// Returns `true` when the body was fully consumed, so the connection
    /// is positioned at the next request.
    pub async fn drain(&mut self, budget: u64) -> Result<bool, InputError> {
        let mut discarded = 0u64;
        let mut buf = [0u8; 8192];
        loop {
            if self.is_exhausted() {
                return Ok(true);
            }
            if discarded >= budget {
                return Ok(false);
            }
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(true);
            }
            discarded += n as u64;
        }
    }

    /// True when nothing is left to read.
    pub fn is_exhausted(&self) -> bool {
        match self {
            Input::Empty => true,
            Input::Sized { remaining, .. } => *remaining == 0,
            Input::Chunked(stream) => stream.is_terminated(),
            Input::Buffered(bytes) => bytes.is_empty(),
        }
    }
}

/// Per-request variables and body.
#[derive(Debug)]
pub struct Environ<'c> {
    vars: BTreeMap<String, String>,
    url_scheme: &'static str,
    input_terminated: bool,
    input: Input<'c>,
}

impl<'c> Environ<'c> {
    pub(crate) fn new(
        vars: BTreeMap<String, String>,
        url_scheme: &'static str,
        input: Input<'c>,
    ) -> Self {
        let input_terminated = matches!(input, Input::Chunked(_));
        Self {
            vars,
            url_scheme,
            input_terminated,
            input,
        }
    }

    /// Start building an environment by hand, for tests and in-process callers.
    pub fn builder() -> EnvironBuilder {
        EnvironBuilder::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.vars.remove(key)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn method(&self) -> &str {
        self.get("REQUEST_METHOD").unwrap_or("GET")
    }

    pub fn path_info(&self) -> &str {
        self.get("PATH_INFO").unwrap_or("/")
    }

    pub fn query_string(&self) -> &str {
        self.get("QUERY_STRING").unwrap_or("")
    }

    /// Look up a request header by its HTTP name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.get(&header_key(name))
    }

    /// Request headers as (name, value) pairs, names in `Title-Case`.
    pub fn headers(&self) -> impl Iterator<Item = (String, &str)> + '_ {
        self.vars.iter().filter_map(|(key, value)| {
            let name = match key.as_str() {
                "CONTENT_TYPE" | "CONTENT_LENGTH" => key.as_str(),
                other => other.strip_prefix("HTTP_")?,
            };
            Some((title_case(name), value.as_str()))
        })
    }

    /// "http" or "https".
    pub fn url_scheme(&self) -> &'static str {
        self.url_scheme
    }

    /// True when the body is framed by chunked encoding rather than a length.
    pub fn input_terminated(&self) -> bool {
        self.input_terminated
    }

    pub fn input(&mut self) -> &mut Input<'c> {
        &mut self.input
    }

    /// Serialize the variables and flags as a JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (key, value) in &self.vars {
            map.insert(key.clone(), serde_json::Value::String(value.clone()));
        }
        map.insert("wsgi.url_scheme".into(), self.url_scheme.into());
        map.insert("wsgi.input_terminated".into(), self.input_terminated.into());
        map.insert("wsgi.multithread".into(), true.into());
        map.insert("wsgi.multiprocess".into(), false.into());
        map.insert("wsgi.run_once".into(), false.into());
        serde_json::Value::Object(map)
    }
}

/// Environment key for a header name: `X-Base-Url` becomes `HTTP_X_BASE_URL`.
pub fn header_key(name: &str) -> String {
    let key = name.to_ascii_uppercase().replace('-', "_");
    match key.as_str() {
        "CONTENT_TYPE" | "CONTENT_LENGTH" => key,
        _ => format!("HTTP_{key}"),
    }
}

fn title_case(key: &str) -> String {
    key.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Builds an [`Environ`] with an in-memory body.
#[derive(Debug)]
pub struct EnvironBuilder {
    vars: BTreeMap<String, String>,
    url_scheme: &'static str,
    body: Option<Bytes>,
}

impl Default for EnvironBuilder {
    fn default() -> Self {
        let mut vars = BTreeMap::new();
        for (key, value) in [
            ("REQUEST_METHOD", "GET"),
            ("SCRIPT_NAME", ""),
            ("PATH_INFO", "/"),
            ("QUERY_STRING", ""),
            ("SERVER_NAME", "localhost"),
            ("SERVER_PORT", "80"),
            ("SERVER_PROTOCOL", "HTTP/1.1"),
            ("SERVER_SOFTWARE", SERVER_SOFTWARE),
            ("REMOTE_ADDR", "127.0.0.1"),
            ("REMOTE_PORT", "0"),
            ("HTTP_HOST", "localhost"),
        ] {
            vars.insert(key.to_string(), value.to_string());
        }
        Self {
            vars,
            url_scheme: "http",
            body: None,
        }
    }
}

impl EnvironBuilder {
    pub fn method(mut self, method: &str) -> Self {
        self.vars.insert("REQUEST_METHOD".into(), method.to_string());
        self
    }

    /// Set the path, with an optional `?query`.
    pub fn path(mut self, target: &str) -> Self {
        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        self.vars.insert("PATH_INFO".into(), path.to_string());
        self.vars.insert("QUERY_STRING".into(), query.to_string());
        self.vars.insert("REQUEST_URI".into(), target.to_string());
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.vars.insert(header_key(name), value.to_string());
        self
    }

    pub fn server(mut self, name: &str, port: u16) -> Self {
        self.vars.insert("SERVER_NAME".into(), name.to_string());
        self.vars.insert("SERVER_PORT".into(), port.to_string());
        self
    }

    pub fn https(mut self) -> Self {
        self.url_scheme = "https";
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        self.vars
            .insert("CONTENT_LENGTH".into(), body.len().to_string());
        self.body = Some(body);
        self
    }

    pub fn build(self) -> Environ<'static> {
        let input = match self.body {
            Some(body) => Input::Buffered(body),
            None => Input::Empty,
        };
        Environ::new(self.vars, self.url_scheme, input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn header_keys_follow_cgi_naming() {
        assert_eq!(header_key("Host"), "HTTP_HOST");
        assert_eq!(header_key("x-base-url"), "HTTP_X_BASE_URL");
        assert_eq!(header_key("Content-Type"), "CONTENT_TYPE");
        assert_eq!(header_key("content-length"), "CONTENT_LENGTH");
    }

    #[test]
    fn headers_iterates_http_names() {
        let environ = Environ::builder()
            .header("X-Special", "foo")
            .body("abc")
            .build();
        let headers: Vec<_> = environ.headers().collect();
        assert!(headers.contains(&("X-Special".to_string(), "foo")));
        assert!(headers.contains(&("Content-Length".to_string(), "3")));
        assert!(headers.contains(&("Host".to_string(), "localhost")));
        assert!(!headers.iter().any(|(name, _)| name == "Path-Info"));
    }

    #[test]
    fn json_carries_flags() {
        let environ = Environ::builder().path("/a?b=c").https().build();
        let json = environ.to_json();
        assert_eq!(json["PATH_INFO"], "/a");
        assert_eq!(json["QUERY_STRING"], "b=c");
        assert_eq!(json["wsgi.url_scheme"], "https");
        assert_eq!(json["wsgi.input_terminated"], false);
    }

    #[tokio::test]
    async fn sized_input_stops_at_length() {
        let mut reader = BufReader::new(&b"helloGET / HTTP/1.1\r\n"[..]);
        let mut input = Input::Sized {
            reader: &mut reader,
            expected: 5,
            remaining: 5,
        };
        let body = input.read_to_end(1024).await.unwrap();
        assert_eq!(&body[..], b"hello");
        assert!(input.is_exhausted());
    }

    #[tokio::test]
    async fn sized_input_reports_truncation() {
        let mut reader = BufReader::new(&b"hel"[..]);
        let mut input = Input::Sized {
            reader: &mut reader,
            expected: 5,
            remaining: 5,
        };
        assert!(matches!(
            input.read_to_end(1024).await,
            Err(InputError::Truncated {
                expected: 5,
                received: 3
            })
        ));
    }

    #[tokio::test]
    async fn drain_respects_budget() {
        let data = vec![b'x'; 32 * 1024];
        let mut reader = BufReader::new(&data[..]);
        let mut input = Input::Sized {
            reader: &mut reader,
            expected: data.len() as u64,
            remaining: data.len() as u64,
        };
        assert!(!input.drain(1024).await.unwrap());
        assert!(input.drain(u64::MAX).await.unwrap());
    }

    #[tokio::test]
    async fn buffered_input_reads_once() {
        let mut environ = Environ::builder().body("payload").build();
        assert_eq!(environ.get("CONTENT_LENGTH"), Some("7"));
        let body = environ.input().read_to_end(1024).await.unwrap();
        assert_eq!(&body[..], b"payload");
        assert!(environ.input().is_exhausted());
    }
}
