//! Responses and their HTTP/1.1 serialization.
//!
//! # Responsibilities
//! - The response type applications return
//! - Choose body framing (length, chunked, close-delimited or none)
//! - Serialize status line, headers and body in order
//! - Generic HTML error pages that never carry internal detail

use std::fmt;
use std::io;

use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::http::request::version_str;
use crate::http::SERVER_SOFTWARE;

/// A response body.
pub enum Body {
    Empty,
    Full(Bytes),
    /// Produced incrementally; length unknown unless the headers declare it.
    Stream(BoxStream<'static, io::Result<Bytes>>),
}

impl Body {
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: futures_util::Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Body::Stream(stream.boxed())
    }

    /// Exact length, when known without consuming the body.
    pub fn len(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Full(bytes) => Some(bytes.len() as u64),
            Body::Stream(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Collect the whole body into memory.
    pub async fn collect(self) -> io::Result<Bytes> {
        match self {
            Body::Empty => Ok(Bytes::new()),
            Body::Full(bytes) => Ok(bytes),
            Body::Stream(mut stream) => {
                let mut out = Vec::new();
                while let Some(chunk) = stream.next().await {
                    out.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(out))
            }
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Body::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Empty
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Full(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Full(Bytes::from(bytes))
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::Full(Bytes::from(text))
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Body::Full(Bytes::from_static(text.as_bytes()))
    }
}

/// What an application returns for one request.
#[derive(Debug, Default)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

impl Response {
    pub fn new(status: StatusCode, body: impl Into<Body>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// `text/plain; charset=utf-8` response.
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(status, body.into())
            .with_header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"))
    }

    /// `application/json` response.
    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        Self::new(status, value.to_string())
            .with_header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
    }

    /// Generic HTML error page for a status.
    pub fn error_page(status: StatusCode) -> Self {
        let reason = status.canonical_reason().unwrap_or("Error");
        let page = format!(
            "<!doctype html>\n<html lang=en>\n<title>{code} {reason}</title>\n<h1>{reason}</h1>\n<p>{description}</p>\n",
            code = status.as_u16(),
            description = describe(status),
        );
        Self::new(status, page)
            .with_header(header::CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"))
    }

    pub fn with_header(mut self, name: header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

fn describe(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => {
            "The browser (or proxy) sent a request that this server could not understand."
        }
        StatusCode::NOT_FOUND => {
            "The requested URL was not found on the server. If you entered the URL manually please check your spelling and try again."
        }
        StatusCode::PAYLOAD_TOO_LARGE => "The data value transmitted exceeds the capacity limit.",
        StatusCode::URI_TOO_LONG => {
            "The length of the requested URL exceeds the capacity limit for this server. The request cannot be processed."
        }
        StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE => "One or more header fields exceeds the maximum size.",
        StatusCode::BAD_GATEWAY => {
            "The proxy server received an invalid response from an upstream server."
        }
        StatusCode::GATEWAY_TIMEOUT => "The connection to an upstream server timed out.",
        _ => {
            "The server encountered an internal error and was unable to complete your request. Either the server is overloaded or there is an error in the application."
        }
    }
}

/// Errors serializing a response.
#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    /// Detected before anything was written; a 500 can still be sent.
    #[error("declared Content-Length {declared} does not match body length {actual}")]
    LengthMismatch { declared: u64, actual: u64 },

    /// Detected before anything was written; a 500 can still be sent.
    #[error("invalid Content-Length header {0:?}")]
    InvalidContentLength(String),

    /// The head is already out; the connection must close.
    #[error("body stream produced {written} bytes but {declared} were declared")]
    StreamLength { declared: u64, written: u64 },

    /// The application's body stream failed mid-response.
    #[error("response body stream failed: {0}")]
    Body(io::Error),

    #[error("I/O error writing response: {0}")]
    Io(#[from] io::Error),
}

impl ResponseError {
    /// True when nothing reached the client yet.
    pub fn before_head(&self) -> bool {
        matches!(
            self,
            ResponseError::LengthMismatch { .. } | ResponseError::InvalidContentLength(_)
        )
    }
}

/// How the body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Length(u64),
    Chunked,
    /// Delimited by closing the connection.
    Close,
    NoBody,
}

/// Request facts that shape the response.
#[derive(Debug, Clone)]
pub struct ResponseContext {
    pub version: Version,
    pub method: Method,
    /// Whether the connection may be reused after this response.
    pub keep_alive: bool,
}

/// Result of a completed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub status: StatusCode,
    pub framing: Framing,
    /// The connection can carry another request.
    pub reusable: bool,
    pub body_bytes: u64,
}

/// A response whose head has been fixed and validated.
pub struct PreparedResponse {
    head: Vec<u8>,
    status: StatusCode,
    body: Body,
    framing: Framing,
    reusable: bool,
}

/// Fix framing and headers; fails without writing when the response is invalid.
pub fn prepare(mut response: Response, ctx: &ResponseContext) -> Result<PreparedResponse, ResponseError> {
    let status = response.status;
    let declared = declared_length(&response.headers)?;
    response.headers.remove(header::TRANSFER_ENCODING);

    let bodiless = ctx.method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;

    if let (Some(declared), Some(actual)) = (declared, response.body.len()) {
        if declared != actual && !bodiless {
            return Err(ResponseError::LengthMismatch { declared, actual });
        }
    }

    let framing = if bodiless {
        if ctx.method == Method::HEAD && declared.is_none() {
            if let Some(len) = response.body.len() {
                response.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            }
        }
        Framing::NoBody
    } else {
        match (declared, response.body.len()) {
            (Some(len), _) => Framing::Length(len),
            (None, Some(len)) => {
                response.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
                Framing::Length(len)
            }
            (None, None) if ctx.version == Version::HTTP_11 => {
                response
                    .headers
                    .insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                Framing::Chunked
            }
            (None, None) => Framing::Close,
        }
    };

    let app_close = response
        .headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("close"));

    let reusable = ctx.keep_alive && !app_close && framing != Framing::Close;
    if reusable {
        if ctx.version == Version::HTTP_10 {
            response
                .headers
                .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        }
    } else if ctx.version == Version::HTTP_11 {
        response
            .headers
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
    } else {
        response.headers.remove(header::CONNECTION);
    }

    if !response.headers.contains_key(header::SERVER) {
        response
            .headers
            .insert(header::SERVER, HeaderValue::from_static(SERVER_SOFTWARE));
    }
    if !response.headers.contains_key(header::DATE) {
        let date = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        if let Ok(value) = HeaderValue::from_str(&date) {
            response.headers.insert(header::DATE, value);
        }
    }

    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            version_str(ctx.version),
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown")
        )
        .as_bytes(),
    );
    for (name, value) in &response.headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");

    Ok(PreparedResponse {
        head,
        status,
        body: response.body,
        framing,
        reusable,
    })
}

fn declared_length(headers: &HeaderMap) -> Result<Option<u64>, ResponseError> {
    let mut declared = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        let text = value.to_str().unwrap_or_default().trim();
        let parsed: u64 = text
            .parse()
            .map_err(|_| ResponseError::InvalidContentLength(text.to_string()))?;
        match declared {
            Some(previous) if previous != parsed => {
                return Err(ResponseError::InvalidContentLength(text.to_string()))
            }
            _ => declared = Some(parsed),
        }
    }
    Ok(declared)
}

impl PreparedResponse {
    /// Write head and body, then flush.
    pub async fn write_to<W>(self, writer: &mut W) -> Result<WriteOutcome, ResponseError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        writer.write_all(&self.head).await?;

        let written = match (self.framing, self.body) {
            (Framing::NoBody, _) | (_, Body::Empty) => 0,
            (_, Body::Full(bytes)) => {
                writer.write_all(&bytes).await?;
                bytes.len() as u64
            }
            (framing, Body::Stream(mut stream)) => {
                let mut written = 0u64;
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(ResponseError::Body)?;
                    if chunk.is_empty() {
                        continue;
                    }
                    written += chunk.len() as u64;
                    match framing {
                        Framing::Length(declared) if written > declared => {
                            return Err(ResponseError::StreamLength { declared, written });
                        }
                        Framing::Chunked => {
                            writer
                                .write_all(format!("{:X}\r\n", chunk.len()).as_bytes())
                                .await?;
                            writer.write_all(&chunk).await?;
                            writer.write_all(b"\r\n").await?;
                        }
                        _ => writer.write_all(&chunk).await?,
                    }
                }
                if let Framing::Length(declared) = framing {
                    if written != declared {
                        return Err(ResponseError::StreamLength { declared, written });
                    }
                }
                written
            }
        };

        if self.framing == Framing::Chunked {
            writer.write_all(b"0\r\n\r\n").await?;
        }
        writer.flush().await?;

        Ok(WriteOutcome {
            status: self.status,
            framing: self.framing,
            reusable: self.reusable,
            body_bytes: written,
        })
    }
}
