//! Request line and header parsing.
//!
//! # Responsibilities
//! - Read the request head within line and header-count limits
//! - Normalize the request target into `PATH_INFO` and `QUERY_STRING`
//! - Decide body framing and build the [`Environ`]
//!
//! # Design Decisions
//! - `SERVER_NAME`/`SERVER_PORT` come from the accepting socket; `Host` is
//!   surfaced verbatim as `HTTP_HOST` and nothing else
//! - `Transfer-Encoding: chunked` always wins over `Content-Length`
//! - Header bytes are decoded as Latin-1 so no input is rejected for encoding

use std::collections::BTreeMap;
use std::io;

use http::{StatusCode, Version};
use tokio::io::AsyncBufRead;

use crate::config::LimitsConfig;
use crate::http::chunked::ChunkedStream;
use crate::http::environ::{header_key, Connection, Environ, Input};
use crate::http::line::{read_line, Line};
use crate::http::SERVER_SOFTWARE;
use crate::net::{BoundAddr, PeerAddr};

/// Errors reading or interpreting a request head.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("request line exceeds the length limit")]
    UriTooLong,

    #[error("header line exceeds the length limit")]
    HeaderTooLong,

    #[error("more than {0} header fields")]
    TooManyHeaders(usize),

    #[error("malformed request line {0:?}")]
    BadRequestLine(String),

    #[error("malformed header line {0:?}")]
    BadHeader(String),

    #[error("unsupported protocol version {0:?}")]
    UnsupportedVersion(String),

    #[error("unsupported transfer coding {0:?}")]
    UnsupportedTransferEncoding(String),

    #[error("invalid Content-Length {0:?}")]
    InvalidContentLength(String),

    #[error("declared body of {size} bytes exceeds {limit}")]
    BodyTooLarge { size: u64, limit: u64 },

    #[error("connection closed mid-request")]
    UnexpectedEof,

    #[error("I/O error reading request: {0}")]
    Io(io::Error),
}

impl From<io::Error> for ParseError {
    fn from(error: io::Error) -> Self {
        if error.kind() == io::ErrorKind::UnexpectedEof {
            ParseError::UnexpectedEof
        } else {
            ParseError::Io(error)
        }
    }
}

impl ParseError {
    /// Status to answer with, or `None` when the connection should close silently.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ParseError::UriTooLong => Some(StatusCode::URI_TOO_LONG),
            ParseError::HeaderTooLong | ParseError::TooManyHeaders(_) => {
                Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
            }
            ParseError::BodyTooLarge { .. } => Some(StatusCode::PAYLOAD_TOO_LARGE),
            ParseError::BadRequestLine(_)
            | ParseError::BadHeader(_)
            | ParseError::UnsupportedVersion(_)
            | ParseError::UnsupportedTransferEncoding(_)
            | ParseError::InvalidContentLength(_) => Some(StatusCode::BAD_REQUEST),
            ParseError::UnexpectedEof | ParseError::Io(_) => None,
        }
    }
}

/// A parsed request line and header block.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    /// The request target exactly as received.
    pub target: String,
    pub version: Version,
    /// Header fields in arrival order, names as received.
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// All values of a header, in order.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The first value of a header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True when a `Connection` header lists `token`.
    pub fn has_connection_token(&self, token: &str) -> bool {
        self.header_values("connection")
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// The client allows the connection to stay open after this request.
    pub fn wants_keep_alive(&self) -> bool {
        match self.version {
            Version::HTTP_11 => !self.has_connection_token("close"),
            _ => self.has_connection_token("keep-alive"),
        }
    }

    /// The client sent `Expect: 100-continue`.
    pub fn expects_continue(&self) -> bool {
        self.version == Version::HTTP_11
            && self
                .header("expect")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
    }

    /// Request line for logs, e.g. `GET /index.html HTTP/1.1`.
    pub fn request_line(&self) -> String {
        format!("{} {} {}", self.method, self.target, version_str(self.version))
    }

    /// Determine how the body is framed.
    pub fn framing(&self, max_body_size: u64) -> Result<BodyFraming, ParseError> {
        let codings: Vec<&str> = self
            .header_values("transfer-encoding")
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect();

        if !codings.is_empty() {
            return match codings.as_slice() {
                [coding] if coding.eq_ignore_ascii_case("chunked") => Ok(BodyFraming::Chunked),
                _ => Err(ParseError::UnsupportedTransferEncoding(codings.join(", "))),
            };
        }

        let mut length: Option<u64> = None;
        for value in self.header_values("content-length").flat_map(|v| v.split(',')) {
            let value = value.trim();
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseError::InvalidContentLength(value.to_string()));
            }
            let parsed: u64 = value
                .parse()
                .map_err(|_| ParseError::InvalidContentLength(value.to_string()))?;
            match length {
                Some(previous) if previous != parsed => {
                    return Err(ParseError::InvalidContentLength(value.to_string()))
                }
                _ => length = Some(parsed),
            }
        }

        match length {
            Some(size) if size > max_body_size => Err(ParseError::BodyTooLarge {
                size,
                limit: max_body_size,
            }),
            Some(size) => Ok(BodyFraming::Length(size)),
            None => Ok(BodyFraming::None),
        }
    }
}

/// How a request body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(u64),
    Chunked,
}

pub(crate) fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

/// Read a request head.
///
/// Returns `Ok(None)` when the peer closed the connection before sending
/// anything. Blank lines before the request line are skipped.
pub async fn read_head<R>(reader: &mut R, limits: &LimitsConfig) -> Result<Option<RequestHead>, ParseError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let line = loop {
        match read_line(reader, limits.max_line_size).await? {
            Line::Line(line) if line.is_empty() => continue,
            Line::Line(line) => break line,
            Line::Eof => return Ok(None),
            Line::TooLong => return Err(ParseError::UriTooLong),
        }
    };
    let (method, target, version) = parse_request_line(&line)?;

    let mut headers: Vec<(String, String)> = Vec::new();
    loop {
        let line = match read_line(reader, limits.max_line_size).await? {
            Line::Line(line) => line,
            Line::Eof => return Err(ParseError::UnexpectedEof),
            Line::TooLong => return Err(ParseError::HeaderTooLong),
        };
        if line.is_empty() {
            break;
        }

        if matches!(line[0], b' ' | b'\t') {
            // Obsolete line folding continues the previous value.
            let (_, value) = headers
                .last_mut()
                .ok_or_else(|| ParseError::BadHeader(latin1(&line)))?;
            let continuation = latin1(line.trim_ascii());
            if !continuation.is_empty() {
                value.push(' ');
                value.push_str(&continuation);
            }
            continue;
        }

        if headers.len() >= limits.max_header_count {
            return Err(ParseError::TooManyHeaders(limits.max_header_count));
        }
        headers.push(parse_header_line(&line)?);
    }

    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers,
    }))
}

fn parse_request_line(line: &[u8]) -> Result<(String, String, Version), ParseError> {
    let bad = || ParseError::BadRequestLine(latin1(line));
    let text = std::str::from_utf8(line).map_err(|_| bad())?;

    let mut parts = text.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(bad());
    };

    if method.is_empty() || !method.bytes().all(is_token_byte) || target.is_empty() {
        return Err(bad());
    }

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other if other.starts_with("HTTP/") => {
            return Err(ParseError::UnsupportedVersion(other.to_string()))
        }
        _ => return Err(bad()),
    };

    Ok((method.to_string(), target.to_string(), version))
}

fn parse_header_line(line: &[u8]) -> Result<(String, String), ParseError> {
    let bad = || ParseError::BadHeader(latin1(line));
    let colon = line.iter().position(|&b| b == b':').ok_or_else(bad)?;
    let name = &line[..colon];
    if name.is_empty() || !name.iter().copied().all(is_token_byte) {
        return Err(bad());
    }
    Ok((latin1(name), latin1(line[colon + 1..].trim_ascii())))
}

/// RFC 9110 `tchar`.
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// A normalized request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Percent-decoded path starting with exactly one `/` (unless the target
    /// was `*` or otherwise not origin-form).
    pub path: String,
    /// Raw query string, without the `?`.
    pub query: String,
}

impl Target {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.split_once('#').map_or(raw, |(before, _)| before);

        // Absolute form: keep only the path and query; the authority is untrusted.
        let raw = match raw.find("://") {
            Some(pos)
                if raw[..pos]
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b"+-.".contains(&b))
                    && !raw[..pos].is_empty() =>
            {
                let rest = &raw[pos + 3..];
                match rest.find(['/', '?']) {
                    Some(start) => &rest[start..],
                    None => "/",
                }
            }
            _ => raw,
        };

        let (path, query) = raw.split_once('?').unwrap_or((raw, ""));

        let path = if path.is_empty() { "/" } else { path };
        let decoded = urlencoding::decode_binary(path.as_bytes());
        let decoded = String::from_utf8_lossy(&decoded);

        // Encoded slashes (`%2F`) count toward the leading run too.
        let path = if decoded.starts_with('/') {
            format!("/{}", decoded.trim_start_matches('/'))
        } else {
            decoded.into_owned()
        };
        Self {
            path,
            query: query.to_string(),
        }
    }
}

/// Connection facts the environment is built from.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo<'a> {
    pub server: &'a BoundAddr,
    pub peer: PeerAddr,
    pub url_scheme: &'static str,
    pub limits: &'a LimitsConfig,
}

/// Build the environment for a request whose body follows on `reader`.
pub fn build_environ<'c>(
    head: &RequestHead,
    reader: Connection<'c>,
    info: ConnectionInfo<'_>,
) -> Result<Environ<'c>, ParseError> {
    let framing = head.framing(info.limits.max_body_size)?;
    let target = Target::parse(&head.target);

    let mut vars = BTreeMap::new();
    let mut set = |key: &str, value: String| {
        vars.insert(key.to_string(), value);
    };
    set("REQUEST_METHOD", head.method.clone());
    set("SCRIPT_NAME", String::new());
    set("PATH_INFO", target.path);
    set("QUERY_STRING", target.query);
    set("REQUEST_URI", head.target.clone());
    set("RAW_URI", head.target.clone());
    set("SERVER_NAME", info.server.server_name());
    set("SERVER_PORT", info.server.server_port().to_string());
    set("SERVER_PROTOCOL", version_str(head.version).to_string());
    set("SERVER_SOFTWARE", SERVER_SOFTWARE.to_string());
    set("REMOTE_ADDR", info.peer.ip());
    set("REMOTE_PORT", info.peer.port().to_string());

    for (name, value) in &head.headers {
        let key = header_key(name);
        vars.entry(key)
            .and_modify(|existing: &mut String| {
                existing.push(',');
                existing.push_str(value);
            })
            .or_insert_with(|| value.clone());
    }

    let input = match framing {
        BodyFraming::Chunked => {
            vars.remove("CONTENT_LENGTH");
            Input::Chunked(ChunkedStream::new(
                reader,
                info.limits.max_line_size,
                info.limits.max_body_size,
            ))
        }
        BodyFraming::Length(size) => {
            vars.insert("CONTENT_LENGTH".to_string(), size.to_string());
            if size == 0 {
                Input::Empty
            } else {
                Input::Sized {
                    reader,
                    expected: size,
                    remaining: size,
                }
            }
        }
        BodyFraming::None => {
            vars.remove("CONTENT_TYPE");
            vars.remove("CONTENT_LENGTH");
            Input::Empty
        }
    };

    Ok(Environ::new(vars, info.url_scheme, input))
}
