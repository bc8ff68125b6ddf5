//! Chunked transfer-encoding decoder.
//!
//! # Responsibilities
//! - Decode an HTTP/1.1 chunked body into plain bytes, lazily and forward-only
//! - Consume trailers and the final CRLF so the connection can be reused
//! - Bound chunk sizes, line lengths and the total decoded size
//!
//! # Design Decisions
//! - Framing never consults `Content-Length`; the zero-size chunk is the only end
//! - Works on any `AsyncBufRead`, so transport segment sizes never matter
//! - Once terminated, every read returns end of stream

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::http::line::{read_line, Line};

/// Longest hex chunk size accepted (fits a u64).
const MAX_SIZE_DIGITS: usize = 16;

/// Trailer fields accepted after the last chunk.
const MAX_TRAILERS: usize = 100;

/// Errors decoding a chunked body.
#[derive(Debug, thiserror::Error)]
pub enum ChunkedError {
    #[error("invalid chunk size line {0:?}")]
    InvalidSize(String),

    #[error("chunk size or trailer line too long")]
    LineTooLong,

    #[error("chunked body ended before the terminating chunk")]
    UnexpectedEof,

    #[error("chunk data not followed by CRLF")]
    MissingCrlf,

    #[error("chunked body exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("I/O error reading chunked body: {0}")]
    Io(io::Error),
}

impl From<io::Error> for ChunkedError {
    fn from(error: io::Error) -> Self {
        if error.kind() == io::ErrorKind::UnexpectedEof {
            ChunkedError::UnexpectedEof
        } else {
            ChunkedError::Io(error)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SizeLine,
    Data { remaining: u64 },
    DataCrlf,
    Done,
}

/// A chunked body being decoded off a connection.
#[derive(Debug)]
pub struct ChunkedStream<R> {
    reader: R,
    state: State,
    max_line: usize,
    limit: u64,
    decoded: u64,
}

impl<R> ChunkedStream<R>
where
    R: AsyncBufRead + Unpin,
{
    /// Decode from `reader`. Lines longer than `max_line` and bodies longer
    /// than `limit` bytes are errors.
    pub fn new(reader: R, max_line: usize, limit: u64) -> Self {
        Self {
            reader,
            state: State::SizeLine,
            max_line,
            limit,
            decoded: 0,
        }
    }

    /// True once the zero-size chunk and trailers have been consumed.
    pub fn is_terminated(&self) -> bool {
        self.state == State::Done
    }

    /// Bytes of payload decoded so far.
    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    /// Read decoded payload into `buf`. Returns 0 only at end of body.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ChunkedError> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            match self.state {
                State::Done => return Ok(0),
                State::SizeLine => {
                    let size = self.read_size().await?;
                    if size == 0 {
                        self.read_trailers().await?;
                        self.state = State::Done;
                        return Ok(0);
                    }
                    match self.decoded.checked_add(size) {
                        Some(total) if total <= self.limit => {}
                        _ => return Err(ChunkedError::TooLarge { limit: self.limit }),
                    }
                    self.state = State::Data { remaining: size };
                }
                State::Data { remaining } => {
                    let available = self.reader.fill_buf().await?;
                    if available.is_empty() {
                        return Err(ChunkedError::UnexpectedEof);
                    }
                    let n = available
                        .len()
                        .min(buf.len())
                        .min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    buf[..n].copy_from_slice(&available[..n]);
                    self.reader.consume(n);

                    self.decoded += n as u64;
                    let remaining = remaining - n as u64;
                    self.state = if remaining == 0 {
                        State::DataCrlf
                    } else {
                        State::Data { remaining }
                    };
                    return Ok(n);
                }
                State::DataCrlf => match read_line(&mut self.reader, 0).await? {
                    Line::Line(_) => self.state = State::SizeLine,
                    Line::Eof => return Err(ChunkedError::UnexpectedEof),
                    Line::TooLong => return Err(ChunkedError::MissingCrlf),
                },
            }
        }
    }

    /// Read the rest of the body into a vector.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize, ChunkedError> {
        let mut buf = [0u8; 8192];
        let mut total = 0;
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&buf[..n]);
            total += n;
        }
    }

    async fn read_size(&mut self) -> Result<u64, ChunkedError> {
        let line = match read_line(&mut self.reader, self.max_line).await? {
            Line::Line(line) => line,
            Line::Eof => return Err(ChunkedError::UnexpectedEof),
            Line::TooLong => return Err(ChunkedError::LineTooLong),
        };
        parse_chunk_size(&line)
    }

    async fn read_trailers(&mut self) -> Result<(), ChunkedError> {
        for _ in 0..=MAX_TRAILERS {
            match read_line(&mut self.reader, self.max_line).await? {
                Line::Line(line) if line.is_empty() => return Ok(()),
                Line::Line(_) => continue,
                Line::Eof => return Err(ChunkedError::UnexpectedEof),
                Line::TooLong => return Err(ChunkedError::LineTooLong),
            }
        }
        Err(ChunkedError::LineTooLong)
    }
}

/// Parse a chunk size line: hex digits, optionally followed by `;extensions`.
fn parse_chunk_size(line: &[u8]) -> Result<u64, ChunkedError> {
    let invalid = || ChunkedError::InvalidSize(String::from_utf8_lossy(line).into_owned());

    let digits = match line.iter().position(|&b| b == b';') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let digits = digits.trim_ascii();

    if digits.is_empty()
        || digits.len() > MAX_SIZE_DIGITS
        || !digits.iter().all(u8::is_ascii_hexdigit)
    {
        return Err(invalid());
    }

    let text = std::str::from_utf8(digits).map_err(|_| invalid())?;
    u64::from_str_radix(text, 16).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, BufReader};

    async fn decode(input: &[u8], capacity: usize) -> Result<Vec<u8>, ChunkedError> {
        let reader = BufReader::with_capacity(capacity, input);
        let mut stream = ChunkedStream::new(reader, 1024, 1 << 20);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await?;
        assert!(stream.is_terminated());
        Ok(out)
    }

    #[tokio::test]
    async fn decodes_chunks_with_extensions_and_trailers() {
        let body = b"4;name=value\r\nWiki\r\n5\r\npedia\r\nE\r\n in\r\n\r\nchunks.\r\n0\r\nExpires: never\r\n\r\n";
        let out = decode(body, 8192).await.unwrap();
        assert_eq!(out, b"Wikipedia in\r\n\r\nchunks.");
    }

    #[tokio::test]
    async fn tolerates_single_byte_segments() {
        let body = b"a\r\n0123456789\r\n3\r\nabc\r\n0\r\n\r\n";
        let out = decode(body, 1).await.unwrap();
        assert_eq!(out, b"0123456789abc");
    }

    #[tokio::test]
    async fn stays_terminated_after_last_chunk() {
        let reader = BufReader::new(&b"3\r\nabc\r\n0\r\n\r\nGET / HTTP/1.1\r\n"[..]);
        let mut stream = ChunkedStream::new(reader, 1024, 1024);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert_eq!(stream.decoded(), 3);
    }

    #[tokio::test]
    async fn reads_across_a_slow_duplex() {
        let (mut client, server) = tokio::io::duplex(3);
        let writer = tokio::spawn(async move {
            for piece in [&b"5\r"[..], b"\nhel", b"lo\r\n", b"0\r\n", b"\r\n"] {
                client.write_all(piece).await.unwrap();
            }
        });

        let mut stream = ChunkedStream::new(BufReader::with_capacity(2, server), 64, 64);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        writer.await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn rejects_malformed_size() {
        assert!(matches!(
            decode(b"zz\r\nabc\r\n0\r\n\r\n", 64).await,
            Err(ChunkedError::InvalidSize(_))
        ));
        assert!(matches!(
            decode(b"-1\r\n", 64).await,
            Err(ChunkedError::InvalidSize(_))
        ));
        assert!(matches!(
            decode(b"\r\n", 64).await,
            Err(ChunkedError::InvalidSize(_))
        ));
    }

    #[tokio::test]
    async fn rejects_overflowing_size() {
        assert!(matches!(
            decode(b"fffffffffffffffffff\r\n", 64).await,
            Err(ChunkedError::InvalidSize(_))
        ));
        assert!(matches!(
            decode(b"ffffffffffffffff\r\n", 64).await,
            Err(ChunkedError::TooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn premature_end_is_an_error() {
        assert!(matches!(
            decode(b"a\r\nshort", 64).await,
            Err(ChunkedError::UnexpectedEof)
        ));
        assert!(matches!(
            decode(b"3\r\nabc\r\n", 64).await,
            Err(ChunkedError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn data_must_end_with_crlf() {
        assert!(matches!(
            decode(b"3\r\nabcdef\r\n0\r\n\r\n", 64).await,
            Err(ChunkedError::MissingCrlf)
        ));
    }

    #[tokio::test]
    async fn enforces_total_limit() {
        let reader = BufReader::new(&b"5\r\nhello\r\n5\r\nworld\r\n0\r\n\r\n"[..]);
        let mut stream = ChunkedStream::new(reader, 64, 8);
        let mut out = Vec::new();
        assert!(matches!(
            stream.read_to_end(&mut out).await,
            Err(ChunkedError::TooLarge { limit: 8 })
        ));
    }
}
