//! Bounded CRLF line reading shared by the request and chunked parsers.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Outcome of reading one line.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Line {
    /// A complete line with its terminator removed.
    Line(Vec<u8>),
    /// The stream ended before any byte of the line.
    Eof,
    /// The line exceeded the limit; the stream is left mid-line.
    TooLong,
}

/// Read one line terminated by `\n` (an optional preceding `\r` is dropped).
///
/// `limit` counts the line content without its terminator. A stream ending
/// mid-line is an `UnexpectedEof` error.
pub(crate) async fn read_line<R>(reader: &mut R, limit: usize) -> io::Result<Line>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut line = Vec::new();

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if line.is_empty() {
                return Ok(Line::Eof);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended mid-line",
            ));
        }

        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                line.extend_from_slice(&available[..pos]);
                reader.consume(pos + 1);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.len() > limit {
                    return Ok(Line::TooLong);
                }
                return Ok(Line::Line(line));
            }
            None => {
                let len = available.len();
                line.extend_from_slice(available);
                reader.consume(len);
                // One extra byte of slack for a trailing '\r'.
                if line.len() > limit + 1 {
                    return Ok(Line::TooLong);
                }
            }
        }
    }
}
