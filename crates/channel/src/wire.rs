//! Newline framing.
//!
//! # Wire format
//!
//! ```text
//! [UTF-8 text, at most MAX_LINE_LEN bytes, no '\n'] '\n'
//! ```
//!
//! A trailing `\r` before the newline is stripped on read.

use cachefs_protocol::constants::MAX_LINE_LEN;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ChannelError;

/// Writes one framed line and flushes.
pub async fn write_line<W: AsyncWrite + Unpin>(
    writer: &mut W,
    line: &str,
) -> Result<(), ChannelError> {
    if line.contains('\n') {
        return Err(ChannelError::EmbeddedNewline);
    }
    if line.len() > MAX_LINE_LEN {
        return Err(ChannelError::LineTooLong(MAX_LINE_LEN));
    }
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one framed line.
///
/// Returns `None` on a clean end of stream. A stream that ends in the
/// middle of a line is reported as [`ChannelError::Closed`]. Lines longer
/// than [`MAX_LINE_LEN`] are rejected without buffering the remainder.
pub async fn read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<String>, ChannelError> {
    let mut buf = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ChannelError::Closed);
        }

        let done = match available.iter().position(|&b| b == b'\n') {
            Some(idx) => {
                buf.extend_from_slice(&available[..idx]);
                reader.consume(idx + 1);
                true
            }
            None => {
                let len = available.len();
                buf.extend_from_slice(available);
                reader.consume(len);
                false
            }
        };

        // Allow one extra byte for a trailing '\r'.
        if buf.len() > MAX_LINE_LEN + 1 {
            return Err(ChannelError::LineTooLong(MAX_LINE_LEN));
        }
        if done {
            break;
        }
    }

    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    if buf.len() > MAX_LINE_LEN {
        return Err(ChannelError::LineTooLong(MAX_LINE_LEN));
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| ChannelError::InvalidUtf8)
}
