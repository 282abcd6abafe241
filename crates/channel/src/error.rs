//! Error types for the credential channel.

use cachefs_protocol::ProtocolError;

/// Errors produced by the credential channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("message is not valid UTF-8")]
    InvalidUtf8,

    #[error("message contains a line break")]
    EmbeddedNewline,

    #[error("connection closed by peer")]
    Closed,

    #[error("timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
