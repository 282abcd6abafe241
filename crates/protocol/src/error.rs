//! Error type for message parsing.

/// Errors produced while decoding a channel message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown verb: {0}")]
    UnknownVerb(String),

    #[error("invalid cache name: {0}")]
    InvalidName(String),

    #[error("invalid number: {0}")]
    InvalidNumber(String),

    #[error("invalid remote path: {0}")]
    InvalidPath(String),
}
