//! Remote store error types.

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object not found: {0}")]
    NotFound(String),

    /// The store answered with a non-success status.
    #[error("remote store returned {code}: {message}")]
    Status { code: u16, message: String },

    /// The request did not produce a response.
    #[error("request failed: {0}")]
    Request(String),

    #[error("unexpected response: {0}")]
    Protocol(String),
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;
