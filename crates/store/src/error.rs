//! Transfer store error types.

use crate::models::Direction;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("file {file_id} already has a pending {direction} transfer")]
    TransferBusy { file_id: i64, direction: Direction },
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
