//! Error types for the privilege broker.

use cachefs_channel::ChannelError;
use cachefs_protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The broker answered with something other than `ACK`.
    #[error("broker rejected request: {0}")]
    Rejected(String),

    /// A staged or shared path is a symlink, device or other non-regular
    /// entry.
    #[error("{0} is not a regular file")]
    NotRegular(String),

    #[error("part {part} out of range for a {size}-byte file")]
    PartOutOfRange { part: u32, size: u64 },

    #[error("operation task failed: {0}")]
    Task(String),
}
