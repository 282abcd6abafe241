//! Credential channel: local stream sockets that know who is on the other end.
//!
//! Every connection records the peer's `(pid, uid, gid)` as reported by the
//! kernel when the connection is established. Messages are single text
//! lines, bounded by [`cachefs_protocol::constants::MAX_LINE_LEN`].

pub mod error;
pub mod listener;
pub mod stream;
pub mod wire;

pub use error::ChannelError;
pub use listener::CredentialListener;
pub use stream::{Credentialed, CredentialStream, PeerIdentity};

use std::time::Duration;

/// Timeout for connecting to a listening socket.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
