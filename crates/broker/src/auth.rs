//! Identity check folded into request decoding.
//!
//! A request only becomes a [`BrokerRequest`] if it arrived from the
//! authorized process and parses cleanly; otherwise it becomes a
//! [`Rejection`] that is answered and logged.

use std::fmt;

use cachefs_channel::Credentialed;
use cachefs_protocol::constants::NOT_AUTHORIZED;
use cachefs_protocol::{BrokerReply, BrokerRequest, ProtocolError};

/// Why a request was refused before any action was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Sent by a process other than the authorized one.
    NotAuthorized { pid: Option<u32> },
    Malformed(ProtocolError),
}

impl Rejection {
    pub fn reply(&self) -> BrokerReply {
        match self {
            Self::NotAuthorized { .. } => BrokerReply::rejected(NOT_AUTHORIZED),
            Self::Malformed(e) => BrokerReply::rejected(e.to_string()),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAuthorized { pid: Some(pid) } => write!(f, "unauthorized sender pid {pid}"),
            Self::NotAuthorized { pid: None } => f.write_str("sender pid unavailable"),
            Self::Malformed(e) => write!(f, "malformed request: {e}"),
        }
    }
}

/// Accepts requests from exactly one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Authorizer {
    authorized_pid: u32,
}

impl Authorizer {
    pub fn new(authorized_pid: u32) -> Self {
        Self { authorized_pid }
    }

    pub fn authorized_pid(&self) -> u32 {
        self.authorized_pid
    }

    /// Checks the sender, then parses the line.
    pub fn decode(&self, message: &Credentialed) -> Result<BrokerRequest, Rejection> {
        if message.peer.pid != Some(self.authorized_pid) {
            return Err(Rejection::NotAuthorized {
                pid: message.peer.pid,
            });
        }
        BrokerRequest::decode(&message.line).map_err(Rejection::Malformed)
    }
}
