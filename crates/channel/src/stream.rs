//! A connected credential stream.

use std::fmt;
use std::path::Path;

use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::CONNECT_TIMEOUT;
use crate::error::ChannelError;
use crate::wire::{read_line, write_line};

/// Kernel-verified identity of the process on the other end of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Process id, when the platform reports one.
    pub pid: Option<u32>,
    pub uid: u32,
    pub gid: u32,
}

impl PeerIdentity {
    fn of(stream: &UnixStream) -> Result<Self, ChannelError> {
        let cred = stream.peer_cred()?;
        Ok(Self {
            pid: cred.pid().and_then(|pid| u32::try_from(pid).ok()),
            uid: cred.uid(),
            gid: cred.gid(),
        })
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "pid={pid} uid={} gid={}", self.uid, self.gid),
            None => write!(f, "pid=? uid={} gid={}", self.uid, self.gid),
        }
    }
}

/// A received line together with the identity of the process that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentialed {
    pub peer: PeerIdentity,
    pub line: String,
}

/// Line-framed stream that remembers its peer's identity.
pub struct CredentialStream {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: PeerIdentity,
}

impl CredentialStream {
    /// Connects to the socket at `path`.
    pub async fn connect(path: &Path) -> Result<Self, ChannelError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(path))
            .await
            .map_err(|_| ChannelError::Timeout)??;
        let stream = Self::from_stream(stream)?;
        debug!(path = %path.display(), peer = %stream.peer, "credential channel connected");
        Ok(stream)
    }

    /// Wraps an already connected socket, capturing the peer identity.
    pub fn from_stream(stream: UnixStream) -> Result<Self, ChannelError> {
        let peer = PeerIdentity::of(&stream)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            peer,
        })
    }

    /// A connected pair within this process.
    pub fn pair() -> Result<(Self, Self), ChannelError> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from_stream(a)?, Self::from_stream(b)?))
    }

    pub fn peer(&self) -> PeerIdentity {
        self.peer
    }

    pub async fn send(&mut self, line: &str) -> Result<(), ChannelError> {
        write_line(&mut self.writer, line).await
    }

    /// Receives the next line, or `None` once the peer has closed.
    pub async fn recv(&mut self) -> Result<Option<String>, ChannelError> {
        read_line(&mut self.reader).await
    }

    /// Receives the next line tagged with the sender's identity.
    pub async fn recv_credentialed(&mut self) -> Result<Option<Credentialed>, ChannelError> {
        Ok(self.recv().await?.map(|line| Credentialed {
            peer: self.peer,
            line,
        }))
    }

    /// Sends `line` and waits for exactly one reply line.
    pub async fn request(&mut self, line: &str) -> Result<String, ChannelError> {
        self.send(line).await?;
        self.recv().await?.ok_or(ChannelError::Closed)
    }
}

impl fmt::Debug for CredentialStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStream")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}
