//! Listening side of the credential channel.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::net::UnixListener;
use tracing::{debug, info, warn};

use crate::error::ChannelError;
use crate::stream::CredentialStream;

/// A bound Unix socket. The socket file is removed when the listener drops.
#[derive(Debug)]
pub struct CredentialListener {
    listener: UnixListener,
    path: PathBuf,
}

impl CredentialListener {
    /// Binds `path`, replacing a stale socket file, and applies `mode`.
    pub fn bind(path: &Path, mode: u32) -> Result<Self, ChannelError> {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        info!(path = %path.display(), mode = %format!("{mode:o}"), "credential channel listening");

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts the next connection and captures the peer's identity.
    pub async fn accept(&self) -> Result<CredentialStream, ChannelError> {
        let (stream, _addr) = self.listener.accept().await?;
        let stream = CredentialStream::from_stream(stream)?;
        debug!(peer = %stream.peer(), "credential channel accepted");
        Ok(stream)
    }
}

impl Drop for CredentialListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove socket");
            }
        }
    }
}
