//! The link between the scheduler and the filesystem adapter.
//!
//! # Wire format
//!
//! The scheduler connects to the adapter's socket and opens the link:
//!
//! ```text
//! -> CONNECT <bucket>:<access_key>:<secret_key>
//! <- CONNECTED | ERROR: <reason>
//! ```
//!
//! The adapter then sends requests over the same connection, one at a
//! time, each answered by `OK` or `ERROR <errno>`:
//!
//! ```text
//! <- CACHE /photos/cat.jpg
//! -> OK
//! <- UPLOAD /photos/cat.jpg
//! -> OK
//! ```

use std::io;
use std::path::Path;
use std::sync::Arc;

use cachefs_channel::{ChannelError, CredentialListener, CredentialStream, PeerIdentity};
use cachefs_protocol::constants::{HANDSHAKE_TIMEOUT, errno};
use cachefs_protocol::{AdapterReply, AdapterRequest, ConnectReply, ConnectRequest};
use cachefs_store::{Owner, StoreError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::Outcome;
use crate::scheduler::TransferScheduler;
use crate::TransferError;

/// Mode given to catalog entries first created by a `CACHE` request.
const FILE_MODE: u32 = 0o644;
const DIR_MODE: u32 = 0o755;

// ---------------------------------------------------------------------------
// Scheduler side
// ---------------------------------------------------------------------------

/// An open link to the adapter, serving its requests.
pub struct AdapterLink {
    stream: CredentialStream,
    bucket: String,
    scheduler: Arc<TransferScheduler>,
}

impl AdapterLink {
    /// Connects to the adapter at `path` and performs the handshake.
    pub async fn connect(
        path: &Path,
        request: &ConnectRequest,
        scheduler: Arc<TransferScheduler>,
    ) -> Result<Self, TransferError> {
        let mut stream = CredentialStream::connect(path).await?;
        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.request(&request.encode()))
            .await
            .map_err(|_| TransferError::Timeout)??;

        match ConnectReply::decode(&reply)? {
            ConnectReply::Connected => {
                info!(bucket = %request.bucket, peer = %stream.peer(), "adapter link open");
                Ok(Self {
                    stream,
                    bucket: request.bucket.clone(),
                    scheduler,
                })
            }
            ConnectReply::Error(reason) => Err(TransferError::Refused(reason)),
        }
    }

    pub fn peer(&self) -> PeerIdentity {
        self.stream.peer()
    }

    /// Answers requests until the adapter hangs up or `cancel` fires.
    pub async fn serve(mut self, cancel: CancellationToken) -> Result<(), TransferError> {
        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                line = self.stream.recv() => match line? {
                    Some(line) => line,
                    None => {
                        info!(bucket = %self.bucket, "adapter link closed");
                        return Ok(());
                    }
                },
            };

            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                reply = self.handle(&line) => reply,
            };
            self.stream.send(&reply.encode()).await?;
        }
    }

    async fn handle(&self, line: &str) -> AdapterReply {
        let request = match AdapterRequest::decode(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(line, "malformed adapter request: {e}");
                return AdapterReply::Error(errno::EINVAL);
            }
        };

        let result = match &request {
            AdapterRequest::Cache { remote_path } => self.cache(remote_path).await,
            AdapterRequest::Upload { remote_path } => self.upload(remote_path).await,
        };
        result.unwrap_or_else(|e| {
            warn!(remote_path = request.remote_path(), "adapter request failed: {e}");
            AdapterReply::Error(errno_for(&e))
        })
    }

    async fn cache(&self, remote_path: &str) -> Result<AdapterReply, TransferError> {
        let peer = self.stream.peer();
        let store = &self.scheduler.context().store;
        let owner = Owner {
            uid: peer.uid,
            gid: peer.gid,
            permissions: FILE_MODE,
        };
        let parent_owner = Owner {
            permissions: DIR_MODE,
            ..owner
        };

        let entry = store
            .find_or_create_file(&self.bucket, remote_path, owner, parent_owner)
            .await?;
        if entry.cached {
            store.touch(entry.id).await?;
            return Ok(AdapterReply::Ok);
        }

        let mut handle = self.scheduler.request_download(entry.id, peer.uid).await?;
        let outcome = handle.await_completion().await;
        handle.unsubscribe();
        debug!(file_id = entry.id, ?outcome, "download awaited");

        // The catalog is the authority; the outcome only explains a failure.
        if store.file(entry.id).await?.cached {
            Ok(AdapterReply::Ok)
        } else {
            if outcome == Outcome::Cached {
                warn!(file_id = entry.id, "download reported success but file is not cached");
            }
            Ok(AdapterReply::Error(errno::EIO))
        }
    }

    async fn upload(&self, remote_path: &str) -> Result<AdapterReply, TransferError> {
        let ctx = self.scheduler.context();
        let Some(entry) = ctx.store.file_by_remote(remote_path).await? else {
            return Ok(AdapterReply::Error(errno::ENOENT));
        };

        let size = tokio::fs::metadata(ctx.layout.shared_file(&entry.path))
            .await?
            .len();
        ctx.store.mark_changed(entry.id, size).await?;
        self.scheduler
            .schedule_upload(entry.id, self.stream.peer().uid)
            .await?;
        Ok(AdapterReply::Ok)
    }
}

fn errno_for(error: &TransferError) -> i32 {
    match error {
        TransferError::Store(StoreError::TransferBusy { .. }) => errno::EBUSY,
        TransferError::Store(StoreError::NotFound(_)) => errno::ENOENT,
        TransferError::Io(e) if e.kind() == io::ErrorKind::NotFound => errno::ENOENT,
        TransferError::Protocol(_) => errno::EINVAL,
        _ => errno::EIO,
    }
}

// ---------------------------------------------------------------------------
// Adapter side
// ---------------------------------------------------------------------------

/// The adapter's listening socket.
pub struct AdapterEndpoint {
    listener: CredentialListener,
}

impl AdapterEndpoint {
    pub fn bind(path: &Path, mode: u32) -> Result<Self, TransferError> {
        Ok(Self {
            listener: CredentialListener::bind(path, mode)?,
        })
    }

    pub fn path(&self) -> &Path {
        self.listener.path()
    }

    /// Accepts a link and answers its handshake. Links naming any bucket
    /// other than `bucket` are refused.
    pub async fn accept(&self, bucket: &str) -> Result<AdapterSession, TransferError> {
        let mut stream = self.listener.accept().await?;
        let line = tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.recv())
            .await
            .map_err(|_| TransferError::Timeout)??
            .ok_or(ChannelError::Closed)?;

        let request = match ConnectRequest::decode(&line) {
            Ok(request) => request,
            Err(e) => {
                stream
                    .send(&ConnectReply::Error(e.to_string()).encode())
                    .await?;
                return Err(e.into());
            }
        };
        if request.bucket != bucket {
            let reason = format!("unknown bucket {}", request.bucket);
            stream.send(&ConnectReply::Error(reason.clone()).encode()).await?;
            return Err(TransferError::Refused(reason));
        }

        stream.send(&ConnectReply::Connected.encode()).await?;
        debug!(bucket, peer = %stream.peer(), "adapter link accepted");
        Ok(AdapterSession { stream, request })
    }
}

/// The adapter's end of an open link.
#[derive(Debug)]
pub struct AdapterSession {
    stream: CredentialStream,
    request: ConnectRequest,
}

impl AdapterSession {
    /// The handshake the scheduler opened the link with.
    pub fn connect_request(&self) -> &ConnectRequest {
        &self.request
    }

    pub fn peer(&self) -> PeerIdentity {
        self.stream.peer()
    }

    pub async fn cache(&mut self, remote_path: &str) -> Result<AdapterReply, TransferError> {
        let request = AdapterRequest::Cache {
            remote_path: remote_path.to_string(),
        };
        self.send_line(&request.encode()).await
    }

    pub async fn upload(&mut self, remote_path: &str) -> Result<AdapterReply, TransferError> {
        let request = AdapterRequest::Upload {
            remote_path: remote_path.to_string(),
        };
        self.send_line(&request.encode()).await
    }

    /// Sends a raw request line and decodes the reply.
    pub async fn send_line(&mut self, line: &str) -> Result<AdapterReply, TransferError> {
        let reply = self.stream.request(line).await?;
        Ok(AdapterReply::decode(&reply)?)
    }
}
