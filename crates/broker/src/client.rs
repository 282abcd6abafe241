//! Scheduler-side handle to the broker.

use std::path::Path;

use cachefs_channel::CredentialStream;
use cachefs_protocol::{BrokerReply, BrokerRequest, CacheName, CachePath, CacheTarget};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::BrokerError;

/// Sends broker requests one at a time over a single connection.
///
/// Each call blocks until the broker's reply arrives, so a request is
/// carried out at most once from the caller's point of view.
#[derive(Debug)]
pub struct BrokerClient {
    stream: Mutex<CredentialStream>,
}

impl BrokerClient {
    pub async fn connect(path: &Path) -> Result<Self, BrokerError> {
        Ok(Self::new(CredentialStream::connect(path).await?))
    }

    pub fn new(stream: CredentialStream) -> Self {
        Self {
            stream: Mutex::new(stream),
        }
    }

    pub async fn call(&self, request: &BrokerRequest) -> Result<(), BrokerError> {
        let line = request.encode();
        let reply = self.stream.lock().await.request(&line).await?;
        match BrokerReply::decode(&reply) {
            BrokerReply::Ack => {
                debug!(verb = request.verb(), "broker acknowledged");
                Ok(())
            }
            BrokerReply::Rejected(reason) => Err(BrokerError::Rejected(reason)),
        }
    }

    pub async fn chown(&self, uid: u32, gid: u32, target: CacheTarget) -> Result<(), BrokerError> {
        self.call(&BrokerRequest::Chown { uid, gid, target }).await
    }

    pub async fn publish(&self, dir: CacheName, file: CacheName) -> Result<(), BrokerError> {
        self.call(&BrokerRequest::Publish { dir, file }).await
    }

    pub async fn chunk(
        &self,
        part: u32,
        source: CachePath,
        dest: CachePath,
    ) -> Result<(), BrokerError> {
        self.call(&BrokerRequest::Chunk { part, source, dest }).await
    }
}
