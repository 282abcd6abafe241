//! Transfer scheduling for the cache.
//!
//! Downloads are deduplicated per file through the
//! [`SubscriptionRegistry`]: however many callers ask for the same file
//! while it is queued or in flight, one worker fetches it and every caller
//! is released by the same completion broadcast. Uploads are queued in the
//! transfer store and preferred over downloads when a worker slot frees up.
//! Files larger than one chunk go through the
//! [`MultipartUploadCoordinator`].

mod adapter;
mod multipart;
mod registry;
mod scheduler;
mod worker;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use adapter::{AdapterEndpoint, AdapterLink, AdapterSession};
pub use multipart::MultipartUploadCoordinator;
pub use registry::{Outcome, Subscription, SubscriptionRegistry, SubscriptionState, WaitHandle};
pub use scheduler::TransferScheduler;

use std::sync::Arc;
use std::time::Duration;

use cachefs_broker::{BrokerClient, BrokerError};
use cachefs_channel::ChannelError;
use cachefs_protocol::{CacheLayout, ProtocolError};
use cachefs_remote::{RemoteError, RemoteStore};
use cachefs_store::{StoreError, TransferId, TransferStore};

/// How long a finished download waits for its subscribers to let go.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(60);

/// Default preferred multipart chunk size: 25 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 25 * 1024 * 1024;

/// Smallest part the remote store accepts, except for the last one.
pub const MIN_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Default number of concurrent transfers.
pub const DEFAULT_WORKER_SLOTS: usize = 4;

/// First retry delay after a failed upload.
pub const RETRY_BACKOFF_MIN: Duration = Duration::from_secs(1);

/// Upper bound of the retry delay.
pub const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Errors produced while running a transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer {0} still has parts without an ETag")]
    Incomplete(TransferId),

    #[error("adapter refused connection: {0}")]
    Refused(String),

    #[error("timed out")]
    Timeout,
}

/// Collaborators shared by the scheduler and its workers.
pub struct TransferContext {
    pub store: Arc<TransferStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub broker: Arc<BrokerClient>,
    pub layout: CacheLayout,
    pub chunk_size: u64,
}
