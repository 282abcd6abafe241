//! Test fixtures: a cache tree, an in-memory store and remote, and a
//! broker served in-process with this process as its peer.
//!
//! Compiled for this crate's unit tests and, through the `test-support`
//! feature, for the integration tests.

use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cachefs_broker::{Authorizer, BROKER_SOCKET_MODE, BrokerClient, BrokerOps, BrokerServer};
use cachefs_channel::CredentialListener;
use cachefs_protocol::CacheLayout;
use cachefs_remote::MemoryRemote;
use cachefs_store::{FileEntry, Owner, TransferStore};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::{TransferContext, TransferScheduler};

pub struct Harness {
    root: TempDir,
    pub ctx: Arc<TransferContext>,
    pub remote: Arc<MemoryRemote>,
    pub owner: Owner,
    pub parent_owner: Owner,
    cancel: CancellationToken,
}

impl Harness {
    pub async fn start(chunk_size: u64) -> Self {
        let root = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(root.path().join("cache"));
        std::fs::create_dir_all(layout.inprogress_root()).unwrap();

        let socket = root.path().join("broker.sock");
        let listener = CredentialListener::bind(&socket, BROKER_SOCKET_MODE).unwrap();
        let server = BrokerServer::new(
            listener,
            Authorizer::new(std::process::id()),
            BrokerOps::new(layout.clone(), chunk_size),
        );
        let cancel = CancellationToken::new();
        tokio::spawn(server.run(cancel.clone()));
        let broker = BrokerClient::connect(&socket).await.unwrap();

        let remote = Arc::new(MemoryRemote::new());
        let ctx = Arc::new(TransferContext {
            store: Arc::new(TransferStore::in_memory().await.unwrap()),
            remote: remote.clone(),
            broker: Arc::new(broker),
            layout,
            chunk_size,
        });

        let meta = std::fs::metadata(root.path()).unwrap();
        let owner = Owner {
            uid: meta.uid(),
            gid: meta.gid(),
            permissions: 0o644,
        };
        Self {
            root,
            ctx,
            remote,
            owner,
            parent_owner: Owner {
                permissions: 0o755,
                ..owner
            },
            cancel,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    /// Cancelled when the harness is dropped.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// A scheduler over this harness, already running.
    pub fn scheduler(&self, slots: usize) -> Arc<TransferScheduler> {
        let scheduler = TransferScheduler::new(self.ctx.clone(), slots);
        tokio::spawn(scheduler.clone().run(self.cancel.clone()));
        scheduler
    }

    /// Catalog entry for `remote_path`, not cached.
    pub async fn file(&self, remote_path: &str) -> FileEntry {
        self.ctx
            .store
            .find_or_create_file("bucket", remote_path, self.owner, self.parent_owner)
            .await
            .unwrap()
    }

    /// Catalog entry for `remote_path` with `body` in the shared cache,
    /// marked as changed locally.
    pub async fn cached_file(&self, remote_path: &str, body: &[u8]) -> FileEntry {
        let entry = self.file(remote_path).await;
        std::fs::create_dir_all(self.ctx.layout.shared_dir(&entry.path.dir)).unwrap();
        std::fs::write(self.ctx.layout.shared_file(&entry.path), body).unwrap();
        self.ctx
            .store
            .mark_changed(entry.id, body.len() as u64)
            .await
            .unwrap();
        self.ctx.store.file(entry.id).await.unwrap()
    }

    /// Waits until `entry` has no transfer record left.
    pub async fn wait_until_retired(&self, entry: &FileEntry) {
        tokio::time::timeout(Duration::from_secs(30), async {
            while self
                .ctx
                .store
                .transfer_for_file(entry.id)
                .await
                .unwrap()
                .is_some()
            {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("transfer was not retired");
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
