//! Worker slot scheduling.
//!
//! Each slot is `Idle` or runs one transfer. On every pass the scheduler
//! fills free slots, taking the oldest pending upload first and the oldest
//! queued download after that, then sleeps until new work is queued, a
//! worker finishes, or a backed-off upload becomes eligible again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cachefs_protocol::number_of_multiparts;
use cachefs_remote::object_key;
use cachefs_store::{Direction, FileId, UploadInputs};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::multipart::MultipartUploadCoordinator;
use crate::registry::{Outcome, Subscription, SubscriptionRegistry, WaitHandle};
use crate::worker;
use crate::{RETRY_BACKOFF_MAX, RETRY_BACKOFF_MIN, TransferContext, TransferError};

/// Delay before retrying an upload that has failed `failures` times in a row.
pub(crate) fn backoff_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    RETRY_BACKOFF_MIN
        .saturating_mul(1u32 << exponent)
        .min(RETRY_BACKOFF_MAX)
}

#[derive(Debug, Clone, Copy)]
struct Backoff {
    failures: u32,
    retry_at: Instant,
}

enum Job {
    Download(Arc<Subscription>),
    Upload(FileId),
}

impl Job {
    fn file_id(&self) -> FileId {
        match self {
            Self::Download(sub) => sub.file_id(),
            Self::Upload(file_id) => *file_id,
        }
    }

    fn direction(&self) -> Direction {
        match self {
            Self::Download(_) => Direction::Download,
            Self::Upload(_) => Direction::Upload,
        }
    }
}

/// Slot occupancy and upload backoff, guarded by the queue lock.
struct SlotTable {
    slots: Vec<Option<FileId>>,
    backoff: HashMap<FileId, Backoff>,
}

impl SlotTable {
    fn new(worker_slots: usize) -> Self {
        Self {
            slots: vec![None; worker_slots.max(1)],
            backoff: HashMap::new(),
        }
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    fn is_running(&self, file_id: FileId) -> bool {
        self.slots.iter().flatten().any(|&running| running == file_id)
    }

    fn release(&mut self, slot: usize) {
        if let Some(entry) = self.slots.get_mut(slot) {
            *entry = None;
        }
    }

    fn record_failure(&mut self, file_id: FileId) -> Duration {
        let failures = self
            .backoff
            .get(&file_id)
            .map_or(1, |b| b.failures.saturating_add(1));
        let delay = backoff_delay(failures);
        self.backoff.insert(
            file_id,
            Backoff {
                failures,
                retry_at: Instant::now() + delay,
            },
        );
        delay
    }
}

/// Runs transfers in a fixed number of worker slots.
pub struct TransferScheduler {
    ctx: Arc<TransferContext>,
    registry: SubscriptionRegistry,
    slots: Mutex<SlotTable>,
    wake: Notify,
}

impl TransferScheduler {
    pub fn new(ctx: Arc<TransferContext>, worker_slots: usize) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            registry: SubscriptionRegistry::new(),
            slots: Mutex::new(SlotTable::new(worker_slots)),
            wake: Notify::new(),
        })
    }

    pub fn context(&self) -> &TransferContext {
        &self.ctx
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Subscribes to the download of `file_id`, queueing it if nobody
    /// else already has.
    pub async fn request_download(
        &self,
        file_id: FileId,
        owner: u32,
    ) -> Result<WaitHandle, TransferError> {
        let handle = self
            .registry
            .subscribe(&self.ctx.store, file_id, owner)
            .await?;
        self.wake.notify_one();
        Ok(handle)
    }

    /// Queues an upload of the current contents of `file_id`.
    ///
    /// An upload already queued for the file starts over, and its
    /// multipart session is abandoned. A fresh request also clears any
    /// backoff left from earlier failures.
    pub async fn schedule_upload(&self, file_id: FileId, owner: u32) -> Result<(), TransferError> {
        let (record, abandoned) = self.ctx.store.requeue_upload(file_id, owner).await?;
        self.slots.lock().await.backoff.remove(&file_id);
        debug!(file_id, owner, transfer_id = record.id, "upload queued");
        self.wake.notify_one();

        if let Some(upload_id) = abandoned {
            self.abort_session(file_id, &upload_id).await;
        }
        Ok(())
    }

    async fn abort_session(&self, file_id: FileId, upload_id: &str) {
        let entry = match self.ctx.store.file(file_id).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(file_id, upload_id, "cannot abort multipart upload: {e}");
                return;
            }
        };
        let key = object_key(&entry.remote_path);
        match self
            .ctx
            .remote
            .abort_multipart_upload(&entry.bucket, key, upload_id)
            .await
        {
            Ok(()) => debug!(file_id, upload_id, "stale multipart upload aborted"),
            // Stray parts are only storage; the new upload does not need them.
            Err(e) => warn!(file_id, upload_id, "failed to abort multipart upload: {e}"),
        }
    }

    /// Number of slots currently running a transfer.
    pub async fn busy_slots(&self) -> usize {
        self.slots.lock().await.slots.iter().flatten().count()
    }

    /// Fills slots until `cancel` fires. Running transfers are left to
    /// finish on their own tasks.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let slots = self.slots.lock().await.slots.len();
        info!(slots, chunk_size = self.ctx.chunk_size, "transfer scheduler started");

        loop {
            let next_retry = self.fill_slots().await;
            let retry = async {
                match next_retry {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("transfer scheduler stopped");
                    break;
                }
                _ = self.wake.notified() => {}
                _ = retry => {}
            }
        }
    }

    /// One scheduling pass. Returns when the earliest backed-off upload
    /// becomes eligible, if any was skipped.
    async fn fill_slots(self: &Arc<Self>) -> Option<Instant> {
        let mut table = self.slots.lock().await;
        let now = Instant::now();
        let mut next_retry: Option<Instant> = None;

        let uploads = match self.ctx.store.pending_uploads().await {
            Ok(uploads) => uploads,
            Err(e) => {
                error!("failed to list pending uploads: {e}");
                Vec::new()
            }
        };
        let mut uploads = uploads.into_iter();

        while let Some(slot) = table.free_slot() {
            let mut job = None;
            for file_id in uploads.by_ref() {
                if table.is_running(file_id) {
                    continue;
                }
                if let Some(backoff) = table.backoff.get(&file_id) {
                    if backoff.retry_at > now {
                        let at = backoff.retry_at;
                        next_retry = Some(next_retry.map_or(at, |t: Instant| t.min(at)));
                        continue;
                    }
                }
                job = Some(Job::Upload(file_id));
                break;
            }
            if job.is_none() {
                job = self.registry.next_download().await.map(Job::Download);
            }
            let Some(job) = job else {
                break;
            };

            table.slots[slot] = Some(job.file_id());
            debug!(
                slot,
                file_id = job.file_id(),
                direction = %job.direction(),
                "transfer dispatched"
            );
            self.spawn_job(slot, job);
        }

        next_retry
    }

    fn spawn_job(self: &Arc<Self>, slot: usize, job: Job) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match job {
                Job::Download(subscription) => this.finish_download(slot, subscription).await,
                Job::Upload(file_id) => this.finish_upload(slot, file_id).await,
            }
        });
    }

    async fn finish_download(&self, slot: usize, subscription: Arc<Subscription>) {
        let file_id = subscription.file_id();
        let outcome = match worker::download(&self.ctx, file_id).await {
            Ok(bytes) => {
                info!(slot, file_id, bytes, direction = %Direction::Download, "transfer finished");
                Outcome::Cached
            }
            Err(e) => {
                warn!(slot, file_id, direction = %Direction::Download, "transfer failed: {e}");
                self.drop_download_record(file_id).await;
                Outcome::Failed
            }
        };

        // Subscribers are released before the slot is seen as free.
        {
            let mut table = self.slots.lock().await;
            self.registry.complete(&subscription, outcome);
            table.release(slot);
        }
        self.wake.notify_one();
        self.registry.await_ack_and_reclaim(&subscription).await;
    }

    /// Nothing retries a failed download on its own, and its record would
    /// keep uploads of the file out. The next request queues a new one.
    /// Runs before subscribers are released, so it never removes a record
    /// queued by a later request.
    async fn drop_download_record(&self, file_id: FileId) {
        let store = &self.ctx.store;
        let result = match store.transfer_for_file(file_id).await {
            Ok(Some(record)) if record.direction == Direction::Download => {
                store.delete_transfer(record.id).await
            }
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(file_id, "failed to drop download record: {e}");
        }
    }

    async fn finish_upload(&self, slot: usize, file_id: FileId) {
        let result = self.upload(file_id).await;

        let mut table = self.slots.lock().await;
        match result {
            Ok(()) => {
                table.backoff.remove(&file_id);
                info!(slot, file_id, direction = %Direction::Upload, "transfer finished");
            }
            Err(UploadFailure::Superseded(e)) => {
                debug!(slot, file_id, "superseded upload stopped: {e}");
            }
            Err(UploadFailure::Failed(e)) => {
                let delay = table.record_failure(file_id);
                warn!(
                    slot,
                    file_id,
                    direction = %Direction::Upload,
                    retry_in_ms = delay.as_millis() as u64,
                    "transfer failed: {e}"
                );
            }
        }
        table.release(slot);
        drop(table);
        self.wake.notify_one();
    }

    async fn upload(&self, file_id: FileId) -> Result<(), UploadFailure> {
        let inputs = self
            .ctx
            .store
            .upload_inputs(file_id)
            .await
            .map_err(|e| UploadFailure::Failed(e.into()))?;
        let multipart = inputs.upload_id.is_some()
            || number_of_multiparts(inputs.size, self.ctx.chunk_size) > 1;
        let result = if multipart {
            MultipartUploadCoordinator::new(&self.ctx).run(&inputs).await
        } else {
            worker::upload_single(&self.ctx, &inputs).await
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if self.superseded(&inputs).await => Err(UploadFailure::Superseded(e)),
            Err(e) => Err(UploadFailure::Failed(e)),
        }
    }

    /// True when the record `inputs` was read from has been replaced or
    /// retired since.
    async fn superseded(&self, inputs: &UploadInputs) -> bool {
        match self.ctx.store.transfer_for_file(inputs.file_id).await {
            Ok(Some(record)) => record.id != inputs.transfer_id,
            Ok(None) => true,
            Err(_) => false,
        }
    }
}

/// Why an upload did not retire its record.
enum UploadFailure {
    /// A newer request replaced the record mid-flight. Not a failure of
    /// the file, so no backoff applies.
    Superseded(TransferError),
    Failed(TransferError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;
    use cachefs_remote::RemoteOp;

    #[test]
    fn backoff_doubles_up_to_cap() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
        assert_eq!(backoff_delay(7), RETRY_BACKOFF_MAX);
        assert_eq!(backoff_delay(u32::MAX), RETRY_BACKOFF_MAX);
    }

    #[test]
    fn slot_table_tracks_failures() {
        let mut table = SlotTable::new(0);
        assert_eq!(table.slots.len(), 1);
        assert_eq!(table.record_failure(7), Duration::from_secs(1));
        assert_eq!(table.record_failure(7), Duration::from_secs(2));
        assert_eq!(table.backoff[&7].failures, 2);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn scheduler_loop_can_be_spawned() {
        let h = Harness::start(1024).await;
        let scheduler = TransferScheduler::new(h.ctx.clone(), 1);
        let run = scheduler.clone().run(CancellationToken::new());
        assert_send(&run);
        drop(run);
    }

    #[tokio::test]
    async fn requeued_upload_waits_for_the_running_one() {
        let h = Harness::start(1024).await;
        let entry = h.cached_file("/up.txt", b"one").await;
        h.remote.hold_uploads();
        let scheduler = h.scheduler(2);

        scheduler.schedule_upload(entry.id, h.owner.uid).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.remote.calls(RemoteOp::Put).await == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        h.cached_file("/up.txt", b"two").await;
        scheduler.schedule_upload(entry.id, h.owner.uid).await.unwrap();
        // A free slot does not start a second upload of the same file.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.remote.calls(RemoteOp::Put).await, 1);
        assert_eq!(scheduler.busy_slots().await, 1);

        h.remote.release_uploads();
        h.wait_until_retired(&entry).await;
        assert_eq!(h.remote.object("bucket", "up.txt").await.unwrap().body, &b"two"[..]);
        // The superseded attempt is not counted as a failure.
        assert!(scheduler.slots.lock().await.backoff.is_empty());
    }

    #[tokio::test]
    async fn uploads_are_dispatched_before_downloads() {
        let h = Harness::start(1024).await;
        let scheduler = TransferScheduler::new(h.ctx.clone(), 1);

        h.remote.insert_object("bucket", "down.txt", &b"d"[..]).await;
        let down = h.file("/down.txt").await;
        let up = h.cached_file("/up.txt", b"u").await;

        // Queue the download first; the upload still goes first.
        let mut handle = scheduler.request_download(down.id, h.owner.uid).await.unwrap();
        scheduler.schedule_upload(up.id, h.owner.uid).await.unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(scheduler.clone().run(cancel.clone()));

        assert_eq!(handle.await_completion().await, Outcome::Cached);
        handle.unsubscribe();
        assert!(h.remote.object("bucket", "up.txt").await.is_some());
        assert_eq!(h.remote.calls(RemoteOp::Put).await, 1);
        assert_eq!(h.remote.calls(RemoteOp::Get).await, 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn failed_upload_waits_for_backoff() {
        let h = Harness::start(1024).await;
        let scheduler = TransferScheduler::new(h.ctx.clone(), 2);
        let up = h.cached_file("/up.txt", b"u").await;
        h.remote.fail_next(RemoteOp::Put, 1).await;
        scheduler.schedule_upload(up.id, h.owner.uid).await.unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(scheduler.clone().run(cancel.clone()));

        // First attempt fails; the record stays until the retry succeeds.
        tokio::time::timeout(Duration::from_secs(10), async {
            while h.ctx.store.transfer_for_file(up.id).await.unwrap().is_some() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.remote.calls(RemoteOp::Put).await, 2);
        assert!(scheduler.slots.lock().await.backoff.is_empty());

        cancel.cancel();
        task.await.unwrap();
    }
}
