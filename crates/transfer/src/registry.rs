//! Download deduplication.
//!
//! A [`Subscription`] moves through
//! `Pending -> Active -> Completing -> Reclaimed`:
//!
//! - `Pending`: queued, waiting for a worker slot.
//! - `Active`: a worker is fetching the file.
//! - `Completing`: the outcome has been broadcast; the worker waits (up to
//!   [`ACK_TIMEOUT`]) for every subscriber to let go.
//! - `Reclaimed`: removed from the registry.
//!
//! Subscriptions are shared through `Arc`, so a subscriber that outlives
//! the acknowledge timeout still holds a valid object.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use cachefs_store::{Direction, FileId, TransferStore};
use tokio::sync::{Mutex, Notify, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{ACK_TIMEOUT, TransferError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Active,
    Completing,
    Reclaimed,
}

/// How a download ended, as seen by its subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Cached,
    Failed,
}

/// Deduplication record for one file's download.
#[derive(Debug)]
pub struct Subscription {
    file_id: FileId,
    owner: u32,
    state: StdMutex<SubscriptionState>,
    subscribers: AtomicUsize,
    completion: watch::Sender<Option<Outcome>>,
    ack: Notify,
}

impl Subscription {
    fn new(file_id: FileId, owner: u32) -> Self {
        let (completion, _) = watch::channel(None);
        Self {
            file_id,
            owner,
            state: StdMutex::new(SubscriptionState::Pending),
            subscribers: AtomicUsize::new(0),
            completion,
            ack: Notify::new(),
        }
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// User that first requested the file.
    pub fn owner(&self) -> u32 {
        self.owner
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SubscriptionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Moves `from` to `to`; returns `false` if the state was something else.
    fn transition(&self, from: SubscriptionState, to: SubscriptionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return false;
        }
        *state = to;
        true
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }

    pub fn outcome(&self) -> Option<Outcome> {
        *self.completion.borrow()
    }

    fn join(self: &Arc<Self>) -> WaitHandle {
        self.subscribers.fetch_add(1, Ordering::SeqCst);
        WaitHandle {
            completion: self.completion.subscribe(),
            subscription: Arc::clone(self),
            released: false,
        }
    }

    /// Drops one subscriber. The count never goes below zero; releasing the
    /// last one wakes the worker waiting for acknowledgements.
    fn release(&self) {
        let previous = self
            .subscribers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.ack.notify_one();
        }
    }
}

/// A subscriber's claim on a download.
///
/// Dropping the handle unsubscribes.
#[derive(Debug)]
pub struct WaitHandle {
    subscription: Arc<Subscription>,
    completion: watch::Receiver<Option<Outcome>>,
    released: bool,
}

impl WaitHandle {
    pub fn file_id(&self) -> FileId {
        self.subscription.file_id
    }

    pub fn subscription(&self) -> &Arc<Subscription> {
        &self.subscription
    }

    /// Waits for the download's completion broadcast.
    pub async fn await_completion(&mut self) -> Outcome {
        match self.completion.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.unwrap_or(Outcome::Failed),
            Err(_) => Outcome::Failed,
        }
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.subscription.release();
        }
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    subscriptions: HashMap<FileId, Arc<Subscription>>,
    pending: VecDeque<FileId>,
}

/// Live subscriptions keyed by file, plus the queue of downloads waiting
/// for a worker.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to the download of `file_id`.
    ///
    /// The first caller creates the subscription and records a download
    /// in `store`; later callers join it. A subscription whose download
    /// failed is replaced, so a new request gets a new attempt.
    pub async fn subscribe(
        &self,
        store: &TransferStore,
        file_id: FileId,
        owner: u32,
    ) -> Result<WaitHandle, TransferError> {
        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner.subscriptions.get(&file_id) {
            let joinable = match existing.state() {
                SubscriptionState::Pending | SubscriptionState::Active => true,
                SubscriptionState::Completing => existing.outcome() == Some(Outcome::Cached),
                SubscriptionState::Reclaimed => false,
            };
            if joinable {
                let handle = existing.join();
                debug!(
                    file_id,
                    subscribers = existing.subscriber_count(),
                    "joined download"
                );
                return Ok(handle);
            }
        }

        store
            .create_transfer(file_id, owner, Direction::Download)
            .await?;
        let subscription = Arc::new(Subscription::new(file_id, owner));
        let handle = subscription.join();
        inner.subscriptions.insert(file_id, subscription);
        inner.pending.push_back(file_id);
        debug!(file_id, owner, "download queued");
        Ok(handle)
    }

    /// Takes the oldest pending download and marks it active.
    pub async fn next_download(&self) -> Option<Arc<Subscription>> {
        let mut inner = self.inner.lock().await;
        while let Some(file_id) = inner.pending.pop_front() {
            let Some(subscription) = inner.subscriptions.get(&file_id) else {
                continue;
            };
            if subscription.transition(SubscriptionState::Pending, SubscriptionState::Active) {
                return Some(Arc::clone(subscription));
            }
        }
        None
    }

    /// Number of downloads waiting for a worker.
    pub async fn pending_len(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    /// Number of subscriptions the registry still holds.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.subscriptions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get(&self, file_id: FileId) -> Option<Arc<Subscription>> {
        self.inner.lock().await.subscriptions.get(&file_id).cloned()
    }

    /// Broadcasts the outcome to every subscriber.
    pub fn complete(&self, subscription: &Subscription, outcome: Outcome) {
        subscription.set_state(SubscriptionState::Completing);
        subscription.completion.send_replace(Some(outcome));
        debug!(
            file_id = subscription.file_id,
            ?outcome,
            subscribers = subscription.subscriber_count(),
            "download completed"
        );
    }

    /// Waits until every subscriber has let go or [`ACK_TIMEOUT`] passes,
    /// then removes the subscription from the registry.
    pub async fn await_ack_and_reclaim(&self, subscription: &Arc<Subscription>) {
        let deadline = Instant::now() + ACK_TIMEOUT;
        while subscription.subscriber_count() > 0 {
            if tokio::time::timeout_at(deadline, subscription.ack.notified())
                .await
                .is_err()
            {
                warn!(
                    file_id = subscription.file_id,
                    subscribers = subscription.subscriber_count(),
                    "acknowledge timeout, reclaiming subscription"
                );
                break;
            }
        }
        self.reclaim(subscription).await;
    }

    async fn reclaim(&self, subscription: &Arc<Subscription>) {
        let mut inner = self.inner.lock().await;
        let current = inner.subscriptions.get(&subscription.file_id);
        if current.is_some_and(|current| Arc::ptr_eq(current, subscription)) {
            inner.subscriptions.remove(&subscription.file_id);
        }
        subscription.set_state(SubscriptionState::Reclaimed);
        debug!(file_id = subscription.file_id, "subscription reclaimed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachefs_store::Owner;
    use std::time::Duration;

    const OWNER: Owner = Owner {
        uid: 1000,
        gid: 1000,
        permissions: 0o644,
    };

    async fn store_with_file() -> (TransferStore, FileId) {
        let store = TransferStore::in_memory().await.unwrap();
        let file = store
            .find_or_create_file("b", "/f", OWNER, OWNER)
            .await
            .unwrap();
        (store, file.id)
    }

    #[tokio::test]
    async fn second_subscriber_joins_first() {
        let (store, file) = store_with_file().await;
        let registry = SubscriptionRegistry::new();

        let a = registry.subscribe(&store, file, 1000).await.unwrap();
        let b = registry.subscribe(&store, file, 1001).await.unwrap();
        assert!(Arc::ptr_eq(a.subscription(), b.subscription()));
        assert_eq!(a.subscription().subscriber_count(), 2);
        assert_eq!(a.subscription().owner(), 1000);
        assert_eq!(registry.pending_len().await, 1);
        assert!(store.transfer_for_file(file).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_subscribes_share_one_subscription() {
        let (store, file) = store_with_file().await;
        let store = Arc::new(store);
        let registry = Arc::new(SubscriptionRegistry::new());

        let mut tasks = Vec::new();
        for uid in 0..16 {
            let store = store.clone();
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.subscribe(&store, file, uid).await.unwrap()
            }));
        }
        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }

        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.pending_len().await, 1);
        assert_eq!(handles[0].subscription().subscriber_count(), 16);
    }

    #[tokio::test]
    async fn next_download_activates_once() {
        let (store, file) = store_with_file().await;
        let registry = SubscriptionRegistry::new();
        let _a = registry.subscribe(&store, file, 1000).await.unwrap();

        let sub = registry.next_download().await.unwrap();
        assert_eq!(sub.state(), SubscriptionState::Active);
        assert!(registry.next_download().await.is_none());

        // Joining an active download does not queue it again.
        let _b = registry.subscribe(&store, file, 1000).await.unwrap();
        assert!(registry.next_download().await.is_none());
    }

    #[tokio::test]
    async fn completion_releases_every_subscriber() {
        let (store, file) = store_with_file().await;
        let registry = SubscriptionRegistry::new();
        let mut a = registry.subscribe(&store, file, 1000).await.unwrap();
        let mut b = registry.subscribe(&store, file, 1000).await.unwrap();
        let sub = registry.next_download().await.unwrap();

        let waiters = tokio::spawn(async move {
            let first = a.await_completion().await;
            let second = b.await_completion().await;
            a.unsubscribe();
            b.unsubscribe();
            (first, second)
        });

        registry.complete(&sub, Outcome::Cached);
        registry.await_ack_and_reclaim(&sub).await;
        assert_eq!(waiters.await.unwrap(), (Outcome::Cached, Outcome::Cached));
        assert_eq!(sub.state(), SubscriptionState::Reclaimed);
        assert_eq!(sub.subscriber_count(), 0);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn count_never_goes_negative() {
        let (store, file) = store_with_file().await;
        let registry = SubscriptionRegistry::new();
        let handle = registry.subscribe(&store, file, 1000).await.unwrap();
        let sub = Arc::clone(handle.subscription());

        handle.unsubscribe();
        assert_eq!(sub.subscriber_count(), 0);
        sub.release();
        sub.release();
        assert_eq!(sub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropping_handle_unsubscribes() {
        let (store, file) = store_with_file().await;
        let registry = SubscriptionRegistry::new();
        let handle = registry.subscribe(&store, file, 1000).await.unwrap();
        let sub = Arc::clone(handle.subscription());
        drop(handle);
        assert_eq!(sub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn straggler_is_reclaimed_after_timeout() {
        let (store, file) = store_with_file().await;
        let registry = SubscriptionRegistry::new();
        let mut straggler = registry.subscribe(&store, file, 1000).await.unwrap();
        // Pause only after the sqlite pool is used: auto-advance would
        // otherwise fire the pool's acquire timeout.
        tokio::time::pause();
        let sub = registry.next_download().await.unwrap();

        registry.complete(&sub, Outcome::Cached);
        let started = Instant::now();
        registry.await_ack_and_reclaim(&sub).await;
        assert!(started.elapsed() >= ACK_TIMEOUT);
        assert!(registry.get(file).await.is_none());

        // The straggler still holds a live subscription.
        assert_eq!(straggler.await_completion().await, Outcome::Cached);
        assert_eq!(straggler.subscription().state(), SubscriptionState::Reclaimed);
        straggler.unsubscribe();
        assert_eq!(sub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn early_unsubscribe_ends_ack_wait() {
        let (store, file) = store_with_file().await;
        let registry = SubscriptionRegistry::new();
        let handle = registry.subscribe(&store, file, 1000).await.unwrap();
        // Pause only after the sqlite pool is used: auto-advance would
        // otherwise fire the pool's acquire timeout.
        tokio::time::pause();
        let sub = registry.next_download().await.unwrap();
        registry.complete(&sub, Outcome::Cached);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            handle.unsubscribe();
        });
        let started = Instant::now();
        registry.await_ack_and_reclaim(&sub).await;
        assert!(started.elapsed() < ACK_TIMEOUT);
    }

    #[tokio::test]
    async fn failed_download_is_replaced_on_next_request() {
        let (store, file) = store_with_file().await;
        let registry = SubscriptionRegistry::new();
        let mut old = registry.subscribe(&store, file, 1000).await.unwrap();
        let sub = registry.next_download().await.unwrap();
        registry.complete(&sub, Outcome::Failed);
        assert_eq!(old.await_completion().await, Outcome::Failed);

        let fresh = registry.subscribe(&store, file, 1000).await.unwrap();
        assert!(!Arc::ptr_eq(fresh.subscription(), &sub));
        assert_eq!(fresh.subscription().state(), SubscriptionState::Pending);

        // Reclaiming the old subscription leaves the fresh one registered.
        old.unsubscribe();
        registry.await_ack_and_reclaim(&sub).await;
        let current = registry.get(file).await.unwrap();
        assert!(Arc::ptr_eq(&current, fresh.subscription()));
    }

    #[tokio::test]
    async fn cached_completion_can_still_be_joined() {
        let (store, file) = store_with_file().await;
        let registry = SubscriptionRegistry::new();
        let _first = registry.subscribe(&store, file, 1000).await.unwrap();
        let sub = registry.next_download().await.unwrap();
        registry.complete(&sub, Outcome::Cached);

        let mut late = registry.subscribe(&store, file, 1000).await.unwrap();
        assert!(Arc::ptr_eq(late.subscription(), &sub));
        assert_eq!(late.await_completion().await, Outcome::Cached);
    }
}
