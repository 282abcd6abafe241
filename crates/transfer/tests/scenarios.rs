//! End-to-end transfer scenarios against an in-memory remote and an
//! in-process broker.

use std::time::Duration;

use cachefs_protocol::constants::errno;
use cachefs_protocol::{AdapterReply, ConnectRequest};
use cachefs_remote::RemoteOp;
use cachefs_transfer::test_support::Harness;
use cachefs_transfer::{
    AdapterEndpoint, AdapterLink, MultipartUploadCoordinator, Outcome, TransferScheduler,
};

const MIB: u64 = 1024 * 1024;

fn patterned(len: u64) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

#[tokio::test]
async fn concurrent_requests_share_one_download() {
    let s = Harness::start(MIB).await;
    s.remote.insert_object("bucket", "shared.bin", &b"once"[..]).await;
    s.remote.hold_downloads();
    let entry = s.file("/shared.bin").await;
    let scheduler = s.scheduler(4);

    let mut waiters = Vec::new();
    for _ in 0..8 {
        let scheduler = scheduler.clone();
        let file_id = entry.id;
        let uid = s.owner.uid;
        waiters.push(tokio::spawn(async move {
            let mut handle = scheduler.request_download(file_id, uid).await.unwrap();
            let outcome = handle.await_completion().await;
            handle.unsubscribe();
            outcome
        }));
    }

    // Wait for every waiter to be subscribed and the single fetch to be in
    // flight, then join it late.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let subscribers = scheduler
                .registry()
                .get(entry.id)
                .await
                .map_or(0, |sub| sub.subscriber_count());
            if subscribers == 8 && s.remote.calls(RemoteOp::Get).await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let mut late = scheduler.request_download(entry.id, s.owner.uid).await.unwrap();

    s.remote.release_downloads();
    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), Outcome::Cached);
    }
    assert_eq!(late.await_completion().await, Outcome::Cached);
    late.unsubscribe();

    assert_eq!(s.remote.calls(RemoteOp::Get).await, 1);
    let shared = s.ctx.layout.shared_file(&entry.path);
    assert_eq!(std::fs::read(shared).unwrap(), b"once");
    assert!(s.ctx.store.file(entry.id).await.unwrap().cached);
}

#[tokio::test]
async fn seventy_mib_upload_goes_out_in_three_ordered_parts() {
    let s = Harness::start(25 * MIB).await;
    let body = patterned(70 * MIB);
    let entry = s.cached_file("/big/video.raw", &body).await;
    let scheduler = s.scheduler(2);

    scheduler.schedule_upload(entry.id, s.owner.uid).await.unwrap();
    s.wait_until_retired(&entry).await;

    let manifests = s.remote.manifests().await;
    assert_eq!(manifests.len(), 1);
    let (key, parts) = &manifests[0];
    assert_eq!(key, "big/video.raw");
    let numbers: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);

    let stored = s.remote.object("bucket", "big/video.raw").await.unwrap();
    assert_eq!(stored.body.len() as u64, 70 * MIB);
    assert_eq!(&stored.body[..], &body[..]);
    assert_eq!(s.remote.calls(RemoteOp::Put).await, 0);
    assert!(!s.ctx.store.file(entry.id).await.unwrap().changed);
}

#[tokio::test]
async fn interrupted_multipart_resumes_without_resending_parts() {
    let s = Harness::start(4).await;
    let entry = s.cached_file("/resume.bin", b"0123456789").await;
    s.ctx.store.requeue_upload(entry.id, s.owner.uid).await.unwrap();
    let coordinator = MultipartUploadCoordinator::new(&s.ctx);

    // Part 1 goes through, part 2 fails.
    let inputs = s.ctx.store.upload_inputs(entry.id).await.unwrap();
    let upload_id = coordinator.initiate(&inputs).await.unwrap();
    s.ctx
        .store
        .create_parts(inputs.transfer_id, coordinator.part_count(inputs.size))
        .await
        .unwrap();
    coordinator.upload_part(&inputs, &upload_id, 1).await.unwrap();
    s.remote.fail_next(RemoteOp::UploadPart, 1).await;
    assert!(coordinator.upload_part(&inputs, &upload_id, 2).await.is_err());
    assert_eq!(s.remote.pending_parts(&upload_id).await, vec![1]);

    // A later pass reloads the record and picks up where it stopped.
    let resumed = s.ctx.store.upload_inputs(entry.id).await.unwrap();
    assert_eq!(resumed.upload_id.as_deref(), Some(upload_id.as_str()));
    coordinator.run(&resumed).await.unwrap();

    assert_eq!(s.remote.calls(RemoteOp::CreateMultipart).await, 1);
    // 1, 2 (failed), 2, 3
    assert_eq!(s.remote.calls(RemoteOp::UploadPart).await, 4);
    let stored = s.remote.object("bucket", "resume.bin").await.unwrap();
    assert_eq!(stored.body, &b"0123456789"[..]);
    assert!(s.ctx.store.transfer_for_file(entry.id).await.unwrap().is_none());
}

#[tokio::test]
async fn failed_put_keeps_record_until_retry_succeeds() {
    let s = Harness::start(MIB).await;
    let entry = s.cached_file("/notes.txt", b"draft two").await;
    s.remote.fail_next(RemoteOp::Put, 1).await;
    let scheduler = s.scheduler(1);

    scheduler.schedule_upload(entry.id, s.owner.uid).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while s.remote.calls(RemoteOp::Put).await == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(s.ctx.store.transfer_for_file(entry.id).await.unwrap().is_some());
    assert!(s.remote.object("bucket", "notes.txt").await.is_none());

    s.wait_until_retired(&entry).await;
    assert_eq!(s.remote.calls(RemoteOp::Put).await, 2);
    let stored = s.remote.object("bucket", "notes.txt").await.unwrap();
    assert_eq!(stored.body, &b"draft two"[..]);
}

#[tokio::test]
async fn failed_download_releases_subscribers_and_drops_record() {
    let s = Harness::start(MIB).await;
    let entry = s.file("/absent.txt").await;
    let scheduler = s.scheduler(2);

    let mut first = scheduler.request_download(entry.id, s.owner.uid).await.unwrap();
    let mut second = scheduler.request_download(entry.id, s.owner.uid).await.unwrap();
    assert_eq!(first.await_completion().await, Outcome::Failed);
    assert_eq!(second.await_completion().await, Outcome::Failed);
    first.unsubscribe();
    second.unsubscribe();

    assert!(s.ctx.store.transfer_for_file(entry.id).await.unwrap().is_none());
    assert!(!s.ctx.store.file(entry.id).await.unwrap().cached);

    // The object shows up; a new request tries again.
    s.remote.insert_object("bucket", "absent.txt", &b"here now"[..]).await;
    let mut retry = scheduler.request_download(entry.id, s.owner.uid).await.unwrap();
    assert_eq!(retry.await_completion().await, Outcome::Cached);
    retry.unsubscribe();
    assert_eq!(s.remote.calls(RemoteOp::Get).await, 2);
    assert!(s.ctx.store.transfer_for_file(entry.id).await.unwrap().is_none());
}

#[tokio::test]
async fn new_file_uploads_after_its_download_failed() {
    let s = Harness::start(MIB).await;
    let entry = s.file("/fresh.txt").await;
    let scheduler = s.scheduler(1);

    let mut handle = scheduler.request_download(entry.id, s.owner.uid).await.unwrap();
    assert_eq!(handle.await_completion().await, Outcome::Failed);
    handle.unsubscribe();

    let entry = s.cached_file("/fresh.txt", b"written locally").await;
    scheduler.schedule_upload(entry.id, s.owner.uid).await.unwrap();
    s.wait_until_retired(&entry).await;
    let stored = s.remote.object("bucket", "fresh.txt").await.unwrap();
    assert_eq!(stored.body, &b"written locally"[..]);
}

/// Starts a multipart upload of `before`, sends part 1, then rewrites the
/// file with `after` and requests the upload again. Returns the abandoned
/// session and the inputs of the new upload.
async fn edit_during_multipart(
    s: &Harness,
    before: &[u8],
    after: &[u8],
) -> (String, cachefs_store::UploadInputs) {
    let entry = s.cached_file("/edited.bin", before).await;
    let scheduler = TransferScheduler::new(s.ctx.clone(), 1);
    scheduler.schedule_upload(entry.id, s.owner.uid).await.unwrap();

    let coordinator = MultipartUploadCoordinator::new(&s.ctx);
    let inputs = s.ctx.store.upload_inputs(entry.id).await.unwrap();
    let stale_session = coordinator.initiate(&inputs).await.unwrap();
    s.ctx
        .store
        .create_parts(inputs.transfer_id, coordinator.part_count(inputs.size))
        .await
        .unwrap();
    coordinator.upload_part(&inputs, &stale_session, 1).await.unwrap();

    let entry = s.cached_file("/edited.bin", after).await;
    scheduler.schedule_upload(entry.id, s.owner.uid).await.unwrap();
    let fresh = s.ctx.store.upload_inputs(entry.id).await.unwrap();
    assert_ne!(fresh.transfer_id, inputs.transfer_id);
    assert_eq!(fresh.upload_id, None);
    assert_eq!(fresh.size, after.len() as u64);
    (stale_session, fresh)
}

#[tokio::test]
async fn edit_that_grows_a_multipart_upload_sends_only_new_bytes() {
    let s = Harness::start(4).await;
    let (stale, fresh) = edit_during_multipart(&s, b"0123456789", b"abcdefghijklmn").await;
    assert_eq!(s.remote.calls(RemoteOp::AbortMultipart).await, 1);
    assert!(s.remote.pending_parts(&stale).await.is_empty());

    MultipartUploadCoordinator::new(&s.ctx).run(&fresh).await.unwrap();

    let stored = s.remote.object("bucket", "edited.bin").await.unwrap();
    assert_eq!(stored.body, &b"abcdefghijklmn"[..]);
    let manifests = s.remote.manifests().await;
    assert_eq!(manifests.len(), 1);
    assert_eq!(manifests[0].1.len(), 4);
    assert!(!s.ctx.store.file(fresh.file_id).await.unwrap().changed);
}

#[tokio::test]
async fn edit_that_shrinks_a_multipart_upload_completes() {
    let s = Harness::start(4).await;
    let (_, fresh) = edit_during_multipart(&s, b"0123456789", b"abcdef").await;

    MultipartUploadCoordinator::new(&s.ctx).run(&fresh).await.unwrap();

    let stored = s.remote.object("bucket", "edited.bin").await.unwrap();
    assert_eq!(stored.body, &b"abcdef"[..]);
    assert_eq!(s.remote.manifests().await[0].1.len(), 2);
    assert!(s.ctx.store.transfer_for_file(fresh.file_id).await.unwrap().is_none());
}

#[tokio::test]
async fn edit_during_a_single_put_is_uploaded_afterwards() {
    let s = Harness::start(MIB).await;
    let entry = s.cached_file("/notes.txt", b"first").await;
    s.remote.hold_uploads();
    let scheduler = s.scheduler(1);

    scheduler.schedule_upload(entry.id, s.owner.uid).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while s.remote.calls(RemoteOp::Put).await == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // The first PUT is in flight with the old contents.
    let entry = s.cached_file("/notes.txt", b"second").await;
    scheduler.schedule_upload(entry.id, s.owner.uid).await.unwrap();
    s.remote.release_uploads();

    s.wait_until_retired(&entry).await;
    assert_eq!(s.remote.calls(RemoteOp::Put).await, 2);
    let stored = s.remote.object("bucket", "notes.txt").await.unwrap();
    assert_eq!(stored.body, &b"second"[..]);
    assert!(!s.ctx.store.file(entry.id).await.unwrap().changed);
}

#[tokio::test]
async fn adapter_requests_end_to_end() {
    let s = Harness::start(MIB).await;
    s.remote.insert_object("bucket", "docs/readme.md", &b"# hi"[..]).await;
    let scheduler = s.scheduler(4);

    let socket = s.path("adapter.sock");
    let endpoint = AdapterEndpoint::bind(&socket, 0o600).unwrap();
    let accept = tokio::spawn(async move { endpoint.accept("bucket").await });
    let request = ConnectRequest {
        bucket: "bucket".into(),
        access_key: "AKID".into(),
        secret_key: "secret".into(),
    };
    let link = AdapterLink::connect(&socket, &request, scheduler).await.unwrap();
    let mut session = accept.await.unwrap().unwrap();
    tokio::spawn(link.serve(s.cancel_token()));

    assert_eq!(session.cache("/docs/readme.md").await.unwrap(), AdapterReply::Ok);
    assert_eq!(session.cache("/docs/readme.md").await.unwrap(), AdapterReply::Ok);
    assert_eq!(s.remote.calls(RemoteOp::Get).await, 1);

    let entry = s.ctx.store.file_by_remote("/docs/readme.md").await.unwrap().unwrap();
    let shared = s.ctx.layout.shared_file(&entry.path);
    assert_eq!(std::fs::read(&shared).unwrap(), b"# hi");

    assert_eq!(
        session.cache("/docs/missing.md").await.unwrap(),
        AdapterReply::Error(errno::EIO)
    );
    assert_eq!(
        session.send_line("FETCH /docs/readme.md").await.unwrap(),
        AdapterReply::Error(errno::EINVAL)
    );
    assert_eq!(
        session.upload("/docs/unknown.md").await.unwrap(),
        AdapterReply::Error(errno::ENOENT)
    );

    std::fs::write(&shared, b"# hello").unwrap();
    assert_eq!(session.upload("/docs/readme.md").await.unwrap(), AdapterReply::Ok);
    s.wait_until_retired(&entry).await;
    let stored = s.remote.object("bucket", "docs/readme.md").await.unwrap();
    assert_eq!(stored.body, &b"# hello"[..]);
}
