//! In-memory [`RemoteStore`] with call accounting and failure injection.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{Mutex, watch};

use crate::digest::{content_md5, md5_hex};
use crate::error::{RemoteError, RemoteResult};
use crate::{CompletedPart, FetchedObject, ObjectMeta, RemoteStore};

/// Request kinds, for counting calls and injecting failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Get,
    Put,
    CreateMultipart,
    UploadPart,
    CompleteMultipart,
    AbortMultipart,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Bytes,
    pub meta: Option<ObjectMeta>,
    pub etag: String,
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    meta: ObjectMeta,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct State {
    objects: HashMap<(String, String), StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    next_upload: u64,
    calls: HashMap<RemoteOp, usize>,
    failures: HashMap<RemoteOp, u32>,
    manifests: Vec<(String, Vec<CompletedPart>)>,
}

impl State {
    fn record(&mut self, op: RemoteOp) -> RemoteResult<()> {
        *self.calls.entry(op).or_default() += 1;
        if let Some(remaining) = self.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RemoteError::Status {
                    code: 500,
                    message: format!("injected {op:?} failure"),
                });
            }
        }
        Ok(())
    }
}

fn check_digest(body: &[u8], expected: &str) -> RemoteResult<()> {
    if content_md5(body) != expected {
        return Err(RemoteError::Status {
            code: 400,
            message: "BadDigest".into(),
        });
    }
    Ok(())
}

/// Object store held in process memory.
///
/// Downloads and single-part stores can be held at a gate to keep a
/// transfer in flight while a test issues concurrent requests.
pub struct MemoryRemote {
    state: Mutex<State>,
    gate: watch::Sender<bool>,
    put_gate: watch::Sender<bool>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        let (put_gate, _) = watch::channel(true);
        Self {
            state: Mutex::new(State::default()),
            gate,
            put_gate,
        }
    }

    pub async fn insert_object(&self, bucket: &str, key: &str, body: impl Into<Bytes>) {
        let body = body.into();
        let etag = md5_hex(&body);
        self.state.lock().await.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body,
                meta: None,
                etag,
            },
        );
    }

    pub async fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.state
            .lock()
            .await
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Number of requests of kind `op` received so far, failed ones included.
    pub async fn calls(&self, op: RemoteOp) -> usize {
        self.state
            .lock()
            .await
            .calls
            .get(&op)
            .copied()
            .unwrap_or_default()
    }

    /// Makes the next `times` requests of kind `op` fail with a 500.
    pub async fn fail_next(&self, op: RemoteOp, times: u32) {
        self.state.lock().await.failures.insert(op, times);
    }

    /// Completion manifests received, in arrival order, keyed by object key.
    pub async fn manifests(&self) -> Vec<(String, Vec<CompletedPart>)> {
        self.state.lock().await.manifests.clone()
    }

    /// Parts received so far for a multipart upload still in progress.
    pub async fn pending_parts(&self, upload_id: &str) -> Vec<u32> {
        self.state
            .lock()
            .await
            .uploads
            .get(upload_id)
            .map(|u| u.parts.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Downloads block until [`release_downloads`](Self::release_downloads).
    pub fn hold_downloads(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_downloads(&self) {
        self.gate.send_replace(true);
    }

    /// Single-part stores block, after being counted, until
    /// [`release_uploads`](Self::release_uploads).
    pub fn hold_uploads(&self) {
        self.put_gate.send_replace(false);
    }

    pub fn release_uploads(&self) {
        self.put_gate.send_replace(true);
    }
}

async fn pass(gate: &watch::Sender<bool>) -> RemoteResult<()> {
    let mut gate = gate.subscribe();
    gate.wait_for(|open| *open)
        .await
        .map_err(|_| RemoteError::Request("remote shut down".into()))?;
    Ok(())
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        dest: &Path,
    ) -> RemoteResult<FetchedObject> {
        let object = {
            let mut state = self.state.lock().await;
            state.record(RemoteOp::Get)?;
            state
                .objects
                .get(&(bucket.to_string(), key.to_string()))
                .cloned()
                .ok_or_else(|| RemoteError::NotFound(key.to_string()))?
        };

        pass(&self.gate).await?;

        tokio::fs::write(dest, &object.body).await?;
        Ok(FetchedObject {
            size: object.body.len() as u64,
            meta: object.meta,
        })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_md5: &str,
        meta: ObjectMeta,
    ) -> RemoteResult<String> {
        {
            let mut state = self.state.lock().await;
            state.record(RemoteOp::Put)?;
            check_digest(&body, content_md5)?;
        }
        pass(&self.put_gate).await?;

        let etag = format!("\"{}\"", md5_hex(&body));
        self.state.lock().await.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body,
                meta: Some(meta),
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        meta: ObjectMeta,
    ) -> RemoteResult<String> {
        let mut state = self.state.lock().await;
        state.record(RemoteOp::CreateMultipart)?;

        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                meta,
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        content_md5: &str,
    ) -> RemoteResult<String> {
        let mut state = self.state.lock().await;
        state.record(RemoteOp::UploadPart)?;
        check_digest(&body, content_md5)?;

        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.bucket == bucket && u.key == key)
            .ok_or_else(|| RemoteError::NotFound(format!("upload {upload_id}")))?;
        let etag = format!("\"{}\"", md5_hex(&body));
        upload.parts.insert(part_number, (etag.clone(), body));
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> RemoteResult<()> {
        let mut state = self.state.lock().await;
        state.record(RemoteOp::CompleteMultipart)?;

        let upload = state
            .uploads
            .get(upload_id)
            .filter(|u| u.bucket == bucket && u.key == key)
            .ok_or_else(|| RemoteError::NotFound(format!("upload {upload_id}")))?;

        let invalid = |message: &str| RemoteError::Status {
            code: 400,
            message: message.to_string(),
        };
        if parts.is_empty() {
            return Err(invalid("MalformedXML"));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(invalid("InvalidPartOrder"));
        }

        let mut body = BytesMut::new();
        for part in parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, data)) if *etag == part.etag => body.extend_from_slice(data),
                _ => return Err(invalid("InvalidPart")),
            }
        }

        let meta = upload.meta;
        state.uploads.remove(upload_id);
        let body = body.freeze();
        let etag = format!("\"{}-{}\"", md5_hex(&body), parts.len());
        state.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body,
                meta: Some(meta),
                etag,
            },
        );
        state.manifests.push((key.to_string(), parts.to_vec()));
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> RemoteResult<()> {
        let mut state = self.state.lock().await;
        state.record(RemoteOp::AbortMultipart)?;

        let known = state
            .uploads
            .get(upload_id)
            .is_some_and(|u| u.bucket == bucket && u.key == key);
        if !known {
            return Err(RemoteError::NotFound(format!("upload {upload_id}")));
        }
        state.uploads.remove(upload_id);
        Ok(())
    }
}
