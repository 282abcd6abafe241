//! Access to the remote object store.
//!
//! Transfers only need a handful of requests: fetch an object, store a
//! small object, the three phases of a multipart upload, and abandoning a
//! multipart session. [`RemoteStore`]
//! captures exactly those, with [`S3Remote`] talking to an S3-compatible
//! service and [`MemoryRemote`] standing in for it in tests.

mod digest;
mod error;
mod memory;
mod s3;

pub use digest::{content_md5, md5_hex, object_key};
pub use error::{RemoteError, RemoteResult};
pub use memory::{MemoryRemote, RemoteOp, StoredObject};
pub use s3::{S3Config, S3Remote};

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

/// Metadata keys carrying ownership on stored objects.
pub const META_UID: &str = "uid";
pub const META_GID: &str = "gid";
pub const META_MODE: &str = "mode";

/// Ownership and permissions stored alongside an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
    pub uid: u32,
    pub gid: u32,
    pub permissions: u32,
}

impl ObjectMeta {
    pub fn to_map(self) -> HashMap<String, String> {
        HashMap::from([
            (META_UID.to_string(), self.uid.to_string()),
            (META_GID.to_string(), self.gid.to_string()),
            (META_MODE.to_string(), format!("{:o}", self.permissions)),
        ])
    }

    /// Reads ownership back from object metadata. Returns `None` unless all
    /// three keys are present and well formed.
    pub fn from_map(map: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            uid: map.get(META_UID)?.parse().ok()?,
            gid: map.get(META_GID)?.parse().ok()?,
            permissions: u32::from_str_radix(map.get(META_MODE)?, 8).ok()?,
        })
    }
}

/// Result of a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedObject {
    pub size: u64,
    pub meta: Option<ObjectMeta>,
}

/// One entry of a multipart completion manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Streams the object into `dest`, replacing its contents.
    async fn get_object(&self, bucket: &str, key: &str, dest: &Path)
    -> RemoteResult<FetchedObject>;

    /// Stores `body` in one request. Returns the ETag.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_md5: &str,
        meta: ObjectMeta,
    ) -> RemoteResult<String>;

    /// Starts a multipart upload. Returns the upload session token.
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        meta: ObjectMeta,
    ) -> RemoteResult<String>;

    /// Sends one part. Returns its ETag.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        content_md5: &str,
    ) -> RemoteResult<String>;

    /// Joins the uploaded parts listed in `parts`, which must be in order.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> RemoteResult<()>;

    /// Drops a multipart session and the parts sent to it.
    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str)
    -> RemoteResult<()>;
}
