//! Multipart uploads.
//!
//! An upload larger than one chunk runs in three phases, each of which
//! leaves durable state behind so an interrupted transfer resumes where it
//! stopped:
//!
//! 1. **Initiate**: open an upload session once and record its token.
//! 2. **Parts**: carve each part through the broker and send it; its ETag
//!    is stored on the part row. Parts that already have an ETag are
//!    skipped.
//! 3. **Complete**: once every part has an ETag, send the ordered
//!    manifest. Only then is the transfer record removed.
//!
//! That state belongs to one version of the file. A new upload request
//! replaces the record and its parts, so an edited file is never
//! assembled from parts of its older contents.

use cachefs_protocol::{last_part_len, number_of_multiparts};
use cachefs_remote::{CompletedPart, content_md5, object_key};
use cachefs_store::UploadInputs;
use tracing::{debug, info, warn};

use crate::worker::{carve, object_meta, retire_upload};
use crate::{TransferContext, TransferError};

/// Drives one file through a multipart upload.
pub struct MultipartUploadCoordinator<'a> {
    ctx: &'a TransferContext,
}

impl<'a> MultipartUploadCoordinator<'a> {
    pub fn new(ctx: &'a TransferContext) -> Self {
        Self { ctx }
    }

    pub fn part_count(&self, size: u64) -> u32 {
        number_of_multiparts(size, self.ctx.chunk_size)
    }

    /// Runs all three phases.
    pub async fn run(&self, inputs: &UploadInputs) -> Result<(), TransferError> {
        let upload_id = self.initiate(inputs).await?;
        let parts = self.part_count(inputs.size);
        self.ctx.store.create_parts(inputs.transfer_id, parts).await?;
        debug!(
            file_id = inputs.file_id,
            parts,
            last_part = last_part_len(inputs.size, self.ctx.chunk_size),
            "multipart upload planned"
        );

        for part in 1..=parts {
            self.upload_part(inputs, &upload_id, part).await?;
        }
        self.complete(inputs, &upload_id).await
    }

    /// Returns the upload session token, opening a session only if the
    /// transfer has none yet.
    pub async fn initiate(&self, inputs: &UploadInputs) -> Result<String, TransferError> {
        if let Some(upload_id) = &inputs.upload_id {
            debug!(file_id = inputs.file_id, %upload_id, "resuming multipart upload");
            return Ok(upload_id.clone());
        }

        let upload_id = self
            .ctx
            .remote
            .create_multipart_upload(
                &inputs.bucket,
                object_key(&inputs.remote_path),
                object_meta(inputs.owner),
            )
            .await?;
        self.ctx
            .store
            .set_upload_id(inputs.transfer_id, &upload_id)
            .await?;
        info!(file_id = inputs.file_id, %upload_id, "multipart upload started");
        Ok(upload_id)
    }

    /// Sends part `part` unless it already has an ETag.
    pub async fn upload_part(
        &self,
        inputs: &UploadInputs,
        upload_id: &str,
        part: u32,
    ) -> Result<(), TransferError> {
        let store = &self.ctx.store;
        if store.part_etag(inputs.transfer_id, part).await?.is_some() {
            debug!(file_id = inputs.file_id, part, "part already uploaded");
            return Ok(());
        }

        store.mark_part_in_progress(inputs.transfer_id, part).await?;
        match self.send_part(inputs, upload_id, part).await {
            Ok(etag) => {
                store.set_part_etag(inputs.transfer_id, part, &etag).await?;
                debug!(file_id = inputs.file_id, part, %etag, "part uploaded");
                Ok(())
            }
            Err(e) => {
                if let Err(clear) = store.clear_part_in_progress(inputs.transfer_id, part).await {
                    warn!(file_id = inputs.file_id, part, "failed to clear part flag: {clear}");
                }
                Err(e)
            }
        }
    }

    async fn send_part(
        &self,
        inputs: &UploadInputs,
        upload_id: &str,
        part: u32,
    ) -> Result<String, TransferError> {
        let body = carve(self.ctx, part, &inputs.path).await?;
        let digest = content_md5(&body);
        let etag = self
            .ctx
            .remote
            .upload_part(
                &inputs.bucket,
                object_key(&inputs.remote_path),
                upload_id,
                part,
                body,
                &digest,
            )
            .await?;
        Ok(etag)
    }

    /// Sends the ordered manifest and retires the transfer.
    ///
    /// Fails with [`TransferError::Incomplete`] while any part lacks an
    /// ETag; nothing is sent in that case.
    pub async fn complete(
        &self,
        inputs: &UploadInputs,
        upload_id: &str,
    ) -> Result<(), TransferError> {
        let store = &self.ctx.store;
        if !store.all_parts_uploaded(inputs.transfer_id).await? {
            return Err(TransferError::Incomplete(inputs.transfer_id));
        }

        let manifest: Vec<CompletedPart> = store
            .parts(inputs.transfer_id)
            .await?
            .into_iter()
            .filter_map(|p| {
                p.etag.map(|etag| CompletedPart {
                    part_number: p.part,
                    etag,
                })
            })
            .collect();

        self.ctx
            .remote
            .complete_multipart_upload(
                &inputs.bucket,
                object_key(&inputs.remote_path),
                upload_id,
                &manifest,
            )
            .await?;

        retire_upload(self.ctx, inputs, inputs.size).await?;
        info!(
            file_id = inputs.file_id,
            parts = manifest.len(),
            "multipart upload completed"
        );
        Ok(())
    }
}
