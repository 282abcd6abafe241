//! Transfer bodies run inside a worker slot.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use bytes::Bytes;
use cachefs_protocol::{CacheLayout, CacheName, CachePath, CacheTarget};
use cachefs_remote::{ObjectMeta, content_md5, object_key};
use cachefs_store::{Direction, FileId, Owner, UploadInputs};
use tracing::debug;

use crate::{TransferContext, TransferError};

/// Object metadata carrying a catalog owner.
pub(crate) fn object_meta(owner: Owner) -> ObjectMeta {
    ObjectMeta {
        uid: owner.uid,
        gid: owner.gid,
        permissions: owner.permissions,
    }
}

/// Fetches a file into the staging area and has the broker publish it.
///
/// The catalog is only updated once the broker has moved the file and
/// restored its ownership. Returns the number of bytes fetched.
pub(crate) async fn download(ctx: &TransferContext, file_id: FileId) -> Result<u64, TransferError> {
    let inputs = ctx.store.download_inputs(file_id).await?;
    let ownership = ctx.store.ownership(file_id).await?;
    let path = &inputs.path;

    let staged_dir = ctx.layout.inprogress_dir(&path.dir);
    create_staging_dir(&staged_dir, ownership.parent.permissions | 0o700).await?;

    let staged = ctx.layout.inprogress_file(path);
    let key = object_key(&inputs.remote_path);
    let fetched = match ctx.remote.get_object(&inputs.bucket, key, &staged).await {
        Ok(fetched) => fetched,
        Err(e) => {
            remove_quietly(&staged).await;
            return Err(e.into());
        }
    };
    tokio::fs::set_permissions(
        &staged,
        std::fs::Permissions::from_mode(ownership.file.permissions & 0o7777),
    )
    .await?;
    debug!(file_id, bytes = fetched.size, "download staged");

    ctx.broker.publish(path.dir.clone(), path.file.clone()).await?;
    ctx.broker
        .chown(
            ownership.parent.uid,
            ownership.parent.gid,
            CacheTarget::Directory(path.dir.clone()),
        )
        .await?;
    ctx.broker
        .chown(
            ownership.file.uid,
            ownership.file.gid,
            CacheTarget::File(path.clone()),
        )
        .await?;

    ctx.store.mark_cached(file_id, fetched.size).await?;
    if let Some(transfer) = ctx.store.transfer_for_file(file_id).await? {
        if transfer.direction == Direction::Download {
            ctx.store.delete_transfer(transfer.id).await?;
        }
    }
    Ok(fetched.size)
}

/// Sends a file that fits in one part with a single PUT.
pub(crate) async fn upload_single(
    ctx: &TransferContext,
    inputs: &UploadInputs,
) -> Result<(), TransferError> {
    let body = carve(ctx, 1, &inputs.path).await?;
    let size = body.len() as u64;
    let digest = content_md5(&body);
    let etag = ctx
        .remote
        .put_object(
            &inputs.bucket,
            object_key(&inputs.remote_path),
            body,
            &digest,
            object_meta(inputs.owner),
        )
        .await?;
    debug!(file_id = inputs.file_id, bytes = size, %etag, "object stored");

    retire_upload(ctx, inputs, size).await
}

/// Retires a finished upload unless a newer one was queued meanwhile; that
/// one stays queued and carries the newer contents.
pub(crate) async fn retire_upload(
    ctx: &TransferContext,
    inputs: &UploadInputs,
    size: u64,
) -> Result<(), TransferError> {
    let retired = ctx
        .store
        .finish_upload(inputs.transfer_id, inputs.file_id, size)
        .await?;
    if !retired {
        debug!(
            file_id = inputs.file_id,
            transfer_id = inputs.transfer_id,
            "upload superseded, newer contents stay queued"
        );
    }
    Ok(())
}

/// Has the broker copy part `part` of a shared file into a fresh staging
/// path, reads it back and removes the staged copy.
pub(crate) async fn carve(
    ctx: &TransferContext,
    part: u32,
    source: &CachePath,
) -> Result<Bytes, TransferError> {
    let staging = CachePath::new(CacheName::generate(), CacheName::generate());
    let carved = match ctx.broker.chunk(part, source.clone(), staging.clone()).await {
        Ok(()) => tokio::fs::read(ctx.layout.inprogress_file(&staging))
            .await
            .map_err(TransferError::from),
        Err(e) => Err(e.into()),
    };
    discard_staging(&ctx.layout, &staging).await;
    Ok(Bytes::from(carved?))
}

async fn create_staging_dir(dir: &Path, mode: u32) -> io::Result<()> {
    match tokio::fs::DirBuilder::new().mode(mode).create(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(()),
        Err(e) => return Err(e),
    }
    // The umask may have masked bits off.
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(mode & 0o7777)).await
}

async fn discard_staging(layout: &CacheLayout, path: &CachePath) {
    remove_quietly(&layout.inprogress_file(path)).await;
    if let Err(e) = tokio::fs::remove_dir(layout.inprogress_dir(&path.dir)).await {
        if e.kind() != io::ErrorKind::NotFound {
            debug!(dir = %path.dir, error = %e, "staging directory kept");
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "staged file kept");
        }
    }
}
