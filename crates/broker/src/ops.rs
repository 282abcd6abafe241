//! The privileged operations themselves.
//!
//! These are blocking filesystem calls; the server runs them on the
//! blocking pool.
//!
//! Users own the directories these calls reach into, so no call follows a
//! symlink: ownership changes use `lchown`, files are opened with
//! `O_NOFOLLOW` and only regular files are published or carved.

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt, lchown};
use std::path::Path;

use cachefs_channel::PeerIdentity;
use cachefs_protocol::{BrokerRequest, CacheLayout, CacheName, CachePath, CacheTarget, part_range};
use nix::fcntl::OFlag;
use tracing::{debug, warn};

use crate::CHUNK_COPY_BUFFER;
use crate::error::BrokerError;

/// Executes broker requests against one cache tree.
#[derive(Debug, Clone)]
pub struct BrokerOps {
    layout: CacheLayout,
    chunk_size: u64,
}

impl BrokerOps {
    pub fn new(layout: CacheLayout, chunk_size: u64) -> Self {
        Self { layout, chunk_size }
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Carries out `request` on behalf of `peer`.
    pub fn execute(&self, request: &BrokerRequest, peer: PeerIdentity) -> Result<(), BrokerError> {
        match request {
            BrokerRequest::Chown { uid, gid, target } => self.chown(*uid, *gid, target),
            BrokerRequest::Publish { dir, file } => self.publish(dir, file),
            BrokerRequest::Chunk { part, source, dest } => {
                self.chunk(*part, source, dest, peer)
            }
        }
    }

    /// Changes ownership of a directory or file in the shared cache.
    pub fn chown(&self, uid: u32, gid: u32, target: &CacheTarget) -> Result<(), BrokerError> {
        let path = self.layout.shared_target(target);
        let kind = fs::symlink_metadata(&path)?.file_type();
        let expected = match target {
            CacheTarget::Directory(_) => kind.is_dir(),
            CacheTarget::File(_) => kind.is_file(),
        };
        if !expected {
            warn!(path = %path.display(), "refusing to chown unexpected entry");
            return Err(not_regular(&path));
        }
        lchown(&path, Some(uid), Some(gid))?;
        debug!(path = %path.display(), uid, gid, "ownership changed");
        Ok(())
    }

    /// Moves `<inprogress>/<dir>/<file>` to `<cache>/<dir>/<file>`.
    ///
    /// The destination directory is created with the staging directory's
    /// mode unless it already exists. Removing the staging directory is
    /// best effort: other downloads may still be using it.
    pub fn publish(&self, dir: &CacheName, file: &CacheName) -> Result<(), BrokerError> {
        let staged_dir = self.layout.inprogress_dir(dir);
        let shared_dir = self.layout.shared_dir(dir);
        let dir_meta = fs::symlink_metadata(&staged_dir)?;
        if !dir_meta.is_dir() {
            return Err(not_regular(&staged_dir));
        }
        let mode = dir_meta.permissions().mode() & 0o7777;

        let path = CachePath::new(dir.clone(), file.clone());
        let staged = self.layout.inprogress_file(&path);
        if !fs::symlink_metadata(&staged)?.is_file() {
            return Err(not_regular(&staged));
        }

        match DirBuilder::new().mode(mode).create(&shared_dir) {
            Ok(()) => debug!(dir = %dir, "shared directory created"),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        fs::rename(&staged, self.layout.shared_file(&path))?;

        if let Err(e) = fs::remove_dir(&staged_dir) {
            debug!(dir = %dir, error = %e, "staging directory kept");
        }
        debug!(path = %path, "download published");
        Ok(())
    }

    /// Copies multipart chunk `part` of a shared file into the staging area,
    /// owned by the requesting peer.
    pub fn chunk(
        &self,
        part: u32,
        source: &CachePath,
        dest: &CachePath,
        peer: PeerIdentity,
    ) -> Result<(), BrokerError> {
        let source_path = self.layout.shared_file(source);
        let mut src = open_nofollow(OpenOptions::new().read(true), &source_path)?;
        let meta = src.metadata()?;
        if !meta.is_file() {
            return Err(not_regular(&source_path));
        }
        let size = meta.len();
        let range = part_range(part, size, self.chunk_size)
            .ok_or(BrokerError::PartOutOfRange { part, size })?;

        let dest_dir = self.layout.inprogress_dir(&dest.dir);
        fs::create_dir_all(&dest_dir)?;
        let dest_path = self.layout.inprogress_file(dest);
        let mut out = open_nofollow(
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600),
            &dest_path,
        )?;

        src.seek(SeekFrom::Start(range.start))?;
        let copied = copy_bounded(&mut src, &mut out, range.end - range.start)?;
        out.sync_all()?;

        give_to(&dest_dir, peer)?;
        give_to(&dest_path, peer)?;
        debug!(part, source = %source, bytes = copied, "chunk carved");
        Ok(())
    }
}

/// Opens `path`, failing with `ELOOP` if its last component is a symlink.
fn open_nofollow(options: &mut OpenOptions, path: &Path) -> io::Result<File> {
    options.custom_flags(OFlag::O_NOFOLLOW.bits()).open(path)
}

fn not_regular(path: &Path) -> BrokerError {
    BrokerError::NotRegular(path.display().to_string())
}

fn give_to(path: &Path, peer: PeerIdentity) -> io::Result<()> {
    lchown(path, Some(peer.uid), Some(peer.gid))
}

/// Copies exactly `len` bytes through a fixed-size buffer.
fn copy_bounded<R: Read, W: Write>(src: &mut R, dst: &mut W, len: u64) -> io::Result<u64> {
    let mut buf = vec![0u8; CHUNK_COPY_BUFFER];
    let mut remaining = len;
    while remaining > 0 {
        let want = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let n = src.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "source shorter than chunk",
            ));
        }
        dst.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    dst.flush()?;
    Ok(len)
}
