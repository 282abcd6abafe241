//! Rows of the transfer store and the typed records built from them.

use std::fmt;

use cachefs_protocol::{CacheName, CachePath};
use sqlx::FromRow;

use crate::error::{StoreError, StoreResult};

pub type FileId = i64;
pub type TransferId = i64;

// =============================================================================
// Records
// =============================================================================

/// Owning uid/gid and permission bits of a cached file or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
    pub permissions: u32,
}

/// Transfer direction, stored as `u` or `d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub(crate) fn as_db(self) -> &'static str {
        match self {
            Self::Upload => "u",
            Self::Download => "d",
        }
    }

    fn from_db(raw: &str) -> StoreResult<Self> {
        match raw {
            "u" => Ok(Self::Upload),
            "d" => Ok(Self::Download),
            other => Err(StoreError::Corrupt(format!("direction {other:?}"))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => f.write_str("upload"),
            Self::Download => f.write_str("download"),
        }
    }
}

/// A directory in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentEntry {
    pub id: i64,
    pub remote_path: String,
    pub local_name: CacheName,
    pub owner: Owner,
}

/// A file in the catalog, joined with its parent directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub id: FileId,
    pub bucket: String,
    pub remote_path: String,
    pub path: CachePath,
    pub size: u64,
    pub cached: bool,
    pub changed: bool,
    pub owner: Owner,
    pub parent_owner: Owner,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub id: TransferId,
    pub owner: u32,
    pub file: FileId,
    pub direction: Direction,
    pub upload_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPart {
    pub part: u32,
    pub in_progress: bool,
    pub etag: Option<String>,
}

/// Everything a worker needs to fetch a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadInputs {
    pub file_id: FileId,
    pub bucket: String,
    pub remote_path: String,
    pub path: CachePath,
}

/// Everything a worker needs to push a file, including multipart state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadInputs {
    pub file_id: FileId,
    pub transfer_id: TransferId,
    pub bucket: String,
    pub remote_path: String,
    pub path: CachePath,
    pub size: u64,
    pub upload_id: Option<String>,
    pub owner: Owner,
}

/// Ownership of a cached file and of the directory holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ownership {
    pub path: CachePath,
    pub file: Owner,
    pub parent: Owner,
}

// =============================================================================
// Rows
// =============================================================================

fn to_u32(value: i64, column: &str) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} = {value}")))
}

fn to_name(raw: &str) -> StoreResult<CacheName> {
    CacheName::parse(raw).map_err(|e| StoreError::Corrupt(e.to_string()))
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct ParentRow {
    pub id: i64,
    pub remotename: String,
    pub localname: String,
    pub uid: i64,
    pub gid: i64,
    pub permissions: i64,
}

impl TryFrom<ParentRow> for ParentEntry {
    type Error = StoreError;

    fn try_from(row: ParentRow) -> StoreResult<Self> {
        Ok(Self {
            id: row.id,
            local_name: to_name(&row.localname)?,
            remote_path: row.remotename,
            owner: Owner {
                uid: to_u32(row.uid, "parents.uid")?,
                gid: to_u32(row.gid, "parents.gid")?,
                permissions: to_u32(row.permissions, "parents.permissions")?,
            },
        })
    }
}

/// Column list matching [`FileRow`].
pub(crate) const FILE_COLUMNS: &str = "f.id, f.bucket, f.remotename, f.localname, \
     p.localname AS parent_localname, f.size, f.cached, f.filechanged, \
     f.uid, f.gid, f.permissions, \
     p.uid AS parent_uid, p.gid AS parent_gid, p.permissions AS parent_permissions";

#[derive(Debug, Clone, FromRow)]
pub(crate) struct FileRow {
    pub id: i64,
    pub bucket: String,
    pub remotename: String,
    pub localname: String,
    pub parent_localname: String,
    pub size: i64,
    pub cached: bool,
    pub filechanged: bool,
    pub uid: i64,
    pub gid: i64,
    pub permissions: i64,
    pub parent_uid: i64,
    pub parent_gid: i64,
    pub parent_permissions: i64,
}

impl TryFrom<FileRow> for FileEntry {
    type Error = StoreError;

    fn try_from(row: FileRow) -> StoreResult<Self> {
        Ok(Self {
            id: row.id,
            path: CachePath::new(to_name(&row.parent_localname)?, to_name(&row.localname)?),
            size: u64::try_from(row.size)
                .map_err(|_| StoreError::Corrupt(format!("files.size = {}", row.size)))?,
            cached: row.cached,
            changed: row.filechanged,
            owner: Owner {
                uid: to_u32(row.uid, "files.uid")?,
                gid: to_u32(row.gid, "files.gid")?,
                permissions: to_u32(row.permissions, "files.permissions")?,
            },
            parent_owner: Owner {
                uid: to_u32(row.parent_uid, "parents.uid")?,
                gid: to_u32(row.parent_gid, "parents.gid")?,
                permissions: to_u32(row.parent_permissions, "parents.permissions")?,
            },
            bucket: row.bucket,
            remote_path: row.remotename,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct TransferRow {
    pub id: i64,
    pub owner: i64,
    pub file: i64,
    pub direction: String,
    #[sqlx(rename = "uploadId")]
    pub upload_id: Option<String>,
}

impl TryFrom<TransferRow> for TransferRecord {
    type Error = StoreError;

    fn try_from(row: TransferRow) -> StoreResult<Self> {
        Ok(Self {
            id: row.id,
            owner: to_u32(row.owner, "transfers.owner")?,
            file: row.file,
            direction: Direction::from_db(&row.direction)?,
            upload_id: row.upload_id,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct PartRow {
    pub part: i64,
    pub inprogress: bool,
    pub etag: Option<String>,
}

impl TryFrom<PartRow> for TransferPart {
    type Error = StoreError;

    fn try_from(row: PartRow) -> StoreResult<Self> {
        Ok(Self {
            part: to_u32(row.part, "transferparts.part")?,
            in_progress: row.inprogress,
            etag: row.etag,
        })
    }
}
