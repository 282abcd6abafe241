//! SQLite-backed transfer store.

use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cachefs_protocol::CacheName;
use cachefs_protocol::messages::remote_parent;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::models::{
    Direction, DownloadInputs, FILE_COLUMNS, FileEntry, FileId, FileRow, Owner, Ownership,
    ParentEntry, ParentRow, PartRow, TransferId, TransferPart, TransferRecord, TransferRow,
    UploadInputs,
};
use crate::schema::SCHEMA;

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn size_to_db(size: u64) -> StoreResult<i64> {
    i64::try_from(size).map_err(|_| StoreError::Corrupt(format!("size {size} out of range")))
}

/// Catalog and transfer queue.
pub struct TransferStore {
    pool: Pool<Sqlite>,
    write_lock: Mutex<()>,
}

impl TransferStore {
    /// Opens (creating if needed) the database at `path`.
    ///
    /// Schema creation failures are returned to the caller, which treats
    /// them as fatal.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self::from_pool(pool).await?;
        info!(path = %path.display(), "transfer store opened");
        Ok(store)
    }

    /// A private in-memory database.
    pub async fn in_memory() -> StoreResult<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // The database lives only as long as its single connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: Pool<Sqlite>) -> StoreResult<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    // -------------------------------------------------------------------------
    // Catalog
    // -------------------------------------------------------------------------

    /// Returns the directory entry for `remote_path`, creating it with
    /// `owner` and a fresh cache name if absent.
    pub async fn find_or_create_parent(
        &self,
        remote_path: &str,
        owner: Owner,
    ) -> StoreResult<ParentEntry> {
        let _guard = self.write_lock.lock().await;
        self.find_or_create_parent_locked(remote_path, owner).await
    }

    async fn find_or_create_parent_locked(
        &self,
        remote_path: &str,
        owner: Owner,
    ) -> StoreResult<ParentEntry> {
        let inserted = sqlx::query(
            "INSERT INTO parents (remotename, localname, uid, gid, permissions)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(remotename) DO NOTHING",
        )
        .bind(remote_path)
        .bind(CacheName::generate().to_string())
        .bind(i64::from(owner.uid))
        .bind(i64::from(owner.gid))
        .bind(i64::from(owner.permissions))
        .execute(&self.pool)
        .await?
        .rows_affected();
        if inserted > 0 {
            debug!(remote_path, "catalog directory created");
        }

        let row = sqlx::query_as::<_, ParentRow>("SELECT * FROM parents WHERE remotename = ?")
            .bind(remote_path)
            .fetch_one(&self.pool)
            .await?;
        ParentEntry::try_from(row)
    }

    /// Returns the catalog entry for `remote_path`, creating it (and its
    /// parent directory entry) if absent. An existing entry is returned
    /// unchanged.
    pub async fn find_or_create_file(
        &self,
        bucket: &str,
        remote_path: &str,
        owner: Owner,
        parent_owner: Owner,
    ) -> StoreResult<FileEntry> {
        let _guard = self.write_lock.lock().await;

        if let Some(entry) = self.file_by_remote(remote_path).await? {
            return Ok(entry);
        }

        let parent = self
            .find_or_create_parent_locked(remote_parent(remote_path), parent_owner)
            .await?;
        let ts = now();
        let id = sqlx::query(
            "INSERT INTO files
                (bucket, remotename, localname, parent, uid, gid, permissions, atime, mtime)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(bucket)
        .bind(remote_path)
        .bind(CacheName::generate().to_string())
        .bind(parent.id)
        .bind(i64::from(owner.uid))
        .bind(i64::from(owner.gid))
        .bind(i64::from(owner.permissions))
        .bind(ts)
        .bind(ts)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        debug!(file_id = id, remote_path, "catalog file created");

        self.file(id).await
    }

    pub async fn file(&self, file_id: FileId) -> StoreResult<FileEntry> {
        let row = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {FILE_COLUMNS} FROM files f JOIN parents p ON p.id = f.parent WHERE f.id = ?"
        ))
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("file {file_id}")))?;
        FileEntry::try_from(row)
    }

    pub async fn file_by_remote(&self, remote_path: &str) -> StoreResult<Option<FileEntry>> {
        let row = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {FILE_COLUMNS} FROM files f JOIN parents p ON p.id = f.parent \
             WHERE f.remotename = ?"
        ))
        .bind(remote_path)
        .fetch_optional(&self.pool)
        .await?;
        row.map(FileEntry::try_from).transpose()
    }

    /// Records a completed download of `size` bytes.
    pub async fn mark_cached(&self, file_id: FileId, size: u64) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let ts = now();
        let updated = sqlx::query(
            "UPDATE files SET cached = 1, filechanged = 0, size = ?, atime = ?, mtime = ?
             WHERE id = ?",
        )
        .bind(size_to_db(size)?)
        .bind(ts)
        .bind(ts)
        .bind(file_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(format!("file {file_id}")));
        }
        Ok(())
    }

    /// Records that the cached copy was modified locally and now holds `size` bytes.
    pub async fn mark_changed(&self, file_id: FileId, size: u64) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let updated = sqlx::query(
            "UPDATE files SET cached = 1, filechanged = 1, size = ?, mtime = ? WHERE id = ?",
        )
        .bind(size_to_db(size)?)
        .bind(now())
        .bind(file_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(format!("file {file_id}")));
        }
        Ok(())
    }

    /// Records an access to a cached file.
    pub async fn touch(&self, file_id: FileId) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("UPDATE files SET atime = ? WHERE id = ?")
            .bind(now())
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn ownership(&self, file_id: FileId) -> StoreResult<Ownership> {
        let entry = self.file(file_id).await?;
        Ok(Ownership {
            path: entry.path,
            file: entry.owner,
            parent: entry.parent_owner,
        })
    }

    pub async fn download_inputs(&self, file_id: FileId) -> StoreResult<DownloadInputs> {
        let entry = self.file(file_id).await?;
        Ok(DownloadInputs {
            file_id,
            bucket: entry.bucket,
            remote_path: entry.remote_path,
            path: entry.path,
        })
    }

    pub async fn upload_inputs(&self, file_id: FileId) -> StoreResult<UploadInputs> {
        let entry = self.file(file_id).await?;
        let transfer = self
            .transfer_for_file(file_id)
            .await?
            .filter(|t| t.direction == Direction::Upload)
            .ok_or_else(|| StoreError::NotFound(format!("upload for file {file_id}")))?;
        Ok(UploadInputs {
            file_id,
            transfer_id: transfer.id,
            bucket: entry.bucket,
            remote_path: entry.remote_path,
            path: entry.path,
            size: entry.size,
            upload_id: transfer.upload_id,
            owner: entry.owner,
        })
    }

    // -------------------------------------------------------------------------
    // Transfers
    // -------------------------------------------------------------------------

    /// Queues a transfer for `file_id`.
    ///
    /// A file has at most one transfer at a time: if one in the same
    /// direction is already pending it is returned as is, while one in the
    /// other direction yields [`StoreError::TransferBusy`].
    pub async fn create_transfer(
        &self,
        file_id: FileId,
        owner: u32,
        direction: Direction,
    ) -> StoreResult<TransferRecord> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO transfers (owner, file, direction) VALUES (?, ?, ?)
             ON CONFLICT(file) DO NOTHING",
        )
        .bind(i64::from(owner))
        .bind(file_id)
        .bind(direction.as_db())
        .execute(&self.pool)
        .await?;

        let record = self
            .transfer_for_file(file_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("transfer for file {file_id}")))?;
        if record.direction != direction {
            return Err(StoreError::TransferBusy {
                file_id,
                direction: record.direction,
            });
        }
        Ok(record)
    }

    /// Queues an upload of the file's current contents.
    ///
    /// An upload already queued for the file is replaced together with its
    /// parts, since they were carved from older contents. The replacement
    /// gets a new id, so a worker still running the old record can tell it
    /// was superseded. Returns the new record and the multipart session of
    /// the replaced one, if it had opened one.
    pub async fn requeue_upload(
        &self,
        file_id: FileId,
        owner: u32,
    ) -> StoreResult<(TransferRecord, Option<String>)> {
        let _guard = self.write_lock.lock().await;

        let previous = self.transfer_for_file(file_id).await?;
        if let Some(previous) = &previous {
            if previous.direction == Direction::Download {
                return Err(StoreError::TransferBusy {
                    file_id,
                    direction: Direction::Download,
                });
            }
        }

        let mut tx = self.pool.begin().await?;
        if let Some(previous) = &previous {
            sqlx::query("DELETE FROM transfers WHERE id = ?")
                .bind(previous.id)
                .execute(&mut *tx)
                .await?;
        }
        let id = sqlx::query("INSERT INTO transfers (owner, file, direction) VALUES (?, ?, 'u')")
            .bind(i64::from(owner))
            .bind(file_id)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();
        tx.commit().await?;

        let abandoned = previous.and_then(|p| {
            debug!(file_id, replaced = p.id, transfer_id = id, "upload requeued");
            p.upload_id
        });
        let record = TransferRecord {
            id,
            owner,
            file: file_id,
            direction: Direction::Upload,
            upload_id: None,
        };
        Ok((record, abandoned))
    }

    /// Retires upload `transfer_id` and records the `size` bytes sent as the
    /// file's cached contents.
    ///
    /// Returns `false` and changes nothing when the record is gone, which
    /// means the upload was requeued after it started.
    pub async fn finish_upload(
        &self,
        transfer_id: TransferId,
        file_id: FileId,
        size: u64,
    ) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let size = size_to_db(size)?;
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM transfers WHERE id = ? AND direction = 'u'")
            .bind(transfer_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if removed == 0 {
            return Ok(false);
        }

        let ts = now();
        sqlx::query(
            "UPDATE files SET cached = 1, filechanged = 0, size = ?, atime = ?, mtime = ?
             WHERE id = ?",
        )
        .bind(size)
        .bind(ts)
        .bind(ts)
        .bind(file_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn transfer_for_file(&self, file_id: FileId) -> StoreResult<Option<TransferRecord>> {
        let row = sqlx::query_as::<_, TransferRow>(
            "SELECT id, owner, file, direction, uploadId FROM transfers WHERE file = ?",
        )
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TransferRecord::try_from).transpose()
    }

    /// Removes a transfer and its parts.
    pub async fn delete_transfer(&self, transfer_id: TransferId) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM transfers WHERE id = ?")
            .bind(transfer_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// File ids with a pending upload, oldest first.
    pub async fn pending_uploads(&self) -> StoreResult<Vec<FileId>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT file FROM transfers WHERE direction = 'u' ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(file,)| file).collect())
    }

    /// Drops download records left by a previous run. Their requesters are
    /// gone, and a new request creates a fresh record.
    pub async fn purge_downloads(&self) -> StoreResult<u64> {
        let _guard = self.write_lock.lock().await;
        let removed = sqlx::query("DELETE FROM transfers WHERE direction = 'd'")
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }

    // -------------------------------------------------------------------------
    // Multipart
    // -------------------------------------------------------------------------

    pub async fn set_upload_id(&self, transfer_id: TransferId, upload_id: &str) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let updated = sqlx::query("UPDATE transfers SET uploadId = ? WHERE id = ?")
            .bind(upload_id)
            .bind(transfer_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(format!("transfer {transfer_id}")));
        }
        Ok(())
    }

    /// Creates part rows `1..=count`. Existing rows keep their state.
    pub async fn create_parts(&self, transfer_id: TransferId, count: u32) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        for part in 1..=count {
            sqlx::query("INSERT OR IGNORE INTO transferparts (transfer, part) VALUES (?, ?)")
                .bind(transfer_id)
                .bind(i64::from(part))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Flags a part as being sent and forgets any earlier ETag.
    pub async fn mark_part_in_progress(&self, transfer_id: TransferId, part: u32) -> StoreResult<()> {
        self.update_part(
            "UPDATE transferparts SET inprogress = 1, etag = NULL WHERE transfer = ? AND part = ?",
            transfer_id,
            part,
        )
        .await
    }

    pub async fn clear_part_in_progress(&self, transfer_id: TransferId, part: u32) -> StoreResult<()> {
        self.update_part(
            "UPDATE transferparts SET inprogress = 0 WHERE transfer = ? AND part = ?",
            transfer_id,
            part,
        )
        .await
    }

    async fn update_part(&self, sql: &str, transfer_id: TransferId, part: u32) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let updated = sqlx::query(sql)
            .bind(transfer_id)
            .bind(i64::from(part))
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(format!(
                "part {part} of transfer {transfer_id}"
            )));
        }
        Ok(())
    }

    pub async fn set_part_etag(
        &self,
        transfer_id: TransferId,
        part: u32,
        etag: &str,
    ) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let updated = sqlx::query(
            "UPDATE transferparts SET etag = ?, inprogress = 0 WHERE transfer = ? AND part = ?",
        )
        .bind(etag)
        .bind(transfer_id)
        .bind(i64::from(part))
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(format!(
                "part {part} of transfer {transfer_id}"
            )));
        }
        Ok(())
    }

    pub async fn part_etag(&self, transfer_id: TransferId, part: u32) -> StoreResult<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT etag FROM transferparts WHERE transfer = ? AND part = ?")
                .bind(transfer_id)
                .bind(i64::from(part))
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(etag,)| etag))
    }

    /// Parts of a transfer ordered by part number.
    pub async fn parts(&self, transfer_id: TransferId) -> StoreResult<Vec<TransferPart>> {
        let rows = sqlx::query_as::<_, PartRow>(
            "SELECT part, inprogress, etag FROM transferparts WHERE transfer = ? ORDER BY part",
        )
        .bind(transfer_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TransferPart::try_from).collect()
    }

    /// True when the transfer has parts and every one of them has an ETag.
    pub async fn all_parts_uploaded(&self, transfer_id: TransferId) -> StoreResult<bool> {
        let (total, missing): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(etag IS NULL), 0) FROM transferparts WHERE transfer = ?",
        )
        .bind(transfer_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total > 0 && missing == 0)
    }

    /// Clears in-progress flags left behind by an interrupted run.
    pub async fn reset_in_progress(&self) -> StoreResult<u64> {
        let _guard = self.write_lock.lock().await;
        let reset = sqlx::query("UPDATE transferparts SET inprogress = 0 WHERE inprogress = 1")
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE_OWNER: Owner = Owner {
        uid: 1000,
        gid: 100,
        permissions: 0o644,
    };
    const DIR_OWNER: Owner = Owner {
        uid: 1000,
        gid: 100,
        permissions: 0o755,
    };

    async fn store_with_file(remote_path: &str) -> (TransferStore, FileEntry) {
        let store = TransferStore::in_memory().await.unwrap();
        let entry = store
            .find_or_create_file("photos", remote_path, FILE_OWNER, DIR_OWNER)
            .await
            .unwrap();
        (store, entry)
    }

    #[tokio::test]
    async fn find_or_create_file_is_idempotent() {
        let (store, first) = store_with_file("/2024/cat.jpg").await;
        let other_owner = Owner {
            uid: 0,
            gid: 0,
            permissions: 0o600,
        };
        let second = store
            .find_or_create_file("photos", "/2024/cat.jpg", other_owner, other_owner)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second.owner, FILE_OWNER);
        assert!(!second.cached);
    }

    #[tokio::test]
    async fn files_in_one_directory_share_a_parent() {
        let (store, a) = store_with_file("/docs/a.txt").await;
        let b = store
            .find_or_create_file("photos", "/docs/b.txt", FILE_OWNER, DIR_OWNER)
            .await
            .unwrap();
        let c = store
            .find_or_create_file("photos", "/other/c.txt", FILE_OWNER, DIR_OWNER)
            .await
            .unwrap();

        assert_eq!(a.path.dir, b.path.dir);
        assert_ne!(a.path.file, b.path.file);
        assert_ne!(a.path.dir, c.path.dir);

        let parent = store.find_or_create_parent("/docs", FILE_OWNER).await.unwrap();
        assert_eq!(parent.local_name, a.path.dir);
        assert_eq!(parent.owner, DIR_OWNER);
    }

    #[tokio::test]
    async fn concurrent_find_or_create_yields_one_entry() {
        let store = std::sync::Arc::new(TransferStore::in_memory().await.unwrap());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .find_or_create_file("b", "/x/y.bin", FILE_OWNER, DIR_OWNER)
                    .await
                    .unwrap()
            }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn unknown_file_is_not_found() {
        let store = TransferStore::in_memory().await.unwrap();
        assert!(matches!(store.file(42).await, Err(StoreError::NotFound(_))));
        assert!(store.file_by_remote("/nope").await.unwrap().is_none());
        assert!(matches!(
            store.mark_cached(42, 1).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn one_transfer_per_file() {
        let (store, file) = store_with_file("/a.bin").await;
        let first = store
            .create_transfer(file.id, 1000, Direction::Download)
            .await
            .unwrap();
        let again = store
            .create_transfer(file.id, 1001, Direction::Download)
            .await
            .unwrap();
        assert_eq!(first, again);

        let busy = store.create_transfer(file.id, 1000, Direction::Upload).await;
        assert!(matches!(
            busy,
            Err(StoreError::TransferBusy {
                direction: Direction::Download,
                ..
            })
        ));

        store.delete_transfer(first.id).await.unwrap();
        assert!(store.transfer_for_file(file.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn download_completion_marks_cached() {
        let (store, file) = store_with_file("/a.bin").await;
        let inputs = store.download_inputs(file.id).await.unwrap();
        assert_eq!(inputs.bucket, "photos");
        assert_eq!(inputs.remote_path, "/a.bin");
        assert_eq!(inputs.path, file.path);

        store.mark_cached(file.id, 1234).await.unwrap();
        let entry = store.file(file.id).await.unwrap();
        assert!(entry.cached);
        assert_eq!(entry.size, 1234);

        let ownership = store.ownership(file.id).await.unwrap();
        assert_eq!(ownership.file, FILE_OWNER);
        assert_eq!(ownership.parent, DIR_OWNER);
    }

    #[tokio::test]
    async fn pending_uploads_are_oldest_first() {
        let store = TransferStore::in_memory().await.unwrap();
        let mut ids = Vec::new();
        for name in ["/c", "/a", "/b"] {
            let f = store
                .find_or_create_file("b", name, FILE_OWNER, DIR_OWNER)
                .await
                .unwrap();
            store.mark_changed(f.id, 10).await.unwrap();
            store
                .create_transfer(f.id, 1000, Direction::Upload)
                .await
                .unwrap();
            ids.push(f.id);
        }
        let d = store
            .find_or_create_file("b", "/d", FILE_OWNER, DIR_OWNER)
            .await
            .unwrap();
        store
            .create_transfer(d.id, 1000, Direction::Download)
            .await
            .unwrap();

        assert_eq!(store.pending_uploads().await.unwrap(), ids);

        assert_eq!(store.purge_downloads().await.unwrap(), 1);
        assert!(store.transfer_for_file(d.id).await.unwrap().is_none());
        assert_eq!(store.pending_uploads().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn upload_inputs_carry_multipart_state() {
        let (store, file) = store_with_file("/big.iso").await;
        assert!(store.upload_inputs(file.id).await.is_err());

        store.mark_changed(file.id, 70).await.unwrap();
        let t = store
            .create_transfer(file.id, 1000, Direction::Upload)
            .await
            .unwrap();
        let inputs = store.upload_inputs(file.id).await.unwrap();
        assert_eq!(inputs.transfer_id, t.id);
        assert_eq!(inputs.size, 70);
        assert_eq!(inputs.upload_id, None);
        assert_eq!(inputs.owner, FILE_OWNER);

        store.set_upload_id(t.id, "upload-1").await.unwrap();
        let inputs = store.upload_inputs(file.id).await.unwrap();
        assert_eq!(inputs.upload_id.as_deref(), Some("upload-1"));
    }

    #[tokio::test]
    async fn all_parts_uploaded_tracks_every_etag() {
        let (store, file) = store_with_file("/big.iso").await;
        let t = store
            .create_transfer(file.id, 1000, Direction::Upload)
            .await
            .unwrap();

        assert!(!store.all_parts_uploaded(t.id).await.unwrap());

        store.create_parts(t.id, 3).await.unwrap();
        assert!(!store.all_parts_uploaded(t.id).await.unwrap());

        for (part, etag) in [(1, "e1"), (2, "e2"), (3, "e3")] {
            store.mark_part_in_progress(t.id, part).await.unwrap();
            store.set_part_etag(t.id, part, etag).await.unwrap();
        }
        assert!(store.all_parts_uploaded(t.id).await.unwrap());
        assert_eq!(store.part_etag(t.id, 2).await.unwrap().as_deref(), Some("e2"));

        store.mark_part_in_progress(t.id, 2).await.unwrap();
        assert!(!store.all_parts_uploaded(t.id).await.unwrap());
        let parts = store.parts(t.id).await.unwrap();
        assert_eq!(parts.len(), 3);
        assert!(parts[1].in_progress);
        assert_eq!(parts[1].etag, None);

        assert_eq!(store.reset_in_progress().await.unwrap(), 1);
        assert!(!store.parts(t.id).await.unwrap()[1].in_progress);
    }

    #[tokio::test]
    async fn create_parts_keeps_existing_state() {
        let (store, file) = store_with_file("/big.iso").await;
        let t = store
            .create_transfer(file.id, 1000, Direction::Upload)
            .await
            .unwrap();
        store.create_parts(t.id, 2).await.unwrap();
        store.set_part_etag(t.id, 1, "e1").await.unwrap();
        store.create_parts(t.id, 2).await.unwrap();

        let parts = store.parts(t.id).await.unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].etag.as_deref(), Some("e1"));
        assert!(store.set_part_etag(t.id, 9, "e9").await.is_err());
    }

    #[tokio::test]
    async fn deleting_transfer_removes_parts() {
        let (store, file) = store_with_file("/big.iso").await;
        let t = store
            .create_transfer(file.id, 1000, Direction::Upload)
            .await
            .unwrap();
        store.create_parts(t.id, 2).await.unwrap();
        store.delete_transfer(t.id).await.unwrap();
        assert!(store.parts(t.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn requeued_upload_starts_over() {
        let (store, file) = store_with_file("/big.iso").await;
        store.mark_changed(file.id, 10).await.unwrap();
        let (first, abandoned) = store.requeue_upload(file.id, 1000).await.unwrap();
        assert_eq!(abandoned, None);
        store.set_upload_id(first.id, "upload-1").await.unwrap();
        store.create_parts(first.id, 3).await.unwrap();
        store.set_part_etag(first.id, 1, "e1").await.unwrap();

        let (second, abandoned) = store.requeue_upload(file.id, 1000).await.unwrap();
        assert_eq!(abandoned.as_deref(), Some("upload-1"));
        assert_ne!(second.id, first.id);
        assert!(store.parts(first.id).await.unwrap().is_empty());
        assert!(store.parts(second.id).await.unwrap().is_empty());

        let inputs = store.upload_inputs(file.id).await.unwrap();
        assert_eq!(inputs.transfer_id, second.id);
        assert_eq!(inputs.upload_id, None);

        // Writes on behalf of the replaced record fail instead of leaking
        // into the new one.
        assert!(store.set_upload_id(first.id, "upload-2").await.is_err());
        assert!(store.create_parts(first.id, 2).await.is_err());
        assert!(store.set_part_etag(first.id, 1, "e1").await.is_err());
    }

    #[tokio::test]
    async fn requeue_never_reuses_the_replaced_id() {
        let (store, file) = store_with_file("/a.txt").await;
        let mut seen = Vec::new();
        for _ in 0..3 {
            let (record, _) = store.requeue_upload(file.id, 1000).await.unwrap();
            assert!(!seen.contains(&record.id));
            seen.push(record.id);
        }
    }

    #[tokio::test]
    async fn requeue_is_refused_during_a_download() {
        let (store, file) = store_with_file("/a.txt").await;
        store
            .create_transfer(file.id, 1000, Direction::Download)
            .await
            .unwrap();
        assert!(matches!(
            store.requeue_upload(file.id, 1000).await,
            Err(StoreError::TransferBusy { .. })
        ));
    }

    #[tokio::test]
    async fn finish_upload_ignores_a_superseded_record() {
        let (store, file) = store_with_file("/a.txt").await;
        store.mark_changed(file.id, 3).await.unwrap();
        let (stale, _) = store.requeue_upload(file.id, 1000).await.unwrap();
        store.mark_changed(file.id, 5).await.unwrap();
        let (current, _) = store.requeue_upload(file.id, 1000).await.unwrap();

        assert!(!store.finish_upload(stale.id, file.id, 3).await.unwrap());
        let entry = store.file(file.id).await.unwrap();
        assert!(entry.changed);
        assert_eq!(entry.size, 5);
        assert!(store.transfer_for_file(file.id).await.unwrap().is_some());

        assert!(store.finish_upload(current.id, file.id, 5).await.unwrap());
        assert!(!store.file(file.id).await.unwrap().changed);
        assert!(store.transfer_for_file(file.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn on_disk_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("state").join("cachefs.db");
        let id = {
            let store = TransferStore::open(&db).await.unwrap();
            let f = store
                .find_or_create_file("b", "/keep.txt", FILE_OWNER, DIR_OWNER)
                .await
                .unwrap();
            store.mark_cached(f.id, 5).await.unwrap();
            f.id
        };
        let store = TransferStore::open(&db).await.unwrap();
        let entry = store.file_by_remote("/keep.txt").await.unwrap().unwrap();
        assert_eq!(entry.id, id);
        assert!(entry.cached);
    }
}
