//! Table definitions, applied on every open.

pub(crate) const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS parents (
        id INTEGER PRIMARY KEY,
        remotename TEXT NOT NULL UNIQUE,
        localname TEXT NOT NULL UNIQUE,
        uid INTEGER NOT NULL,
        gid INTEGER NOT NULL,
        permissions INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS files (
        id INTEGER PRIMARY KEY,
        bucket TEXT NOT NULL,
        remotename TEXT NOT NULL UNIQUE,
        localname TEXT NOT NULL UNIQUE,
        parent INTEGER NOT NULL REFERENCES parents(id),
        uid INTEGER NOT NULL,
        gid INTEGER NOT NULL,
        permissions INTEGER NOT NULL,
        size INTEGER NOT NULL DEFAULT 0,
        atime INTEGER NOT NULL,
        mtime INTEGER NOT NULL,
        cached INTEGER NOT NULL DEFAULT 0,
        filechanged INTEGER NOT NULL DEFAULT 0
    )",
    // AUTOINCREMENT: a requeued upload must never get the id of the record
    // it replaced.
    "CREATE TABLE IF NOT EXISTS transfers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner INTEGER NOT NULL,
        file INTEGER NOT NULL UNIQUE REFERENCES files(id) ON DELETE CASCADE,
        direction TEXT NOT NULL CHECK (direction IN ('u', 'd')),
        uploadId TEXT
    )",
    "CREATE TABLE IF NOT EXISTS transferparts (
        id INTEGER PRIMARY KEY,
        transfer INTEGER NOT NULL REFERENCES transfers(id) ON DELETE CASCADE,
        part INTEGER NOT NULL,
        inprogress INTEGER NOT NULL DEFAULT 0,
        etag TEXT,
        UNIQUE (transfer, part)
    )",
    "CREATE INDEX IF NOT EXISTS idx_transfers_direction ON transfers(direction, id)",
];
