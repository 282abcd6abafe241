//! Durable record keeping for cached files and their transfers.
//!
//! [`TransferStore`] owns the file catalog (`parents`, `files`) and the
//! transfer queue (`transfers`, `transferparts`). It exposes record-level
//! operations only; every mutation is serialized through one store-wide
//! lock so callers never observe a half-applied change.

mod error;
mod models;
mod schema;
mod store;

pub use error::{StoreError, StoreResult};
pub use models::{
    Direction, DownloadInputs, FileEntry, FileId, Owner, Ownership, ParentEntry, TransferId,
    TransferPart, TransferRecord, UploadInputs,
};
pub use store::TransferStore;
