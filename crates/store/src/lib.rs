//! Backing object store capability.
//!
//! The upload engine talks to storage only through [`ObjectStore`]. Which
//! implementation it gets is decided once, from [`StoreConfig`], when the
//! gateway is composed.

pub mod config;
pub mod fs;
pub mod memory;

use std::future::Future;
use std::pin::Pin;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

pub use config::StoreConfig;
pub use fs::FsStore;
pub use memory::MemoryStore;
pub use objgate_transfer::CompletedPart;

/// Future returned by [`ObjectStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Errors produced by a backing store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no such bucket: {0}")]
    NoSuchBucket(String),

    #[error("no such multipart upload: {0}")]
    NoSuchUpload(String),

    #[error("invalid part {part_number}: {reason}")]
    InvalidPart { part_number: u32, reason: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// An open multipart transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Identifier the store issued when the transaction was opened.
    pub upload_id: String,
    pub bucket: String,
    pub object: String,
}

/// Multipart-capable object store.
///
/// Implemented once per storage backend; the engine holds it as
/// `Arc<dyn ObjectStore>` so the backend never leaks into upload logic.
pub trait ObjectStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Opens a multipart transaction for `bucket/object`.
    fn open_transaction<'a>(&'a self, bucket: &'a str, object: &'a str)
    -> StoreFuture<'a, Transaction>;

    /// Uploads one part and returns its ETag.
    fn upload_part<'a>(
        &'a self,
        txn: &'a Transaction,
        part_number: u32,
        data: Vec<u8>,
    ) -> StoreFuture<'a, String>;

    /// Parts staged so far in an open transaction, ascending by part number.
    /// Fails with [`StoreError::NoSuchUpload`] once the transaction is gone.
    fn list_parts<'a>(&'a self, txn: &'a Transaction) -> StoreFuture<'a, Vec<CompletedPart>>;

    /// Assembles `parts` (ascending part number) into the final object.
    fn complete_transaction<'a>(
        &'a self,
        txn: &'a Transaction,
        parts: &'a [CompletedPart],
    ) -> StoreFuture<'a, String>;

    /// Discards an open transaction and its parts.
    fn abort_transaction<'a>(&'a self, txn: &'a Transaction) -> StoreFuture<'a, ()>;

    /// Stores a whole object in one request.
    fn put_object<'a>(
        &'a self,
        bucket: &'a str,
        object: &'a str,
        data: Vec<u8>,
    ) -> StoreFuture<'a, String>;
}

/// ETag of an assembled multipart object: `md5(md5(p1) || .. || md5(pN))-N`.
pub fn multipart_etag(parts: &[CompletedPart]) -> String {
    let mut hasher = Md5::new();
    for part in parts {
        match hex::decode(&part.etag) {
            Ok(raw) => hasher.update(&raw),
            Err(_) => hasher.update(part.etag.as_bytes()),
        }
    }
    format!("{}-{}", hex::encode(hasher.finalize()), parts.len())
}

/// Checks that `parts` is non-empty and strictly ascending by part number.
pub(crate) fn check_part_order(parts: &[CompletedPart]) -> Result<(), StoreError> {
    if parts.is_empty() {
        return Err(StoreError::InvalidRequest(
            "multipart completion needs at least one part".into(),
        ));
    }
    for pair in parts.windows(2) {
        if pair[0].part_number >= pair[1].part_number {
            return Err(StoreError::InvalidPart {
                part_number: pair[1].part_number,
                reason: "parts must be in ascending order".into(),
            });
        }
    }
    Ok(())
}

pub(crate) fn validate_names(bucket: &str, object: &str) -> Result<(), StoreError> {
    objgate_transfer::validate_bucket_name(bucket)
        .and_then(|_| objgate_transfer::validate_object_key(object))
        .map_err(|e| StoreError::InvalidRequest(e.to_string()))
}
