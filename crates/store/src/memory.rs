//! In-process object store.
//!
//! Holds objects and staged parts in memory. Used for development setups
//! and as the reference backend in tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use objgate_transfer::md5_hex;
use tracing::debug;

use crate::{
    CompletedPart, ObjectStore, StoreError, StoreFuture, Transaction, check_part_order,
    multipart_etag, validate_names,
};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    etag: String,
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    object: String,
    /// part number -> (etag, bytes)
    parts: BTreeMap<u32, (String, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    buckets: HashMap<String, HashMap<String, StoredObject>>,
    uploads: HashMap<String, PendingUpload>,
}

/// Object store backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an empty bucket (builder style).
    pub fn with_bucket(self, bucket: impl Into<String>) -> Self {
        self.create_bucket(bucket);
        self
    }

    /// Adds an empty bucket if it does not exist yet.
    pub fn create_bucket(&self, bucket: impl Into<String>) {
        self.lock().buckets.entry(bucket.into()).or_default();
    }

    /// Returns a copy of a stored object's bytes.
    pub fn get_object(&self, bucket: &str, object: &str) -> Option<Vec<u8>> {
        self.lock()
            .buckets
            .get(bucket)
            .and_then(|b| b.get(object))
            .map(|o| o.data.clone())
    }

    /// Returns a stored object's ETag.
    pub fn object_etag(&self, bucket: &str, object: &str) -> Option<String> {
        self.lock()
            .buckets
            .get(bucket)
            .and_then(|b| b.get(object))
            .map(|o| o.etag.clone())
    }

    /// Number of multipart transactions still open.
    pub fn open_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    /// Part numbers staged for an open transaction, ascending.
    pub fn staged_parts(&self, upload_id: &str) -> Vec<u32> {
        self.lock()
            .uploads
            .get(upload_id)
            .map(|u| u.parts.keys().copied().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_sync(&self, bucket: &str, object: &str) -> Result<Transaction, StoreError> {
        validate_names(bucket, object)?;
        let mut inner = self.lock();
        if !inner.buckets.contains_key(bucket) {
            return Err(StoreError::NoSuchBucket(bucket.to_string()));
        }
        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        inner.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                object: object.to_string(),
                parts: BTreeMap::new(),
            },
        );
        debug!(bucket, object, upload_id = %upload_id, "opened multipart upload");
        Ok(Transaction {
            upload_id,
            bucket: bucket.to_string(),
            object: object.to_string(),
        })
    }

    fn upload_part_sync(
        &self,
        txn: &Transaction,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<String, StoreError> {
        if part_number == 0 {
            return Err(StoreError::InvalidPart {
                part_number,
                reason: "part numbers start at 1".into(),
            });
        }
        let etag = md5_hex(&data);
        let mut inner = self.lock();
        let upload = inner
            .uploads
            .get_mut(&txn.upload_id)
            .ok_or_else(|| StoreError::NoSuchUpload(txn.upload_id.clone()))?;
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    fn complete_sync(
        &self,
        txn: &Transaction,
        parts: &[CompletedPart],
    ) -> Result<String, StoreError> {
        check_part_order(parts)?;
        let mut inner = self.lock();
        let upload = inner
            .uploads
            .get(&txn.upload_id)
            .ok_or_else(|| StoreError::NoSuchUpload(txn.upload_id.clone()))?;

        let mut data = Vec::new();
        for part in parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, bytes)) if *etag == part.etag => data.extend_from_slice(bytes),
                Some(_) => {
                    return Err(StoreError::InvalidPart {
                        part_number: part.part_number,
                        reason: "etag does not match the uploaded part".into(),
                    });
                }
                None => {
                    return Err(StoreError::InvalidPart {
                        part_number: part.part_number,
                        reason: "part was never uploaded".into(),
                    });
                }
            }
        }

        let etag = multipart_etag(parts);
        let (bucket, object) = (upload.bucket.clone(), upload.object.clone());
        inner.uploads.remove(&txn.upload_id);
        inner
            .buckets
            .entry(bucket)
            .or_default()
            .insert(object, StoredObject { data, etag: etag.clone() });
        Ok(etag)
    }

    fn list_parts_sync(&self, txn: &Transaction) -> Result<Vec<CompletedPart>, StoreError> {
        let inner = self.lock();
        let upload = inner
            .uploads
            .get(&txn.upload_id)
            .ok_or_else(|| StoreError::NoSuchUpload(txn.upload_id.clone()))?;
        Ok(upload
            .parts
            .iter()
            .map(|(&part_number, (etag, _))| CompletedPart {
                part_number,
                etag: etag.clone(),
            })
            .collect())
    }

    fn abort_sync(&self, txn: &Transaction) -> Result<(), StoreError> {
        self.lock()
            .uploads
            .remove(&txn.upload_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NoSuchUpload(txn.upload_id.clone()))
    }

    fn put_sync(&self, bucket: &str, object: &str, data: Vec<u8>) -> Result<String, StoreError> {
        validate_names(bucket, object)?;
        let etag = md5_hex(&data);
        let mut inner = self.lock();
        let objects = inner
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::NoSuchBucket(bucket.to_string()))?;
        objects.insert(
            object.to_string(),
            StoredObject {
                data,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }
}

impl ObjectStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open_transaction<'a>(
        &'a self,
        bucket: &'a str,
        object: &'a str,
    ) -> StoreFuture<'a, Transaction> {
        Box::pin(async move { self.open_sync(bucket, object) })
    }

    fn upload_part<'a>(
        &'a self,
        txn: &'a Transaction,
        part_number: u32,
        data: Vec<u8>,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move { self.upload_part_sync(txn, part_number, data) })
    }

    fn list_parts<'a>(&'a self, txn: &'a Transaction) -> StoreFuture<'a, Vec<CompletedPart>> {
        Box::pin(async move { self.list_parts_sync(txn) })
    }

    fn complete_transaction<'a>(
        &'a self,
        txn: &'a Transaction,
        parts: &'a [CompletedPart],
    ) -> StoreFuture<'a, String> {
        Box::pin(async move { self.complete_sync(txn, parts) })
    }

    fn abort_transaction<'a>(&'a self, txn: &'a Transaction) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.abort_sync(txn) })
    }

    fn put_object<'a>(
        &'a self,
        bucket: &'a str,
        object: &'a str,
        data: Vec<u8>,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move { self.put_sync(bucket, object, data) })
    }
}
