//! Durable per-object upload progress.
//!
//! A checkpoint ties an open store transaction to the payload it was opened
//! for, together with every part the store has acknowledged so far. It is
//! keyed by `bucket/object` so a later upload of the same object can pick
//! the transaction up again.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use objgate_store::Transaction;
use objgate_transfer::{CompletedPart, Fingerprint, checksum_bytes};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::UploadError;

/// File extension used by [`FileCheckpointStore`].
pub const CHECKPOINT_EXT: &str = "cp";

/// Future returned by [`CheckpointStore`] operations.
pub type CheckpointFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, UploadError>> + Send + 'a>>;

/// Persistent record of a partially uploaded object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub transaction_id: String,
    pub bucket: String,
    pub object: String,
    pub fingerprint: Fingerprint,
    pub part_size: u64,
    /// Acknowledged parts, ascending and unique by part number.
    pub parts: Vec<CompletedPart>,
}

impl Checkpoint {
    pub fn new(txn: &Transaction, fingerprint: Fingerprint, part_size: u64) -> Self {
        Self {
            transaction_id: txn.upload_id.clone(),
            bucket: txn.bucket.clone(),
            object: txn.object.clone(),
            fingerprint,
            part_size,
            parts: Vec::new(),
        }
    }

    /// The store transaction this checkpoint belongs to.
    pub fn transaction(&self) -> Transaction {
        Transaction {
            upload_id: self.transaction_id.clone(),
            bucket: self.bucket.clone(),
            object: self.object.clone(),
        }
    }

    /// Confirms the checkpoint was written for this exact payload and layout.
    pub fn matches(
        &self,
        bucket: &str,
        object: &str,
        fingerprint: &Fingerprint,
        part_size: u64,
    ) -> Result<(), UploadError> {
        if self.bucket != bucket
            || self.object != object
            || &self.fingerprint != fingerprint
            || self.part_size != part_size
        {
            return Err(UploadError::FingerprintMismatch);
        }
        Ok(())
    }

    /// Records an acknowledged part, replacing any earlier ETag for it.
    pub fn record(&mut self, part: CompletedPart) {
        match self
            .parts
            .binary_search_by_key(&part.part_number, |p| p.part_number)
        {
            Ok(idx) => self.parts[idx] = part,
            Err(idx) => self.parts.insert(idx, part),
        }
    }
}

/// Storage key for the checkpoint of `bucket/object`.
pub fn checkpoint_key(bucket: &str, object: &str) -> String {
    checksum_bytes(format!("{bucket}/{object}").as_bytes())
}

/// Where checkpoints live.
///
/// `load` returns `Ok(None)` when nothing was saved under the key and an
/// error when something was saved but cannot be read back.
pub trait CheckpointStore: Send + Sync {
    fn load<'a>(&'a self, key: &'a str) -> CheckpointFuture<'a, Option<Checkpoint>>;

    /// Replaces the checkpoint under `key` atomically.
    fn save<'a>(&'a self, key: &'a str, checkpoint: &'a Checkpoint) -> CheckpointFuture<'a, ()>;

    /// Removes the checkpoint under `key`. Missing keys are not an error.
    fn delete<'a>(&'a self, key: &'a str) -> CheckpointFuture<'a, ()>;
}

/// Checkpoints as JSON files, one `<key>.cp` per object.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{CHECKPOINT_EXT}"))
    }

    async fn load_file(&self, key: &str) -> Result<Option<Checkpoint>, UploadError> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint = serde_json::from_slice(&bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(checkpoint))
    }

    async fn save_file(&self, key: &str, checkpoint: &Checkpoint) -> Result<(), UploadError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let path = self.path_for(key);
        let tmp = path.with_extension(format!("{CHECKPOINT_EXT}.tmp"));
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(path = %path.display(), parts = checkpoint.parts.len(), "checkpoint saved");
        Ok(())
    }

    async fn delete_file(&self, key: &str) -> Result<(), UploadError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load<'a>(&'a self, key: &'a str) -> CheckpointFuture<'a, Option<Checkpoint>> {
        Box::pin(self.load_file(key))
    }

    fn save<'a>(&'a self, key: &'a str, checkpoint: &'a Checkpoint) -> CheckpointFuture<'a, ()> {
        Box::pin(self.save_file(key, checkpoint))
    }

    fn delete<'a>(&'a self, key: &'a str) -> CheckpointFuture<'a, ()> {
        Box::pin(self.delete_file(key))
    }
}

/// Checkpoints held in memory. Lost on restart.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Checkpoint> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load<'a>(&'a self, key: &'a str) -> CheckpointFuture<'a, Option<Checkpoint>> {
        let found = self.get(key);
        Box::pin(async move { Ok(found) })
    }

    fn save<'a>(&'a self, key: &'a str, checkpoint: &'a Checkpoint) -> CheckpointFuture<'a, ()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), checkpoint.clone());
        Box::pin(async { Ok(()) })
    }

    fn delete<'a>(&'a self, key: &'a str) -> CheckpointFuture<'a, ()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Box::pin(async { Ok(()) })
    }
}
