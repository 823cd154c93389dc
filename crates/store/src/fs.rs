//! Filesystem-backed object store.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<bucket>/<object>               committed objects
//! <root>/.multipart/<upload_id>/         open transaction
//! <root>/.multipart/<upload_id>/upload.json
//! <root>/.multipart/<upload_id>/00001.part
//! ```
//!
//! Writes go to a temporary file first and are renamed into place, so a
//! reader never observes a half-written object or part.

use std::path::{Path, PathBuf};

use objgate_transfer::md5_hex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::{
    CompletedPart, ObjectStore, StoreError, StoreFuture, Transaction, check_part_order,
    multipart_etag, validate_names,
};

/// Directory under the root holding open transactions.
pub const STAGING_DIR: &str = ".multipart";

const MANIFEST_FILE: &str = "upload.json";

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    bucket: String,
    object: String,
}

/// Object store rooted at a local directory; buckets are subdirectories.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates a bucket directory.
    pub async fn create_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        self.check_bucket_name(bucket)?;
        tokio::fs::create_dir_all(self.root.join(bucket)).await?;
        Ok(())
    }

    /// Path of a committed object.
    pub fn object_path(&self, bucket: &str, object: &str) -> PathBuf {
        self.root.join(bucket).join(object)
    }

    fn staging_path(&self, upload_id: &str) -> PathBuf {
        self.root.join(STAGING_DIR).join(upload_id)
    }

    fn check_bucket_name(&self, bucket: &str) -> Result<(), StoreError> {
        objgate_transfer::validate_bucket_name(bucket)
            .map_err(|e| StoreError::InvalidRequest(e.to_string()))?;
        if bucket == STAGING_DIR {
            return Err(StoreError::InvalidRequest(format!(
                "bucket name reserved: {bucket}"
            )));
        }
        Ok(())
    }

    async fn ensure_bucket(&self, bucket: &str, object: &str) -> Result<(), StoreError> {
        validate_names(bucket, object)?;
        self.check_bucket_name(bucket)?;
        match tokio::fs::metadata(self.root.join(bucket)).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(StoreError::NoSuchBucket(bucket.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NoSuchBucket(bucket.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn staging_dir(&self, txn: &Transaction) -> Result<PathBuf, StoreError> {
        let dir = self.staging_path(&txn.upload_id);
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(dir),
            Ok(_) => Err(StoreError::NoSuchUpload(txn.upload_id.clone())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NoSuchUpload(txn.upload_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn open(&self, bucket: &str, object: &str) -> Result<Transaction, StoreError> {
        self.ensure_bucket(bucket, object).await?;
        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        let dir = self.staging_path(&upload_id);
        tokio::fs::create_dir_all(&dir).await?;

        let manifest = Manifest {
            bucket: bucket.to_string(),
            object: object.to_string(),
        };
        let json = serde_json::to_vec(&manifest)
            .map_err(|e| StoreError::InvalidRequest(e.to_string()))?;
        write_atomic(&dir.join(MANIFEST_FILE), &json).await?;

        debug!(bucket, object, upload_id = %upload_id, "opened multipart upload");
        Ok(Transaction {
            upload_id,
            bucket: bucket.to_string(),
            object: object.to_string(),
        })
    }

    async fn put_part(
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
        let dir = self.staging_dir(txn).await?;
        let etag = md5_hex(&data);
        write_atomic(&dir.join(part_file_name(part_number)), &data).await?;
        Ok(etag)
    }

    async fn list(&self, txn: &Transaction) -> Result<Vec<CompletedPart>, StoreError> {
        let dir = self.staging_dir(txn).await?;
        let mut parts = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(part_number) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".part"))
                .and_then(|stem| stem.parse::<u32>().ok())
            else {
                continue;
            };
            let data = tokio::fs::read(entry.path()).await?;
            parts.push(CompletedPart {
                part_number,
                etag: md5_hex(&data),
            });
        }
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    async fn complete(
        &self,
        txn: &Transaction,
        parts: &[CompletedPart],
    ) -> Result<String, StoreError> {
        check_part_order(parts)?;
        let dir = self.staging_dir(txn).await?;
        let manifest: Manifest = serde_json::from_slice(&tokio::fs::read(dir.join(MANIFEST_FILE)).await?)
            .map_err(|e| StoreError::InvalidRequest(format!("corrupt upload manifest: {e}")))?;

        let target = self.object_path(&manifest.bucket, &manifest.object);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = dir.join("assembled.tmp");
        let mut out = tokio::fs::File::create(&tmp).await?;

        for part in parts {
            let path = dir.join(part_file_name(part.part_number));
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StoreError::InvalidPart {
                        part_number: part.part_number,
                        reason: "part was never uploaded".into(),
                    });
                }
                Err(e) => return Err(e.into()),
            };
            if md5_hex(&data) != part.etag {
                return Err(StoreError::InvalidPart {
                    part_number: part.part_number,
                    reason: "etag does not match the uploaded part".into(),
                });
            }
            out.write_all(&data).await?;
        }
        out.sync_all().await?;
        drop(out);

        tokio::fs::rename(&tmp, &target).await?;
        tokio::fs::remove_dir_all(&dir).await?;
        Ok(multipart_etag(parts))
    }

    async fn abort(&self, txn: &Transaction) -> Result<(), StoreError> {
        let dir = self.staging_dir(txn).await?;
        tokio::fs::remove_dir_all(dir).await?;
        Ok(())
    }

    async fn put(&self, bucket: &str, object: &str, data: Vec<u8>) -> Result<String, StoreError> {
        self.ensure_bucket(bucket, object).await?;
        let target = self.object_path(bucket, object);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let etag = md5_hex(&data);
        write_atomic(&target, &data).await?;
        Ok(etag)
    }
}

fn part_file_name(part_number: u32) -> String {
    format!("{part_number:05}.part")
}

/// Writes `data` next to `path` and renames it over `path`.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

impl ObjectStore for FsStore {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn open_transaction<'a>(
        &'a self,
        bucket: &'a str,
        object: &'a str,
    ) -> StoreFuture<'a, Transaction> {
        Box::pin(self.open(bucket, object))
    }

    fn upload_part<'a>(
        &'a self,
        txn: &'a Transaction,
        part_number: u32,
        data: Vec<u8>,
    ) -> StoreFuture<'a, String> {
        Box::pin(self.put_part(txn, part_number, data))
    }

    fn list_parts<'a>(&'a self, txn: &'a Transaction) -> StoreFuture<'a, Vec<CompletedPart>> {
        Box::pin(self.list(txn))
    }

    fn complete_transaction<'a>(
        &'a self,
        txn: &'a Transaction,
        parts: &'a [CompletedPart],
    ) -> StoreFuture<'a, String> {
        Box::pin(self.complete(txn, parts))
    }

    fn abort_transaction<'a>(&'a self, txn: &'a Transaction) -> StoreFuture<'a, ()> {
        Box::pin(self.abort(txn))
    }

    fn put_object<'a>(
        &'a self,
        bucket: &'a str,
        object: &'a str,
        data: Vec<u8>,
    ) -> StoreFuture<'a, String> {
        Box::pin(self.put(bucket, object, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store_with_bucket(dir: &TempDir) -> FsStore {
        let store = FsStore::new(dir.path());
        store.create_bucket("media").await.unwrap();
        store
    }

    #[tokio::test]
    async fn multipart_roundtrip_writes_object() {
        let dir = TempDir::new().unwrap();
        let store = store_with_bucket(&dir).await;

        let txn = store.open_transaction("media", "videos/clip.mp4").await.unwrap();
        let e2 = store.upload_part(&txn, 2, b"World".to_vec()).await.unwrap();
        let e1 = store.upload_part(&txn, 1, b"Hello ".to_vec()).await.unwrap();

        let parts = vec![
            CompletedPart {
                part_number: 1,
                etag: e1,
            },
            CompletedPart {
                part_number: 2,
                etag: e2,
            },
        ];
        let etag = store.complete_transaction(&txn, &parts).await.unwrap();
        assert!(etag.ends_with("-2"));

        let content = std::fs::read(store.object_path("media", "videos/clip.mp4")).unwrap();
        assert_eq!(&content, b"Hello World");
        assert!(!store.staging_path(&txn.upload_id).exists());
    }

    #[tokio::test]
    async fn open_requires_existing_bucket() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path());
        let err = store.open_transaction("missing", "o").await.unwrap_err();
        assert!(matches!(err, StoreError::NoSuchBucket(_)));
    }

    #[tokio::test]
    async fn complete_rejects_tampered_part() {
        let dir = TempDir::new().unwrap();
        let store = store_with_bucket(&dir).await;
        let txn = store.open_transaction("media", "o.bin").await.unwrap();
        let etag = store.upload_part(&txn, 1, b"original".to_vec()).await.unwrap();

        std::fs::write(store.staging_path(&txn.upload_id).join("00001.part"), b"tampered").unwrap();

        let err = store
            .complete_transaction(
                &txn,
                &[CompletedPart {
                    part_number: 1,
                    etag,
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidPart { part_number: 1, .. }));
        assert!(!store.object_path("media", "o.bin").exists());
    }

    #[tokio::test]
    async fn list_parts_reads_staging_directory() {
        let dir = TempDir::new().unwrap();
        let store = store_with_bucket(&dir).await;
        let txn = store.open_transaction("media", "o.bin").await.unwrap();
        let e2 = store.upload_part(&txn, 2, b"second".to_vec()).await.unwrap();
        let e1 = store.upload_part(&txn, 1, b"first".to_vec()).await.unwrap();

        let listed = store.list_parts(&txn).await.unwrap();
        let numbers: Vec<u32> = listed.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(listed[0].etag, e1);
        assert_eq!(listed[1].etag, e2);

        store.abort_transaction(&txn).await.unwrap();
        let err = store.list_parts(&txn).await.unwrap_err();
        assert!(matches!(err, StoreError::NoSuchUpload(_)));
    }

    #[tokio::test]
    async fn abort_removes_staging() {
        let dir = TempDir::new().unwrap();
        let store = store_with_bucket(&dir).await;
        let txn = store.open_transaction("media", "o.bin").await.unwrap();
        store.upload_part(&txn, 1, b"x".to_vec()).await.unwrap();

        store.abort_transaction(&txn).await.unwrap();
        assert!(!store.staging_path(&txn.upload_id).exists());

        let err = store.abort_transaction(&txn).await.unwrap_err();
        assert!(matches!(err, StoreError::NoSuchUpload(_)));
    }

    #[tokio::test]
    async fn put_object_writes_file() {
        let dir = TempDir::new().unwrap();
        let store = store_with_bucket(&dir).await;
        let etag = store.put_object("media", "small.txt", b"hello".to_vec()).await.unwrap();
        assert_eq!(etag, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(std::fs::read(store.object_path("media", "small.txt")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn rejects_traversal_and_reserved_bucket() {
        let dir = TempDir::new().unwrap();
        let store = store_with_bucket(&dir).await;
        assert!(matches!(
            store.put_object("media", "../escape", vec![]).await,
            Err(StoreError::InvalidRequest(_))
        ));
        assert!(matches!(
            store.create_bucket(STAGING_DIR).await,
            Err(StoreError::InvalidRequest(_))
        ));
    }
}
