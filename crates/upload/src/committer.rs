//! Finalizes or discards a store transaction.

use objgate_store::{ObjectStore, Transaction};
use objgate_transfer::CompletedPart;
use tracing::{info, warn};

use crate::UploadError;
use crate::checkpoint::CheckpointStore;

pub(crate) struct Committer<'a> {
    pub store: &'a dyn ObjectStore,
    pub checkpoints: &'a dyn CheckpointStore,
    pub checkpoint_key: &'a str,
}

impl Committer<'_> {
    /// Completes `txn` from `parts`, which may arrive in any order.
    ///
    /// The parts must cover `1..=expected` exactly once. On success the
    /// checkpoint is removed and the object's ETag returned. On failure the
    /// caller still owns the transaction and is expected to abort it.
    pub(crate) async fn commit(
        &self,
        txn: &Transaction,
        mut parts: Vec<CompletedPart>,
        expected: usize,
    ) -> Result<String, UploadError> {
        parts.sort_by_key(|p| p.part_number);
        check_coverage(&parts, expected)?;

        let etag = self
            .store
            .complete_transaction(txn, &parts)
            .await
            .map_err(|e| UploadError::CommitFailure(e.to_string()))?;

        info!(
            bucket = %txn.bucket,
            object = %txn.object,
            parts = parts.len(),
            etag = %etag,
            "multipart upload completed"
        );
        self.discard_checkpoint().await;
        Ok(etag)
    }

    /// Aborts `txn` and removes its checkpoint. Store errors are logged only.
    pub(crate) async fn abort(&self, txn: &Transaction) {
        match self.store.abort_transaction(txn).await {
            Ok(()) => info!(
                bucket = %txn.bucket,
                object = %txn.object,
                upload_id = %txn.upload_id,
                "multipart upload aborted"
            ),
            Err(e) => warn!(upload_id = %txn.upload_id, "failed to abort multipart upload: {e}"),
        }
        self.discard_checkpoint().await;
    }

    async fn discard_checkpoint(&self) {
        if let Err(e) = self.checkpoints.delete(self.checkpoint_key).await {
            warn!(key = %self.checkpoint_key, "failed to delete checkpoint: {e}");
        }
    }
}

/// Sorted `parts` must be exactly `1, 2, .., expected`.
fn check_coverage(parts: &[CompletedPart], expected: usize) -> Result<(), UploadError> {
    if parts.len() != expected {
        return Err(UploadError::CommitFailure(format!(
            "expected {expected} parts, have {}",
            parts.len()
        )));
    }
    for (idx, part) in parts.iter().enumerate() {
        let want = idx as u32 + 1;
        if part.part_number != want {
            return Err(UploadError::CommitFailure(format!(
                "part {want} missing or duplicated (found {})",
                part.part_number
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Checkpoint, MemoryCheckpointStore};
    use crate::testing::{Call, TestStore};
    use chrono::Utc;
    use objgate_transfer::Fingerprint;

    fn part(n: u32, etag: &str) -> CompletedPart {
        CompletedPart {
            part_number: n,
            etag: etag.into(),
        }
    }

    #[test]
    fn coverage_rejects_gaps_and_duplicates() {
        assert!(check_coverage(&[part(1, "a"), part(2, "b")], 2).is_ok());
        assert!(check_coverage(&[part(1, "a"), part(3, "b")], 2).is_err());
        assert!(check_coverage(&[part(1, "a"), part(1, "b")], 2).is_err());
        assert!(check_coverage(&[part(1, "a")], 2).is_err());
    }

    #[tokio::test]
    async fn commit_sorts_parts_and_drops_checkpoint() {
        let store = TestStore::new();
        let txn = store.open_transaction("media", "a.bin").await.unwrap();
        let mut parts = Vec::new();
        for (n, body) in [(3u32, b"ccc"), (1, b"aaa"), (2, b"bbb")] {
            let etag = store.upload_part(&txn, n, body.to_vec()).await.unwrap();
            parts.push(part(n, &etag));
        }

        let checkpoints = MemoryCheckpointStore::new();
        let cp = Checkpoint::new(&txn, Fingerprint::new("a.bin", 9, Utc::now()), 3);
        checkpoints.save("key", &cp).await.unwrap();

        let committer = Committer {
            store: &store,
            checkpoints: &checkpoints,
            checkpoint_key: "key",
        };
        let etag = committer.commit(&txn, parts, 3).await.unwrap();

        assert!(etag.ends_with("-3"));
        assert!(store.calls().contains(&Call::Complete(vec![1, 2, 3])));
        assert_eq!(store.memory().get_object("media", "a.bin").unwrap(), b"aaabbbccc");
        assert!(checkpoints.is_empty());
    }

    #[tokio::test]
    async fn incomplete_parts_never_reach_the_store() {
        let store = TestStore::new();
        let txn = store.open_transaction("media", "a.bin").await.unwrap();
        let checkpoints = MemoryCheckpointStore::new();
        let committer = Committer {
            store: &store,
            checkpoints: &checkpoints,
            checkpoint_key: "key",
        };

        let err = committer
            .commit(&txn, vec![part(1, "x")], 2)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::CommitFailure(_)));
        assert!(!store.calls().iter().any(|c| matches!(c, Call::Complete(_))));
    }

    #[tokio::test]
    async fn abort_discards_transaction_and_checkpoint() {
        let store = TestStore::new();
        let txn = store.open_transaction("media", "a.bin").await.unwrap();
        let checkpoints = MemoryCheckpointStore::new();
        let cp = Checkpoint::new(&txn, Fingerprint::new("a.bin", 9, Utc::now()), 3);
        checkpoints.save("key", &cp).await.unwrap();

        Committer {
            store: &store,
            checkpoints: &checkpoints,
            checkpoint_key: "key",
        }
        .abort(&txn)
        .await;

        assert_eq!(store.abort_count(), 1);
        assert_eq!(store.memory().open_uploads(), 0);
        assert!(checkpoints.is_empty());
    }
}
