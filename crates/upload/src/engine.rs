//! Upload engine: the control surface over tasks, workers and checkpoints.
//!
//! `start_upload` registers a task and spawns its transfer. The transfer
//! either sends a small payload in one request or drives a multipart
//! transaction through the worker pool, resuming from a checkpoint when
//! one matches the payload. Every transfer ends in exactly one of commit,
//! abort or interruption. Interruption (shutdown or deadline) leaves the
//! transaction open and the checkpoint in place for a later resume.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use objgate_protocol::{UploadState, UploadStatus};
use objgate_store::{ObjectStore, StoreError, Transaction};
use objgate_transfer::{
    ChunkDescriptor, CompletedPart, Fingerprint, UploadSource, md5_hex, pending_chunks, plan,
    validate_bucket_name, validate_object_key,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::UploadError;
use crate::checkpoint::{Checkpoint, CheckpointStore, checkpoint_key};
use crate::committer::Committer;
use crate::config::EngineConfig;
use crate::coordinator::{Coordinator, PoolOutcome};
use crate::registry::{TaskRegistry, UploadTask};

type Completion = watch::Receiver<Option<UploadStatus>>;

struct EngineInner {
    store: Arc<dyn ObjectStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    registry: TaskRegistry,
    config: EngineConfig,
    completions: Mutex<HashMap<String, Completion>>,
    shutdown: CancellationToken,
}

/// Resumable multipart upload engine.
///
/// Cheap to clone; clones share tasks and configuration.
#[derive(Clone)]
pub struct UploadEngine {
    inner: Arc<EngineInner>,
}

impl UploadEngine {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: EngineConfig,
    ) -> Result<Self, UploadError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                store,
                checkpoints,
                registry: TaskRegistry::new(config.finished_retention),
                config,
                completions: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    /// Registers an upload of `source` to `bucket/object` and starts it in
    /// the background. Returns the new upload id.
    pub fn start_upload(
        &self,
        bucket: &str,
        object: &str,
        source: Arc<dyn UploadSource>,
    ) -> Result<String, UploadError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(UploadError::Interrupted("engine is shutting down".into()));
        }
        validate_bucket_name(bucket)
            .and_then(|_| validate_object_key(object))
            .map_err(|e| UploadError::InvalidConfiguration(e.to_string()))?;

        let chunks = plan(source.size(), self.inner.config.part_size)
            .map_err(|e| UploadError::InvalidConfiguration(e.to_string()))?;

        let id = generate_upload_id(object);
        let task = Arc::new(UploadTask::new(id.clone(), bucket, object));
        self.inner.registry.create(Arc::clone(&task))?;

        let (done_tx, done_rx) = watch::channel(None);
        self.completions().insert(id.clone(), done_rx);

        info!(
            upload_id = %id,
            bucket,
            object,
            size = source.size(),
            store = self.inner.store.name(),
            "upload started"
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let status = inner.run(task, source, chunks).await;
            let id = status.upload_id.clone();
            done_tx.send_replace(Some(status));
            inner
                .completions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
        });

        Ok(id)
    }

    /// Stops dispatching new parts. Parts already in flight finish.
    pub fn pause(&self, id: &str) -> Result<(), UploadError> {
        self.inner.registry.set_paused(id, true)?;
        info!(upload_id = %id, "upload paused");
        Ok(())
    }

    pub fn resume(&self, id: &str) -> Result<(), UploadError> {
        self.inner.registry.set_paused(id, false)?;
        info!(upload_id = %id, "upload resumed");
        Ok(())
    }

    /// Cancels an upload and waits until its transaction has been aborted.
    ///
    /// Afterwards the id is unknown to the engine. Cancelling an upload that
    /// already finished only forgets its retained status.
    pub async fn cancel(&self, id: &str) -> Result<(), UploadError> {
        if let Err(err) = self.inner.registry.set_canceled(id) {
            if self.inner.registry.forget_finished(id) {
                info!(upload_id = %id, "finished upload forgotten");
                return Ok(());
            }
            return Err(err);
        }
        info!(upload_id = %id, "upload cancel requested");

        let completion = self.completions().get(id).cloned();
        if let Some(mut rx) = completion {
            let _ = rx.wait_for(Option::is_some).await;
        }
        self.inner.registry.remove(id);
        Ok(())
    }

    pub fn status(&self, id: &str) -> Result<UploadStatus, UploadError> {
        self.inner.registry.snapshot(id)
    }

    /// Snapshots of every upload still running.
    pub fn active(&self) -> Vec<UploadStatus> {
        self.inner.registry.live()
    }

    /// Waits for an upload to finish and returns its final status.
    pub async fn wait(&self, id: &str) -> Result<UploadStatus, UploadError> {
        let completion = self.completions().get(id).cloned();
        let Some(mut rx) = completion else {
            return self.inner.registry.snapshot(id);
        };
        match rx.wait_for(Option::is_some).await {
            Ok(status) => (*status)
                .clone()
                .ok_or_else(|| UploadError::NotFound(id.to_string())),
            Err(_) => Err(UploadError::Interrupted(format!(
                "transfer of {id} ended without a result"
            ))),
        }
    }

    /// Interrupts every running upload and waits for them to wind down.
    ///
    /// Open transactions and checkpoints are kept so the uploads can be
    /// resumed by a later `start_upload` of the same payload.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let pending: Vec<Completion> = self.completions().values().cloned().collect();
        info!(uploads = pending.len(), "shutting down upload engine");
        for mut rx in pending {
            let _ = rx.wait_for(Option::is_some).await;
        }
    }

    fn completions(&self) -> MutexGuard<'_, HashMap<String, Completion>> {
        self.inner
            .completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// `<first 8 hex of md5(object)>-<unix nanos>`.
fn generate_upload_id(object: &str) -> String {
    let digest = md5_hex(object.as_bytes());
    let now = Utc::now();
    let nanos = now
        .timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1000));
    format!("{}-{nanos}", &digest[..8])
}

impl EngineInner {
    /// Drives one transfer to its end and retires the task.
    async fn run(
        &self,
        task: Arc<UploadTask>,
        source: Arc<dyn UploadSource>,
        chunks: Vec<ChunkDescriptor>,
    ) -> UploadStatus {
        let deadline = self.config.deadline();
        let preempted = async {
            match deadline {
                Some(limit) => tokio::select! {
                    _ = self.shutdown.cancelled() => "engine shutting down",
                    _ = tokio::time::sleep(limit) => "deadline exceeded",
                },
                None => {
                    self.shutdown.cancelled().await;
                    "engine shutting down"
                }
            }
        };

        let result = tokio::select! {
            biased;
            reason = preempted => Err(UploadError::Interrupted(reason.to_string())),
            result = self.transfer(&task, source, chunks) => result,
        };

        let (state, etag) = match result {
            Ok(etag) => {
                info!(upload_id = %task.id(), etag = %etag, "upload completed");
                (UploadState::Completed, Some(etag))
            }
            Err(UploadError::Cancelled) => {
                info!(upload_id = %task.id(), "upload cancelled");
                (UploadState::Cancelled, None)
            }
            Err(err @ UploadError::Interrupted(_)) => {
                warn!(upload_id = %task.id(), "upload interrupted, checkpoint kept: {err}");
                task.record_error(err.to_string());
                (UploadState::Interrupted, None)
            }
            Err(err) => {
                warn!(upload_id = %task.id(), "upload failed: {err}");
                task.record_error(err.to_string());
                (UploadState::Failed, None)
            }
        };
        task.finish(state, etag);
        let status = task.snapshot();
        self.registry.retire(task.id());
        status
    }

    async fn transfer(
        &self,
        task: &Arc<UploadTask>,
        source: Arc<dyn UploadSource>,
        chunks: Vec<ChunkDescriptor>,
    ) -> Result<String, UploadError> {
        if source.size() < self.config.part_size {
            return self.put_whole(task, source.as_ref()).await;
        }
        if task.is_canceled() {
            return Err(UploadError::Cancelled);
        }

        let key = checkpoint_key(task.bucket(), task.object());
        let (txn, mut checkpoint) = self.open_or_resume(task, source.fingerprint(), &key).await?;

        // Parts beyond the plan cannot come from a matching checkpoint; guard anyway.
        let recovered: Vec<CompletedPart> = checkpoint
            .parts
            .iter()
            .filter(|p| p.part_number >= 1 && p.part_number as usize <= chunks.len())
            .cloned()
            .collect();
        task.bind_transaction(txn.upload_id.clone());
        task.begin(chunks.len(), &recovered);

        let pending = pending_chunks(&chunks, &recovered);
        info!(
            upload_id = %task.id(),
            transaction = %txn.upload_id,
            total = chunks.len(),
            recovered = recovered.len(),
            pending = pending.len(),
            "multipart transfer running"
        );

        let txn = Arc::new(txn);
        let committer = Committer {
            store: self.store.as_ref(),
            checkpoints: self.checkpoints.as_ref(),
            checkpoint_key: &key,
        };
        let coordinator = Coordinator {
            store: Arc::clone(&self.store),
            source,
            task: Arc::clone(task),
            txn: Arc::clone(&txn),
            checkpoints: self.checkpoints.as_ref(),
            checkpoint_key: &key,
            workers: self.config.workers,
        };

        match coordinator.run(pending, &mut checkpoint).await {
            PoolOutcome::Finished => {
                match committer.commit(&txn, task.completed_parts(), chunks.len()).await {
                    Ok(etag) => Ok(etag),
                    Err(err) => {
                        committer.abort(&txn).await;
                        Err(err)
                    }
                }
            }
            PoolOutcome::Cancelled => {
                committer.abort(&txn).await;
                Err(UploadError::Cancelled)
            }
            PoolOutcome::Failed(err) => {
                committer.abort(&txn).await;
                Err(err)
            }
        }
    }

    /// Payloads smaller than one part skip the multipart protocol.
    async fn put_whole(&self, task: &UploadTask, source: &dyn UploadSource) -> Result<String, UploadError> {
        let stop = CancellationToken::new();
        if !task.wait_until_runnable(&stop).await {
            return Err(UploadError::Cancelled);
        }
        task.begin(0, &[]);

        let data = source
            .read_range(0, source.size())
            .await
            .map_err(|e| UploadError::TransientPartFailure {
                part_number: 1,
                reason: e.to_string(),
            })?;
        if task.is_canceled() {
            return Err(UploadError::Cancelled);
        }
        debug!(upload_id = %task.id(), bytes = data.len(), "single request upload");
        let etag = self
            .store
            .put_object(task.bucket(), task.object(), data)
            .await?;
        Ok(etag)
    }

    /// Picks up the transaction recorded for this object when it still
    /// matches the payload, otherwise opens a new one.
    async fn open_or_resume(
        &self,
        task: &UploadTask,
        fingerprint: Fingerprint,
        key: &str,
    ) -> Result<(Transaction, Checkpoint), UploadError> {
        let part_size = self.config.part_size;
        match self.checkpoints.load(key).await {
            Ok(Some(checkpoint)) => {
                match checkpoint.matches(task.bucket(), task.object(), &fingerprint, part_size) {
                    Ok(()) => {
                        let txn = checkpoint.transaction();
                        match self.store.list_parts(&txn).await {
                            Ok(listed) => {
                                let checkpoint = self.reconcile(task, checkpoint, &listed, key).await;
                                info!(
                                    upload_id = %task.id(),
                                    transaction = %checkpoint.transaction_id,
                                    parts = checkpoint.parts.len(),
                                    "resuming from checkpoint"
                                );
                                return Ok((txn, checkpoint));
                            }
                            Err(StoreError::NoSuchUpload(_)) => {
                                warn!(
                                    upload_id = %task.id(),
                                    transaction = %checkpoint.transaction_id,
                                    "recorded transaction no longer exists, starting over"
                                );
                                self.discard(&checkpoint, key, false).await;
                            }
                            Err(e) => {
                                warn!(
                                    upload_id = %task.id(),
                                    transaction = %checkpoint.transaction_id,
                                    "cannot list parts of recorded transaction, starting over: {e}"
                                );
                                self.discard(&checkpoint, key, true).await;
                            }
                        }
                    }
                    Err(_) => {
                        warn!(
                            upload_id = %task.id(),
                            transaction = %checkpoint.transaction_id,
                            "checkpoint does not match the payload, starting over"
                        );
                        self.discard(&checkpoint, key, true).await;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(upload_id = %task.id(), "unreadable checkpoint ignored: {e}");
            }
        }

        let txn = self.store.open_transaction(task.bucket(), task.object()).await?;
        let checkpoint = Checkpoint::new(&txn, fingerprint, part_size);
        if let Err(e) = self.checkpoints.save(key, &checkpoint).await {
            warn!(upload_id = %task.id(), "failed to save checkpoint: {e}");
        }
        Ok((txn, checkpoint))
    }

    /// Keeps only the recorded parts the store still holds with the same ETag.
    async fn reconcile(
        &self,
        task: &UploadTask,
        mut checkpoint: Checkpoint,
        listed: &[CompletedPart],
        key: &str,
    ) -> Checkpoint {
        let before = checkpoint.parts.len();
        checkpoint.parts.retain(|part| listed.contains(part));
        let dropped = before - checkpoint.parts.len();
        if dropped > 0 {
            warn!(
                upload_id = %task.id(),
                transaction = %checkpoint.transaction_id,
                dropped,
                "recorded parts missing from the store will be uploaded again"
            );
            if let Err(e) = self.checkpoints.save(key, &checkpoint).await {
                warn!(upload_id = %task.id(), "failed to save checkpoint: {e}");
            }
        }
        checkpoint
    }

    /// Drops a checkpoint that can no longer be resumed.
    async fn discard(&self, checkpoint: &Checkpoint, key: &str, abort: bool) {
        if abort && let Err(e) = self.store.abort_transaction(&checkpoint.transaction()).await {
            debug!(transaction = %checkpoint.transaction_id, "stale transaction not aborted: {e}");
        }
        if let Err(e) = self.checkpoints.delete(key).await {
            warn!(key, "failed to delete stale checkpoint: {e}");
        }
    }
}
