//! Concurrent part uploads for one transfer.
//!
//! A dispatcher feeds pending chunks into a bounded queue. A fixed set of
//! workers pull from it. Each worker checks the cancel flag, waits out any
//! pause, reads its byte range and uploads the part. It then merges the
//! acknowledgement into the task and reports it back. The coordinator is the
//! only writer of the checkpoint and persists it after every reported part.
//! The first part failure stops dispatch and is the error the transfer
//! fails with.

use std::sync::Arc;

use objgate_store::{ObjectStore, Transaction};
use objgate_transfer::{ChunkDescriptor, CompletedPart, UploadSource};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::UploadError;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::registry::UploadTask;

/// How a pool run ended.
#[derive(Debug)]
pub(crate) enum PoolOutcome {
    /// Every dispatched chunk was acknowledged.
    Finished,
    /// The task was canceled before all chunks were acknowledged.
    Cancelled,
    /// A part failed; the first failure wins.
    Failed(UploadError),
}

enum PartEvent {
    Completed(CompletedPart),
    Failed(UploadError),
}

/// Everything a worker needs, shared by reference count.
#[derive(Clone)]
struct WorkerContext {
    store: Arc<dyn ObjectStore>,
    source: Arc<dyn UploadSource>,
    task: Arc<UploadTask>,
    txn: Arc<Transaction>,
}

pub(crate) struct Coordinator<'a> {
    pub store: Arc<dyn ObjectStore>,
    pub source: Arc<dyn UploadSource>,
    pub task: Arc<UploadTask>,
    pub txn: Arc<Transaction>,
    pub checkpoints: &'a dyn CheckpointStore,
    pub checkpoint_key: &'a str,
    pub workers: usize,
}

impl Coordinator<'_> {
    /// Uploads `chunks` and records each acknowledgement in `checkpoint`.
    pub(crate) async fn run(
        &self,
        chunks: Vec<ChunkDescriptor>,
        checkpoint: &mut Checkpoint,
    ) -> PoolOutcome {
        if chunks.is_empty() {
            return if self.task.is_canceled() {
                PoolOutcome::Cancelled
            } else {
                PoolOutcome::Finished
            };
        }

        let worker_count = self.workers.min(chunks.len()).max(1);
        let stop = self.task.cancellation().child_token();
        let (work_tx, work_rx) = flume::bounded::<ChunkDescriptor>(worker_count);
        let (event_tx, mut event_rx) = mpsc::channel::<PartEvent>(worker_count * 2);

        info!(
            upload_id = %self.task.id(),
            chunks = chunks.len(),
            workers = worker_count,
            "dispatching parts"
        );

        let ctx = WorkerContext {
            store: Arc::clone(&self.store),
            source: Arc::clone(&self.source),
            task: Arc::clone(&self.task),
            txn: Arc::clone(&self.txn),
        };
        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            workers.spawn(worker_loop(
                worker_id,
                ctx.clone(),
                work_rx.clone(),
                event_tx.clone(),
                stop.clone(),
            ));
        }
        drop(work_rx);
        drop(event_tx);

        let dispatch = async {
            for chunk in chunks {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    sent = work_tx.send_async(chunk) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            drop(work_tx);
        };

        let collect = async {
            let mut failure: Option<UploadError> = None;
            while let Some(event) = event_rx.recv().await {
                match event {
                    PartEvent::Completed(part) => {
                        debug!(
                            upload_id = %self.task.id(),
                            part = part.part_number,
                            "part acknowledged"
                        );
                        checkpoint.record(part);
                        if let Err(e) = self.checkpoints.save(self.checkpoint_key, checkpoint).await {
                            warn!(upload_id = %self.task.id(), "failed to save checkpoint: {e}");
                        }
                    }
                    PartEvent::Failed(err) => {
                        if failure.is_none() {
                            error!(upload_id = %self.task.id(), "part upload failed: {err}");
                            self.task.record_error(err.to_string());
                            failure = Some(err);
                            stop.cancel();
                        } else {
                            debug!(upload_id = %self.task.id(), "additional part failure: {err}");
                        }
                    }
                }
            }
            failure
        };

        let ((), mut failure) = tokio::join!(dispatch, collect);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined
                && failure.is_none()
            {
                error!(upload_id = %self.task.id(), "worker ended abnormally: {e}");
                let err = UploadError::Interrupted(format!("worker ended abnormally: {e}"));
                self.task.record_error(err.to_string());
                failure = Some(err);
            }
        }

        if let Some(err) = failure {
            return PoolOutcome::Failed(err);
        }
        if self.task.is_canceled() {
            return PoolOutcome::Cancelled;
        }
        PoolOutcome::Finished
    }
}

async fn worker_loop(
    worker_id: usize,
    ctx: WorkerContext,
    queue: flume::Receiver<ChunkDescriptor>,
    events: mpsc::Sender<PartEvent>,
    stop: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = queue.recv_async() => match next {
                Ok(chunk) => chunk,
                Err(_) => break,
            },
        };

        if ctx.task.is_canceled() {
            debug!(worker_id, part = chunk.part_number, "upload canceled, worker exiting");
            break;
        }
        if ctx.task.is_paused() {
            debug!(worker_id, part = chunk.part_number, "upload paused, worker waiting");
        }
        if !ctx.task.wait_until_runnable(&stop).await {
            break;
        }

        let data = match ctx.source.read_range(chunk.start, chunk.end).await {
            Ok(data) => data,
            Err(e) => {
                let _ = events
                    .send(PartEvent::Failed(UploadError::TransientPartFailure {
                        part_number: chunk.part_number,
                        reason: e.to_string(),
                    }))
                    .await;
                break;
            }
        };

        let etag = match ctx.store.upload_part(&ctx.txn, chunk.part_number, data).await {
            Ok(etag) => etag,
            Err(e) => {
                let _ = events
                    .send(PartEvent::Failed(UploadError::TransientPartFailure {
                        part_number: chunk.part_number,
                        reason: e.to_string(),
                    }))
                    .await;
                break;
            }
        };

        let part = CompletedPart {
            part_number: chunk.part_number,
            etag,
        };
        if !ctx.task.record_part(part.clone()) {
            debug!(worker_id, part = chunk.part_number, "discarding part of canceled upload");
            break;
        }
        if events.send(PartEvent::Completed(part)).await.is_err() {
            break;
        }
    }
    debug!(worker_id, "worker finished");
}
