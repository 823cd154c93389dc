//! Instrumented stores for engine tests.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use objgate_store::{
    CompletedPart, MemoryStore, ObjectStore, StoreError, StoreFuture, Transaction,
};
use tokio::sync::Semaphore;

use crate::UploadError;
use crate::checkpoint::{Checkpoint, CheckpointFuture, CheckpointStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open,
    /// Recorded when the part is acknowledged, so order is arrival order.
    UploadPart(u32),
    Complete(Vec<u32>),
    Abort,
    Put,
}

/// Wraps a [`MemoryStore`] with a call log and failure injection.
pub struct TestStore {
    inner: MemoryStore,
    calls: Mutex<Vec<Call>>,
    fail_part: Option<u32>,
    fail_complete: bool,
    delays: HashMap<u32, Duration>,
    gate: Option<Arc<Semaphore>>,
    entered: AtomicUsize,
}

impl TestStore {
    /// Store with a `media` bucket.
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new().with_bucket("media"),
            calls: Mutex::new(Vec::new()),
            fail_part: None,
            fail_complete: false,
            delays: HashMap::new(),
            gate: None,
            entered: AtomicUsize::new(0),
        }
    }

    pub fn fail_part(mut self, part_number: u32) -> Self {
        self.fail_part = Some(part_number);
        self
    }

    pub fn fail_complete(mut self) -> Self {
        self.fail_complete = true;
        self
    }

    pub fn delay_part(mut self, part_number: u32, delay: Duration) -> Self {
        self.delays.insert(part_number, delay);
        self
    }

    /// Every part upload takes one permit from `gate` before proceeding.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Acknowledged part numbers in arrival order.
    pub fn uploaded_parts(&self) -> Vec<u32> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::UploadPart(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    pub fn abort_count(&self) -> usize {
        self.calls().iter().filter(|c| **c == Call::Abort).count()
    }

    pub fn open_count(&self) -> usize {
        self.calls().iter().filter(|c| **c == Call::Open).count()
    }

    /// Part uploads that have started, including ones still blocked.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    fn log(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ObjectStore for TestStore {
    fn name(&self) -> &'static str {
        "test"
    }

    fn open_transaction<'a>(
        &'a self,
        bucket: &'a str,
        object: &'a str,
    ) -> StoreFuture<'a, Transaction> {
        Box::pin(async move {
            let txn = self.inner.open_transaction(bucket, object).await?;
            self.log(Call::Open);
            Ok(txn)
        })
    }

    fn upload_part<'a>(
        &'a self,
        txn: &'a Transaction,
        part_number: u32,
        data: Vec<u8>,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            self.entered.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.acquire()
                    .await
                    .map_err(|_| StoreError::InvalidRequest("gate closed".into()))?
                    .forget();
            }
            if let Some(delay) = self.delays.get(&part_number) {
                tokio::time::sleep(*delay).await;
            }
            if self.fail_part == Some(part_number) {
                return Err(StoreError::InvalidPart {
                    part_number,
                    reason: "injected failure".into(),
                });
            }
            let etag = self.inner.upload_part(txn, part_number, data).await?;
            self.log(Call::UploadPart(part_number));
            Ok(etag)
        })
    }

    fn list_parts<'a>(&'a self, txn: &'a Transaction) -> StoreFuture<'a, Vec<CompletedPart>> {
        self.inner.list_parts(txn)
    }

    fn complete_transaction<'a>(
        &'a self,
        txn: &'a Transaction,
        parts: &'a [CompletedPart],
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            self.log(Call::Complete(parts.iter().map(|p| p.part_number).collect()));
            if self.fail_complete {
                return Err(StoreError::InvalidRequest("injected commit failure".into()));
            }
            self.inner.complete_transaction(txn, parts).await
        })
    }

    fn abort_transaction<'a>(&'a self, txn: &'a Transaction) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.log(Call::Abort);
            self.inner.abort_transaction(txn).await
        })
    }

    fn put_object<'a>(
        &'a self,
        bucket: &'a str,
        object: &'a str,
        data: Vec<u8>,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            self.log(Call::Put);
            self.inner.put_object(bucket, object, data).await
        })
    }
}

/// Checkpoint store whose writes always fail; loads find nothing.
#[derive(Default)]
pub struct FailingCheckpointStore {
    saves: AtomicUsize,
}

impl FailingCheckpointStore {
    /// Save attempts so far.
    pub fn save_attempts(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl CheckpointStore for FailingCheckpointStore {
    fn load<'a>(&'a self, _key: &'a str) -> CheckpointFuture<'a, Option<Checkpoint>> {
        Box::pin(async { Ok(None) })
    }

    fn save<'a>(&'a self, _key: &'a str, _checkpoint: &'a Checkpoint) -> CheckpointFuture<'a, ()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err(UploadError::Io(io::Error::other("disk full"))) })
    }

    fn delete<'a>(&'a self, _key: &'a str) -> CheckpointFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}
