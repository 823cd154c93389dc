//! Live upload tasks and their control flags.
//!
//! Every task's mutable state sits behind one mutex. Workers read the
//! pause and cancel flags under that lock, so a control change is seen by
//! the next check. Pausing parks workers on a [`Notify`]; resuming and
//! cancelling wake them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};

use objgate_protocol::{UploadState, UploadStatus};
use objgate_transfer::CompletedPart;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::UploadError;

#[derive(Debug)]
struct TaskState {
    phase: UploadState,
    paused: bool,
    canceled: bool,
    current_part: u32,
    completed: Vec<CompletedPart>,
    total_parts: usize,
    last_error: Option<String>,
    etag: Option<String>,
}

/// One upload's control flags and progress.
#[derive(Debug)]
pub struct UploadTask {
    id: String,
    bucket: String,
    object: String,
    transaction_id: OnceLock<String>,
    state: Mutex<TaskState>,
    wake: Notify,
    cancel: CancellationToken,
}

impl UploadTask {
    pub fn new(id: impl Into<String>, bucket: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            bucket: bucket.into(),
            object: object.into(),
            transaction_id: OnceLock::new(),
            state: Mutex::new(TaskState {
                phase: UploadState::Pending,
                paused: false,
                canceled: false,
                current_part: 0,
                completed: Vec::new(),
                total_parts: 0,
                last_error: None,
                etag: None,
            }),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    /// Store transaction id, once one has been opened or resumed.
    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.get().map(String::as_str)
    }

    /// Binds the task to its store transaction. Returns `false` if it was
    /// already bound.
    pub fn bind_transaction(&self, id: impl Into<String>) -> bool {
        self.transaction_id.set(id.into()).is_ok()
    }

    fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn is_canceled(&self) -> bool {
        self.lock().canceled
    }

    pub fn set_paused(&self, paused: bool) {
        self.lock().paused = paused;
        if !paused {
            self.wake.notify_waiters();
        }
    }

    /// Marks the task canceled and wakes everything waiting on it.
    pub fn cancel(&self) {
        self.lock().canceled = true;
        self.wake.notify_waiters();
        self.cancel.cancel();
    }

    /// Token fired by [`UploadTask::cancel`].
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Blocks while the task is paused.
    ///
    /// Returns `true` when work may continue and `false` when the task was
    /// canceled or `stop` fired.
    pub async fn wait_until_runnable(&self, stop: &CancellationToken) -> bool {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            // Register before reading the flags so a resume in between is not lost.
            notified.as_mut().enable();
            {
                let state = self.lock();
                if state.canceled {
                    return false;
                }
                if !state.paused {
                    return true;
                }
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = stop.cancelled() => return false,
            }
        }
    }

    /// Enters the transfer phase with the plan size and any parts a
    /// checkpoint already covers.
    pub fn begin(&self, total_parts: usize, recovered: &[CompletedPart]) {
        let mut state = self.lock();
        state.phase = UploadState::InProgress;
        state.total_parts = total_parts;
        state.completed = recovered.to_vec();
        state.current_part = recovered.iter().map(|p| p.part_number).max().unwrap_or(0);
    }

    /// Merges an acknowledged part. Returns `false` and drops the part when
    /// the task was canceled in the meantime.
    pub fn record_part(&self, part: CompletedPart) -> bool {
        let mut state = self.lock();
        if state.canceled {
            return false;
        }
        state.current_part = state.current_part.max(part.part_number);
        state.completed.push(part);
        true
    }

    pub fn record_error(&self, message: impl Into<String>) {
        let mut state = self.lock();
        if state.last_error.is_none() {
            state.last_error = Some(message.into());
        }
    }

    /// Copy of every acknowledged part, in arrival order.
    pub fn completed_parts(&self) -> Vec<CompletedPart> {
        self.lock().completed.clone()
    }

    /// Moves the task into a terminal state.
    pub fn finish(&self, phase: UploadState, etag: Option<String>) {
        let mut state = self.lock();
        state.phase = phase;
        state.etag = etag;
        state.paused = false;
    }

    pub fn snapshot(&self) -> UploadStatus {
        let state = self.lock();
        let reported = if state.phase.is_terminal() {
            state.phase
        } else if state.canceled {
            UploadState::Cancelled
        } else if state.paused {
            UploadState::Paused
        } else {
            state.phase
        };
        UploadStatus {
            upload_id: self.id.clone(),
            bucket: self.bucket.clone(),
            object: self.object.clone(),
            state: reported,
            is_paused: state.paused,
            is_canceled: state.canceled,
            current_part: state.current_part,
            completed_count: state.completed.len(),
            total_parts: state.total_parts,
            last_error: state.last_error.clone(),
            etag: state.etag.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct FinishedTable {
    order: VecDeque<String>,
    statuses: HashMap<String, UploadStatus>,
}

/// All live upload tasks, plus a bounded record of recently finished ones.
#[derive(Debug)]
pub struct TaskRegistry {
    live: RwLock<HashMap<String, Arc<UploadTask>>>,
    finished: Mutex<FinishedTable>,
    retention: usize,
}

impl TaskRegistry {
    pub fn new(retention: usize) -> Self {
        Self {
            live: RwLock::new(HashMap::new()),
            finished: Mutex::new(FinishedTable::default()),
            retention,
        }
    }

    /// Registers a task.
    ///
    /// Fails when the id is taken or another live task already targets the
    /// same `bucket/object`.
    pub fn create(&self, task: Arc<UploadTask>) -> Result<(), UploadError> {
        let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
        if live.contains_key(task.id()) {
            return Err(UploadError::AlreadyExists(task.id().to_string()));
        }
        if let Some(other) = live
            .values()
            .find(|t| t.bucket() == task.bucket() && t.object() == task.object())
        {
            return Err(UploadError::AlreadyExists(format!(
                "{}/{} is already being uploaded as {}",
                task.bucket(),
                task.object(),
                other.id()
            )));
        }
        self.finished_table().forget(task.id());
        live.insert(task.id().to_string(), task);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<UploadTask>, UploadError> {
        self.live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| UploadError::NotFound(id.to_string()))
    }

    pub fn set_paused(&self, id: &str, paused: bool) -> Result<(), UploadError> {
        self.get(id)?.set_paused(paused);
        Ok(())
    }

    pub fn set_canceled(&self, id: &str) -> Result<(), UploadError> {
        self.get(id)?.cancel();
        Ok(())
    }

    /// Drops every trace of `id`, live or finished.
    pub fn remove(&self, id: &str) -> Option<Arc<UploadTask>> {
        self.finished_table().forget(id);
        self.live
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Forgets the retained status of a finished task. Returns whether one
    /// was held.
    pub fn forget_finished(&self, id: &str) -> bool {
        self.finished_table().forget(id)
    }

    /// Moves a task from the live map into the finished table.
    pub fn retire(&self, id: &str) {
        let task = self
            .live
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        let Some(task) = task else {
            return;
        };
        if self.retention == 0 {
            return;
        }
        let mut finished = self.finished_table();
        finished.forget(id);
        finished.order.push_back(id.to_string());
        finished.statuses.insert(id.to_string(), task.snapshot());
        while finished.order.len() > self.retention {
            if let Some(oldest) = finished.order.pop_front() {
                finished.statuses.remove(&oldest);
            }
        }
    }

    /// Current status of a live task, or the final status of a finished one.
    pub fn snapshot(&self, id: &str) -> Result<UploadStatus, UploadError> {
        if let Ok(task) = self.get(id) {
            return Ok(task.snapshot());
        }
        self.finished_table()
            .statuses
            .get(id)
            .cloned()
            .ok_or_else(|| UploadError::NotFound(id.to_string()))
    }

    /// Snapshots of every live task.
    pub fn live(&self) -> Vec<UploadStatus> {
        let live = self.live.read().unwrap_or_else(PoisonError::into_inner);
        live.values().map(|t| t.snapshot()).collect()
    }

    fn finished_table(&self) -> MutexGuard<'_, FinishedTable> {
        self.finished.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FinishedTable {
    fn forget(&mut self, id: &str) -> bool {
        let held = self.statuses.remove(id).is_some();
        if held {
            self.order.retain(|o| o != id);
        }
        held
    }
}
