//! Write-behind shards.
//!
//! Each shard pairs a two-level FIFO queue with one worker thread that owns
//! the shard's [`ShardStore`]. Callers push work items and return at once;
//! the worker drains high priority items (loads, inserts) before low
//! priority ones (deletes), and signals `work_done` whenever it runs dry.
//!
//! Worker states:
//!
//! ```text
//! NotReady ──► Idle ◄──► Working
//!               │
//!               └──► Finished   (terminate requested and queues empty)
//! ```

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender};
use fhmap_config::{
    log_shard_debug, log_shard_error, log_shard_info, log_shard_warn,
};

use crate::index::HandleIndex;
use crate::pool::{Pool, Pooled, Recycle};
use crate::store::ShardStore;
use crate::{Digest, MapError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    NotReady,
    Idle,
    Working,
    Finished,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::NotReady => "not-ready",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Working => "working",
            WorkerStatus::Finished => "finished",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Reload every stored row into the index
    Load,
    Insert,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Low,
}

impl OpKind {
    pub fn priority(self) -> Priority {
        match self {
            OpKind::Load | OpKind::Insert => Priority::High,
            OpKind::Delete => Priority::Low,
        }
    }
}

/// One unit of store work. Reused through the shard's op pool.
#[derive(Debug)]
pub struct WorkItem {
    kind: OpKind,
    digest: Digest,
    handle: Vec<u8>,
}

impl WorkItem {
    pub fn set_load(&mut self) {
        self.kind = OpKind::Load;
        self.handle.clear();
    }

    pub fn set_insert(&mut self, digest: Digest, handle: &[u8]) {
        self.kind = OpKind::Insert;
        self.digest = digest;
        self.handle.clear();
        self.handle.extend_from_slice(handle);
    }

    pub fn set_delete(&mut self, digest: Digest) {
        self.kind = OpKind::Delete;
        self.digest = digest;
        self.handle.clear();
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

impl Recycle for WorkItem {
    fn fresh() -> Self {
        Self {
            kind: OpKind::Load,
            digest: Digest::default(),
            handle: Vec::new(),
        }
    }

    fn recycle(&mut self) {
        self.handle.clear();
    }
}

pub type Op = Pooled<WorkItem>;

struct QueueState {
    high: VecDeque<Op>,
    low: VecDeque<Op>,
    status: WorkerStatus,
    terminate: bool,
}

impl QueueState {
    fn pending(&self) -> usize {
        self.high.len() + self.low.len()
    }
}

/// Queue shared between callers and one worker.
struct ShardQueue {
    state: Mutex<QueueState>,
    work_avail: Condvar,
    work_done: Condvar,
}

impl ShardQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                high: VecDeque::new(),
                low: VecDeque::new(),
                status: WorkerStatus::NotReady,
                terminate: false,
            }),
            work_avail: Condvar::new(),
            work_done: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, op: Op) {
        let mut state = self.lock();
        match op.kind().priority() {
            Priority::High => state.high.push_back(op),
            Priority::Low => state.low.push_back(op),
        }
        self.work_avail.notify_one();
    }

    /// Block until an item is available. `None` once terminate is set and
    /// both queues are empty.
    fn next(&self) -> Option<Op> {
        let mut state = self.lock();
        loop {
            let op = match state.high.pop_front() {
                Some(op) => Some(op),
                None => state.low.pop_front(),
            };
            if let Some(op) = op {
                state.status = WorkerStatus::Working;
                return Some(op);
            }

            state.status = WorkerStatus::Idle;
            self.work_done.notify_all();

            if state.terminate {
                return None;
            }
            state = self
                .work_avail
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn wait_idle(&self) {
        let mut state = self.lock();
        while state.status != WorkerStatus::Finished
            && (state.pending() > 0 || state.status == WorkerStatus::Working)
        {
            state = self
                .work_done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn set_status(&self, status: WorkerStatus) {
        let mut state = self.lock();
        state.status = status;
        self.work_done.notify_all();
    }

    fn request_stop(&self) {
        let mut state = self.lock();
        state.terminate = true;
        self.work_avail.notify_all();
    }
}

/// Marks the worker finished however its thread exits.
struct FinishGuard(Arc<ShardQueue>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.set_status(WorkerStatus::Finished);
    }
}

/// Parameters a shard worker needs to open and serve its store.
#[derive(Debug, Clone)]
pub struct ShardOptions {
    pub storage_directory: PathBuf,
    pub map_size: usize,
    pub max_handle_size: usize,
    pub op_prealloc: usize,
    pub max_pending_ops: usize,
}

/// Caller side of a shard.
pub struct Shard {
    index: usize,
    queue: Arc<ShardQueue>,
    ops: Arc<Pool<WorkItem>>,
    worker: Option<JoinHandle<()>>,
}

impl Shard {
    /// Start the worker for shard `index`.
    ///
    /// The worker opens its store on its own thread and reports the outcome
    /// on the returned channel; nothing may be queued before that report
    /// is `Ok`.
    pub fn spawn(
        index: usize,
        options: &ShardOptions,
        target: Arc<HandleIndex>,
    ) -> Result<(Self, Receiver<Result<()>>)> {
        let queue = Arc::new(ShardQueue::new());
        let ops = Arc::new(Pool::new(
            options.op_prealloc,
            options.op_prealloc,
            Some(options.max_pending_ops),
        ));
        let (ready_tx, ready_rx) = bounded(1);

        let worker_queue = Arc::clone(&queue);
        let dir = options.storage_directory.clone();
        let map_size = options.map_size;
        let max_handle_size = options.max_handle_size;

        let handle = thread::Builder::new()
            .name(format!("fhmap-shard-{}", index))
            .spawn(move || {
                worker_main(
                    index,
                    &dir,
                    map_size,
                    max_handle_size,
                    worker_queue,
                    target,
                    ready_tx,
                )
            })
            .map_err(|e| MapError::system(format!("spawn worker for shard {}", index), e))?;

        Ok((
            Self {
                index,
                queue,
                ops,
                worker: Some(handle),
            },
            ready_rx,
        ))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Check out a blank work item. Fails when `max_pending_ops` items are
    /// already in flight for this shard.
    pub fn reserve(&self) -> Result<Op> {
        self.ops.checkout().ok_or_else(|| {
            MapError::Internal(format!(
                "shard {} has too many pending operations",
                self.index
            ))
        })
    }

    pub fn enqueue(&self, op: Op) {
        self.queue.push(op);
    }

    pub fn submit_load(&self) -> Result<()> {
        let mut op = self.reserve()?;
        op.set_load();
        self.enqueue(op);
        Ok(())
    }

    /// Block until the queues are empty and the worker is not mid-item.
    pub fn wait_idle(&self) {
        self.queue.wait_idle();
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().pending()
    }

    pub fn status(&self) -> WorkerStatus {
        self.queue.lock().status
    }

    pub fn ops_outstanding(&self) -> usize {
        self.ops.outstanding()
    }

    /// Ask the worker to finish its queues and exit, then join it.
    pub fn stop(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        self.queue.request_stop();
        if handle.join().is_err() {
            log_shard_error!("Worker thread panicked", shard = self.index);
        }
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_main(
    index: usize,
    dir: &Path,
    map_size: usize,
    max_handle_size: usize,
    queue: Arc<ShardQueue>,
    target: Arc<HandleIndex>,
    ready: Sender<Result<()>>,
) {
    let _finish = FinishGuard(Arc::clone(&queue));

    let store = match ShardStore::open(dir, index, map_size) {
        Ok(store) => store,
        Err(e) => {
            log_shard_error!(
                "Cannot open store",
                shard = index,
                error = tracing::field::display(&e)
            );
            let _ = ready.send(Err(e));
            return;
        }
    };

    queue.set_status(WorkerStatus::Idle);
    let _ = ready.send(Ok(()));
    log_shard_debug!("Worker ready", shard = index);

    let worker = Worker {
        index,
        store,
        target,
        max_handle_size,
    };
    while let Some(op) = queue.next() {
        worker.execute(&op);
    }

    log_shard_debug!("Worker exiting", shard = index);
}

struct Worker {
    index: usize,
    store: ShardStore,
    target: Arc<HandleIndex>,
    max_handle_size: usize,
}

impl Worker {
    fn execute(&self, op: &WorkItem) {
        match op.kind {
            OpKind::Load => self.load(),
            OpKind::Insert => {
                if let Err(e) = self.store.insert_handle(&op.digest, &op.handle) {
                    log_shard_error!(
                        "Insert failed",
                        shard = self.index,
                        digest = tracing::field::display(&op.digest),
                        error = tracing::field::display(&e)
                    );
                }
            }
            OpKind::Delete => match self.store.delete(&op.digest) {
                Ok(true) => {}
                Ok(false) => log_shard_debug!(
                    "Delete of absent row",
                    shard = self.index,
                    digest = tracing::field::display(&op.digest)
                ),
                Err(e) => log_shard_error!(
                    "Delete failed",
                    shard = self.index,
                    digest = tracing::field::display(&op.digest),
                    error = tracing::field::display(&e)
                ),
            },
        }
    }

    fn load(&self) {
        let start = Instant::now();
        let mut loaded = 0u64;
        let mut duplicates = 0u64;

        let result = self.store.load_all(self.max_handle_size, |digest, handle| {
            if self.target.insert_if_absent(digest, handle) {
                loaded += 1;
            } else {
                duplicates += 1;
                log_shard_warn!(
                    "Stored row shadowed by an existing entry",
                    shard = self.index,
                    digest = tracing::field::display(&digest)
                );
            }
        });

        match result {
            Ok(stats) => log_shard_info!(
                "Reloaded entries",
                shard = self.index,
                entries = loaded,
                skipped = stats.skipped + duplicates,
                elapsed_ms = start.elapsed().as_millis() as u64
            ),
            Err(e) => log_shard_error!(
                "Reload failed",
                shard = self.index,
                entries = loaded,
                error = tracing::field::display(&e)
            ),
        }
    }
}
