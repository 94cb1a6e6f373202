//! Work queues.
//!
//! A pool owns a FIFO of work items and a fixed set of worker threads. A
//! counting semaphore mirrors the item count, so workers sleep when the
//! queue is empty and wake one-per-item. Shutdown raises a flag, posts the
//! semaphore once per worker so each one observes the flag, then joins them
//! with a timeout.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::{collections::VecDeque, sync::Arc, vec::Vec};

use crate::{
    error::{KernelError, KernelResult},
    sched::{self, Priority, ThreadId},
};

use super::{IrqSpinLock, Semaphore, SpinLock};

/// How long shutdown waits for each worker before giving up on it.
const SHUTDOWN_JOIN_MS: u64 = 1000;

/// One unit of deferred work: a function pointer and an opaque argument.
/// Owned by the queue until a worker takes and runs it.
#[derive(Debug, Clone, Copy)]
pub struct WorkItem {
    pub func: fn(usize),
    pub arg: usize,
}

/// A worker pool with a shared FIFO.
pub struct WorkQueue {
    name: &'static str,
    items: IrqSpinLock<VecDeque<WorkItem>>,
    /// Counts queued items; workers park on it.
    available: Semaphore,
    shutting_down: AtomicBool,
    workers: SpinLock<Vec<ThreadId>>,
}

impl WorkQueue {
    /// Create the pool and spawn `worker_count` worker threads.
    pub fn new(name: &'static str, worker_count: usize) -> KernelResult<Arc<WorkQueue>> {
        if worker_count == 0 {
            return Err(KernelError::InvalidArgument {
                name: "worker_count",
                value: "zero",
            });
        }

        let queue = Arc::new(Self {
            name,
            items: IrqSpinLock::new(VecDeque::new()),
            available: Semaphore::new(0, 0),
            shutting_down: AtomicBool::new(false),
            workers: SpinLock::new(Vec::new()),
        });

        for _ in 0..worker_count {
            // The worker borrows the pool through a raw Arc; worker_main
            // turns it back into a real Arc and owns that clone until exit.
            let arg = Arc::into_raw(queue.clone()) as usize;
            let tid = sched::spawn(
                name,
                worker_main,
                arg,
                sched::DEFAULT_STACK_SIZE,
                Priority::Normal,
            )?;
            queue.workers.lock().push(tid);
        }

        log::info!(target: "sync", "work queue '{}' with {} workers", name, worker_count);
        Ok(queue)
    }

    /// Enqueue a work item. Fails once shutdown has begun.
    pub fn submit(&self, func: fn(usize), arg: usize) -> KernelResult<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(KernelError::ShuttingDown);
        }
        self.items.lock().push_back(WorkItem { func, arg });
        self.available.post()
    }

    /// Stop the pool: every worker drains what it can, observes the flag,
    /// and exits; each is joined with a timeout.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let workers: Vec<ThreadId> = core::mem::take(&mut *self.workers.lock());

        // One post per worker unblocks them all to see the flag.
        for _ in &workers {
            self.available.post().ok();
        }
        for tid in workers {
            if sched::join_timeout(tid, SHUTDOWN_JOIN_MS).is_err() {
                log::warn!(target: "sync", "work queue '{}': worker {} did not exit", self.name, tid);
            }
        }
        log::info!(target: "sync", "work queue '{}' shut down", self.name);
    }

    /// Items currently queued (racy snapshot).
    pub fn pending(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn take_item(&self) -> Option<WorkItem> {
        self.items.lock().pop_front()
    }
}

/// Worker loop: wait for availability, re-check the shutdown flag on every
/// iteration, run one item.
fn worker_main(arg: usize) {
    // SAFETY: `arg` is the raw Arc produced by Arc::into_raw in
    // WorkQueue::new for exactly this worker; reconstructing it transfers
    // that reference count to us.
    let queue: Arc<WorkQueue> = unsafe { Arc::from_raw(arg as *const WorkQueue) };

    loop {
        queue.available.wait();
        if queue.is_shutting_down() {
            break;
        }
        if let Some(item) = queue.take_item() {
            (item.func)(item.arg);
        }
    }
}
