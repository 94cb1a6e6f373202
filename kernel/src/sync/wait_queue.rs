//! Wait queues.
//!
//! A FIFO of blocked thread IDs under its own IRQ-safe lock. Every blocking
//! primitive parks threads here; wake-ups are FIFO. The lost-wakeup
//! handshake with the scheduler is: mark the thread blocked *before*
//! enqueueing it, release the queue lock, then reschedule -- a wake arriving
//! in the window simply finds a blocked, enqueued thread and readies it, and
//! the reschedule notices the thread is runnable again.

use alloc::collections::VecDeque;

use crate::sched::{self, ThreadId, ThreadState};

use super::IrqSpinLock;

/// Outcome of a timed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedWait {
    /// Another thread woke us through the queue.
    Signaled,
    /// The wake tick fired first.
    TimedOut,
}

/// A FIFO of threads waiting for an event.
pub struct WaitQueue {
    waiters: IrqSpinLock<VecDeque<ThreadId>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: IrqSpinLock::new(VecDeque::new()),
        }
    }

    /// Park the calling thread until [`wake_one`]/[`wake_all`] releases it.
    ///
    /// Spurious wake-ups are possible; callers re-check their predicate in a
    /// loop. No-op when called before the scheduler is running.
    ///
    /// [`wake_one`]: WaitQueue::wake_one
    /// [`wake_all`]: WaitQueue::wake_all
    pub fn block_current(&self) {
        let _ = self.block_current_with(|| Ok(()));
    }

    /// Like [`block_current`](WaitQueue::block_current), but runs
    /// `before_park` between enqueueing and rescheduling -- the condvar
    /// "enqueue self, then release the mutex" step. The thread is already on
    /// the queue when `before_park` runs, so a waker acting right after it
    /// cannot miss us. If `before_park` fails, the enqueue is rolled back.
    pub fn block_current_with(
        &self,
        before_park: impl FnOnce() -> crate::error::KernelResult<()>,
    ) -> crate::error::KernelResult<()> {
        let Some(tid) = sched::current_tid() else {
            return before_park();
        };
        let Some(thread) = sched::scheduler::lookup(tid) else {
            return before_park();
        };

        {
            let mut waiters = self.waiters.lock();
            thread.set_state(ThreadState::Blocked);
            thread.enters_wait_queue();
            waiters.push_back(tid);
        }

        if let Err(e) = before_park() {
            let mut waiters = self.waiters.lock();
            if remove_tid(&mut waiters, tid) {
                thread.leaves_wait_queue();
            }
            thread.set_state(ThreadState::Running);
            return Err(e);
        }

        sched::reschedule();
        Ok(())
    }

    /// Park the calling thread until woken or until the monotonic tick
    /// counter reaches `deadline_tick`.
    pub fn block_current_timed(&self, deadline_tick: u64) -> TimedWait {
        self.block_current_timed_with(deadline_tick, || Ok(()))
            .unwrap_or(TimedWait::TimedOut)
    }

    /// Timed variant of [`block_current_with`](WaitQueue::block_current_with).
    pub fn block_current_timed_with(
        &self,
        deadline_tick: u64,
        before_park: impl FnOnce() -> crate::error::KernelResult<()>,
    ) -> crate::error::KernelResult<TimedWait> {
        let Some(tid) = sched::current_tid() else {
            before_park()?;
            return Ok(TimedWait::TimedOut);
        };
        let Some(thread) = sched::scheduler::lookup(tid) else {
            before_park()?;
            return Ok(TimedWait::TimedOut);
        };

        {
            let mut waiters = self.waiters.lock();
            thread.set_state(ThreadState::Blocked);
            thread.enters_wait_queue();
            waiters.push_back(tid);
        }

        if let Err(e) = before_park() {
            let mut waiters = self.waiters.lock();
            if remove_tid(&mut waiters, tid) {
                thread.leaves_wait_queue();
            }
            thread.set_state(ThreadState::Running);
            return Err(e);
        }

        sched::scheduler::arm_timed_wake(tid, deadline_tick);
        sched::reschedule();

        // Back awake: either a waker popped us, or the tick readied us while
        // our entry still sits in the queue. Removing our own entry decides
        // which -- "already removed" means "signaled". Both paths race here,
        // so the removal happens under the queue lock.
        sched::scheduler::cancel_timed_wake(tid, deadline_tick);
        let was_still_queued = {
            let mut waiters = self.waiters.lock();
            remove_tid(&mut waiters, tid)
        };
        if was_still_queued {
            thread.leaves_wait_queue();
            Ok(TimedWait::TimedOut)
        } else {
            Ok(TimedWait::Signaled)
        }
    }

    /// Wake the thread at the head of the queue. Returns its ID.
    pub fn wake_one(&self) -> Option<ThreadId> {
        let tid = {
            let mut waiters = self.waiters.lock();
            waiters.pop_front()
        }?;
        if let Some(thread) = sched::scheduler::lookup(tid) {
            thread.leaves_wait_queue();
        }
        sched::scheduler::make_ready(tid);
        Some(tid)
    }

    /// Wake every queued thread. Returns how many were woken.
    pub fn wake_all(&self) -> usize {
        let mut woken = 0;
        while self.wake_one().is_some() {
            woken += 1;
        }
        woken
    }

    /// Remove a specific thread without waking it (timeout cancellation).
    /// Returns whether it was present.
    pub fn remove(&self, tid: ThreadId) -> bool {
        let removed = {
            let mut waiters = self.waiters.lock();
            remove_tid(&mut waiters, tid)
        };
        if removed {
            if let Some(thread) = sched::scheduler::lookup(tid) {
                thread.leaves_wait_queue();
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    /// Enqueue a thread ID directly. Test support for the host build, where
    /// no scheduler runs and `block_current` cannot park anything.
    #[cfg(test)]
    pub(crate) fn push_for_test(&self, tid: ThreadId) {
        self.waiters.lock().push_back(tid);
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_tid(waiters: &mut VecDeque<ThreadId>, tid: ThreadId) -> bool {
    if let Some(pos) = waiters.iter().position(|&t| t == tid) {
        waiters.remove(pos);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_is_preserved() {
        let q = WaitQueue::new();
        q.push_for_test(1);
        q.push_for_test(2);
        q.push_for_test(3);
        assert_eq!(q.len(), 3);

        assert_eq!(q.wake_one(), Some(1));
        assert_eq!(q.wake_one(), Some(2));
        assert_eq!(q.wake_one(), Some(3));
        assert_eq!(q.wake_one(), None);
    }

    #[test]
    fn remove_specific_waiter() {
        let q = WaitQueue::new();
        q.push_for_test(1);
        q.push_for_test(2);

        assert!(q.remove(1));
        assert!(!q.remove(1));
        assert_eq!(q.wake_one(), Some(2));
        assert!(q.is_empty());
    }

    #[test]
    fn wake_all_drains_queue() {
        let q = WaitQueue::new();
        for tid in 1..=4 {
            q.push_for_test(tid);
        }
        assert_eq!(q.wake_all(), 4);
        assert!(q.is_empty());
    }

    #[test]
    fn block_without_scheduler_is_noop() {
        let q = WaitQueue::new();
        q.block_current();
        assert!(q.is_empty());
        assert_eq!(q.block_current_timed(10), TimedWait::TimedOut);
    }
}
