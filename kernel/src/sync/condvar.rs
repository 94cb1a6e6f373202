//! Condition variable.
//!
//! Used with a [`KMutex`]: `wait` atomically parks the caller and releases
//! the mutex, then re-acquires it before returning. A signal with no waiters
//! is dropped -- there is no memory -- and spurious wake-ups are permitted,
//! so callers always re-check their predicate in a loop.
//!
//! Timed waits go through the scheduler's sleep queue; when the deadline and
//! a signal race, whichever side removes the waiter's queue entry first
//! wins, and "already removed" reads as "signaled".

use core::sync::atomic::{AtomicU64, Ordering};

use crate::{error::KernelResult, sched, timer};

use super::{wait_queue::TimedWait, KMutex, WaitQueue};

/// A condition variable.
pub struct CondVar {
    waiters: WaitQueue,
    /// Total signals issued; diagnostics only.
    signal_count: AtomicU64,
}

impl CondVar {
    pub const fn new() -> Self {
        Self {
            waiters: WaitQueue::new(),
            signal_count: AtomicU64::new(0),
        }
    }

    /// Release `mutex`, park until signaled, re-acquire `mutex`.
    ///
    /// The caller must hold `mutex`. Returns with the mutex held again.
    pub fn wait(&self, mutex: &KMutex) -> KernelResult<()> {
        if sched::current_tid().is_none() {
            // No scheduler: nothing can signal us either; waiting would hang
            // boot. Treat as a spurious wake-up.
            return Ok(());
        }

        // block_current marks us blocked and enqueues *before* the mutex is
        // released, so a signaler that grabs the mutex right after our
        // unlock already finds us on the queue: no lost wake-up.
        // It cannot run until we reschedule in block_current.
        self.waiters.block_current_with(|| mutex.unlock().map(|_| ()))?;

        mutex.lock()
    }

    /// Like [`wait`](CondVar::wait) with a deadline in milliseconds.
    ///
    /// Returns `Ok(true)` if signaled, `Ok(false)` on timeout; the mutex is
    /// re-acquired in both cases.
    pub fn timed_wait(&self, mutex: &KMutex, ms: u64) -> KernelResult<bool> {
        if sched::current_tid().is_none() {
            return Ok(false);
        }
        let deadline = timer::ticks() + timer::ms_to_ticks(ms);

        let outcome = self
            .waiters
            .block_current_timed_with(deadline, || mutex.unlock().map(|_| ()))?;

        mutex.lock()?;
        Ok(outcome == TimedWait::Signaled)
    }

    /// Wake one waiter. Dropped if nobody waits.
    pub fn signal(&self) {
        self.signal_count.fetch_add(1, Ordering::Relaxed);
        self.waiters.wake_one();
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        self.signal_count.fetch_add(1, Ordering::Relaxed);
        self.waiters.wake_all();
    }

    /// Number of parked waiters.
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Total signals/broadcasts issued since creation.
    pub fn signal_count(&self) -> u64 {
        self.signal_count.load(Ordering::Relaxed)
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::MutexKind;

    #[test]
    fn signal_with_no_waiters_is_dropped() {
        let cv = CondVar::new();
        cv.signal();
        cv.broadcast();
        assert_eq!(cv.waiter_count(), 0);
        assert_eq!(cv.signal_count(), 2);
    }

    #[test]
    fn wait_without_scheduler_returns_with_mutex_held() {
        let cv = CondVar::new();
        let m = KMutex::new(MutexKind::Normal);
        m.lock().unwrap();
        cv.wait(&m).unwrap();
        // Spurious wake-up semantics: mutex is held again on return.
        assert_eq!(m.owner(), Some(0));
        m.unlock().unwrap();
    }

    #[test]
    fn timed_wait_without_scheduler_reports_timeout() {
        let cv = CondVar::new();
        let m = KMutex::new(MutexKind::Normal);
        m.lock().unwrap();
        assert_eq!(cv.timed_wait(&m, 5).unwrap(), false);
        m.unlock().unwrap();
    }
}
