//! Counting semaphore.
//!
//! Classic P/V over a non-negative counter with a FIFO wait queue. A
//! non-zero `max_count` caps the counter and makes over-posting an error;
//! zero means unlimited.

use crate::{
    error::{KernelError, KernelResult},
    sched, timer,
};

use super::{wait_queue::TimedWait, IrqSpinLock, WaitQueue};

struct SemState {
    count: u32,
    max_count: u32,
}

/// A counting semaphore.
pub struct Semaphore {
    state: IrqSpinLock<SemState>,
    waiters: WaitQueue,
}

impl Semaphore {
    /// `max_count == 0` means no cap.
    pub const fn new(initial: u32, max_count: u32) -> Self {
        Self {
            state: IrqSpinLock::new(SemState {
                count: initial,
                max_count,
            }),
            waiters: WaitQueue::new(),
        }
    }

    /// P: take one unit, blocking while the count is zero.
    pub fn wait(&self) {
        loop {
            {
                let mut state = self.state.lock();
                if state.count > 0 {
                    state.count -= 1;
                    return;
                }
            }
            if sched::current_tid().is_some() {
                self.waiters.block_current();
            } else {
                core::hint::spin_loop();
            }
        }
    }

    /// P with a deadline. `Err(Timeout)` leaves the semaphore untouched and
    /// the caller removed from the wait queue.
    pub fn timed_wait(&self, ms: u64) -> KernelResult<()> {
        let deadline = timer::ticks() + timer::ms_to_ticks(ms);
        loop {
            {
                let mut state = self.state.lock();
                if state.count > 0 {
                    state.count -= 1;
                    return Ok(());
                }
            }
            if timer::ticks() >= deadline {
                return Err(KernelError::Timeout {
                    operation: "sem_wait",
                });
            }
            if sched::current_tid().is_some() {
                match self.waiters.block_current_timed(deadline) {
                    TimedWait::Signaled => {}
                    TimedWait::TimedOut => {
                        // Deadline hit while parked; one last take attempt
                        // keeps a just-posted unit from being stranded.
                        let mut state = self.state.lock();
                        if state.count > 0 {
                            state.count -= 1;
                            return Ok(());
                        }
                        return Err(KernelError::Timeout {
                            operation: "sem_wait",
                        });
                    }
                }
            } else {
                core::hint::spin_loop();
            }
        }
    }

    /// Non-blocking P.
    pub fn try_wait(&self) -> bool {
        let mut state = self.state.lock();
        if state.count > 0 {
            state.count -= 1;
            true
        } else {
            false
        }
    }

    /// V: give one unit back and wake a waiter. Fails when a cap is set and
    /// the count is already at it.
    pub fn post(&self) -> KernelResult<()> {
        {
            let mut state = self.state.lock();
            if state.max_count != 0 && state.count >= state.max_count {
                return Err(KernelError::InvalidArgument {
                    name: "semaphore",
                    value: "count at max",
                });
            }
            state.count += 1;
        }
        self.waiters.wake_one();
        Ok(())
    }

    pub fn count(&self) -> u32 {
        self.state.lock().count
    }

    /// Number of parked waiters.
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_then_wait() {
        let sem = Semaphore::new(0, 0);
        sem.post().unwrap();
        sem.post().unwrap();
        assert_eq!(sem.count(), 2);
        sem.wait();
        sem.wait();
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn try_wait_fails_at_zero() {
        let sem = Semaphore::new(1, 0);
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn max_count_rejects_overpost() {
        let sem = Semaphore::new(0, 2);
        sem.post().unwrap();
        sem.post().unwrap();
        assert!(sem.post().is_err());
        assert_eq!(sem.count(), 2);
    }

    #[test]
    fn unlimited_when_max_is_zero() {
        let sem = Semaphore::new(0, 0);
        for _ in 0..100 {
            sem.post().unwrap();
        }
        assert_eq!(sem.count(), 100);
    }

    #[test]
    fn positive_count_implies_no_waiters() {
        // Without a scheduler no thread can actually park, so the invariant
        // is checked on its observable face: takes succeed immediately while
        // the count is positive and the waiter count stays zero.
        let sem = Semaphore::new(3, 0);
        while sem.try_wait() {}
        assert_eq!(sem.count(), 0);
        assert_eq!(sem.waiter_count(), 0);
    }

    #[test]
    fn timed_wait_times_out_at_zero() {
        let sem = Semaphore::new(0, 0);
        // Host build: ticks don't advance, so the deadline of 0 ms is
        // already reached on entry.
        assert_eq!(
            sem.timed_wait(0),
            Err(KernelError::Timeout {
                operation: "sem_wait"
            })
        );
    }

    #[test]
    fn timed_wait_takes_available_unit() {
        let sem = Semaphore::new(1, 0);
        assert!(sem.timed_wait(0).is_ok());
        assert_eq!(sem.count(), 0);
    }
}
