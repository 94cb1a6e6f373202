//! Blocking mutex with priority inheritance.
//!
//! A raw lock/unlock mutex (no guard-wrapped data: the kernel's users hold
//! it across arbitrary code paths), with three flavors mirroring the POSIX
//! kinds: normal, recursive, and error-checking. Contended acquisition
//! blocks the caller on a wait queue; while it waits, the owner inherits the
//! waiter's effective priority so a low-priority holder cannot starve a
//! high-priority waiter behind a middle-priority spinner.
//!
//! Inheritance boosts the *immediate* owner only; it does not follow chains
//! of threads blocked on further mutexes.

use crate::{
    error::{KernelError, KernelResult},
    sched::{self, Priority, Thread, ThreadId},
};

use alloc::sync::Arc;

use super::{IrqSpinLock, WaitQueue};

/// Mutex behavior on re-acquisition by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutexKind {
    /// Self-deadlock on re-lock (documented; matches the classic semantics).
    #[default]
    Normal,
    /// Re-lock increments a recursion count; as many unlocks are required.
    Recursive,
    /// Re-lock fails with `WouldDeadlock`.
    ErrorCheck,
}

struct MutexState {
    owner: Option<ThreadId>,
    recursion: u32,
    /// Set while the owner runs with an inherited priority; cleared (and the
    /// owner's base restored) on release.
    owner_boosted: bool,
}

/// A blocking kernel mutex.
pub struct KMutex {
    kind: MutexKind,
    state: IrqSpinLock<MutexState>,
    waiters: WaitQueue,
}

impl KMutex {
    pub const fn new(kind: MutexKind) -> Self {
        Self {
            kind,
            state: IrqSpinLock::new(MutexState {
                owner: None,
                recursion: 0,
                owner_boosted: false,
            }),
            waiters: WaitQueue::new(),
        }
    }

    /// Acquire the mutex, blocking while another thread owns it.
    pub fn lock(&self) -> KernelResult<()> {
        // Before the scheduler runs, callers share one identity and there is
        // nothing to block; contention then spins (and cannot occur anyway
        // with interrupts still disabled at boot).
        let me = sched::current_tid().unwrap_or(0);

        loop {
            {
                let mut state = self.state.lock();
                match state.owner {
                    None => {
                        state.owner = Some(me);
                        state.recursion = 1;
                        return Ok(());
                    }
                    Some(owner) if owner == me => match self.kind {
                        MutexKind::Recursive => {
                            state.recursion += 1;
                            return Ok(());
                        }
                        MutexKind::ErrorCheck => return Err(KernelError::WouldDeadlock),
                        // Normal: fall through and block on ourselves.
                        MutexKind::Normal => {}
                    },
                    Some(_) => {}
                }

                // Contended: lend the owner our priority before parking.
                if let Some(owner) = state.owner {
                    if let Some(waiter) = current_thread() {
                        if apply_inheritance_needed(owner, &waiter) {
                            state.owner_boosted = true;
                        }
                    }
                }
            }

            if sched::current_tid().is_some() {
                self.waiters.block_current();
            } else {
                core::hint::spin_loop();
            }
        }
    }

    /// Try to acquire without blocking.
    pub fn try_lock(&self) -> KernelResult<()> {
        let me = sched::current_tid().unwrap_or(0);
        let mut state = self.state.lock();
        match state.owner {
            None => {
                state.owner = Some(me);
                state.recursion = 1;
                Ok(())
            }
            Some(owner) if owner == me && self.kind == MutexKind::Recursive => {
                state.recursion += 1;
                Ok(())
            }
            Some(owner) if owner == me && self.kind == MutexKind::ErrorCheck => {
                Err(KernelError::WouldDeadlock)
            }
            Some(_) => Err(KernelError::WouldBlock),
        }
    }

    /// Release the mutex. Fails with `NotOwner` from any other thread.
    pub fn unlock(&self) -> KernelResult<()> {
        let me = sched::current_tid().unwrap_or(0);

        let boosted = {
            let mut state = self.state.lock();
            if state.owner != Some(me) {
                return Err(KernelError::NotOwner);
            }
            if self.kind == MutexKind::Recursive && state.recursion > 1 {
                state.recursion -= 1;
                return Ok(());
            }
            state.owner = None;
            state.recursion = 0;
            core::mem::take(&mut state.owner_boosted)
        };

        if boosted {
            sched::scheduler::restore_thread_priority(me);
        }

        // Pop one waiter into the ready queue. No hand-off: it competes at
        // the next scheduling point.
        self.waiters.wake_one();
        Ok(())
    }

    /// The current owner, if any.
    pub fn owner(&self) -> Option<ThreadId> {
        self.state.lock().owner
    }

    /// Current recursion depth (0 when unowned).
    pub fn recursion(&self) -> u32 {
        self.state.lock().recursion
    }
}

impl Default for KMutex {
    fn default() -> Self {
        Self::new(MutexKind::Normal)
    }
}

fn current_thread() -> Option<Arc<Thread>> {
    sched::current_tid().and_then(sched::scheduler::lookup)
}

/// Boost `owner` to the waiter's effective priority if the waiter outranks
/// it. Returns whether a boost was applied.
fn apply_inheritance_needed(owner: ThreadId, waiter: &Arc<Thread>) -> bool {
    let waiter_priority = waiter.effective_priority();
    let Some(owner_thread) = sched::scheduler::lookup(owner) else {
        return false;
    };
    if waiter_priority.is_above(owner_thread.effective_priority()) {
        sched::scheduler::boost_thread_priority(owner, waiter_priority);
        true
    } else {
        false
    }
}

/// Standalone inheritance rule, shared with tests: what the owner's
/// effective priority must become when a waiter of `waiter_priority` blocks.
pub(crate) fn inherited_priority(owner_effective: Priority, waiter_priority: Priority) -> Priority {
    if waiter_priority.is_above(owner_effective) {
        waiter_priority
    } else {
        owner_effective
    }
}
