//! Reader/writer lock, writer-preferring by default.
//!
//! Readers share; a writer excludes everyone. In writer-preferring mode a
//! waiting writer blocks *new* readers, so a steady reader stream cannot
//! starve writers. An upgrade is granted only to the sole reader; anything
//! else fails and the caller must release and re-acquire, accepting the
//! race.

use crate::{
    error::{KernelError, KernelResult},
    sched::{self, ThreadId},
};

use super::{IrqSpinLock, WaitQueue};

/// Which side gets priority when both are waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RwPreference {
    #[default]
    Writer,
    Reader,
}

struct RwState {
    active_readers: u32,
    writer: Option<ThreadId>,
    writer_waiters: u32,
}

/// A blocking reader/writer lock.
pub struct RwLock {
    preference: RwPreference,
    state: IrqSpinLock<RwState>,
    read_waiters: WaitQueue,
    write_waiters: WaitQueue,
}

impl RwLock {
    pub const fn new(preference: RwPreference) -> Self {
        Self {
            preference,
            state: IrqSpinLock::new(RwState {
                active_readers: 0,
                writer: None,
                writer_waiters: 0,
            }),
            read_waiters: WaitQueue::new(),
            write_waiters: WaitQueue::new(),
        }
    }

    /// Acquire shared access. Blocks while a writer is active, or -- in
    /// writer-preferring mode -- while any writer is waiting.
    pub fn read_lock(&self) {
        loop {
            {
                let mut state = self.state.lock();
                let writer_pressure =
                    self.preference == RwPreference::Writer && state.writer_waiters > 0;
                if state.writer.is_none() && !writer_pressure {
                    state.active_readers += 1;
                    return;
                }
            }
            if sched::current_tid().is_some() {
                self.read_waiters.block_current();
            } else {
                core::hint::spin_loop();
            }
        }
    }

    /// Release shared access.
    pub fn read_unlock(&self) -> KernelResult<()> {
        let wake_writer = {
            let mut state = self.state.lock();
            if state.active_readers == 0 {
                return Err(KernelError::NotOwner);
            }
            state.active_readers -= 1;
            state.active_readers == 0 && state.writer_waiters > 0
        };
        if wake_writer {
            self.write_waiters.wake_one();
        }
        Ok(())
    }

    /// Acquire exclusive access.
    pub fn write_lock(&self) {
        {
            let mut state = self.state.lock();
            state.writer_waiters += 1;
        }

        let me = sched::current_tid().unwrap_or(0);
        loop {
            {
                let mut state = self.state.lock();
                if state.writer.is_none() && state.active_readers == 0 {
                    state.writer = Some(me);
                    state.writer_waiters -= 1;
                    return;
                }
            }
            if sched::current_tid().is_some() {
                self.write_waiters.block_current();
            } else {
                core::hint::spin_loop();
            }
        }
    }

    /// Release exclusive access.
    pub fn write_unlock(&self) -> KernelResult<()> {
        let me = sched::current_tid().unwrap_or(0);
        let (wake_writer, wake_readers) = {
            let mut state = self.state.lock();
            if state.writer != Some(me) {
                return Err(KernelError::NotOwner);
            }
            state.writer = None;

            if state.writer_waiters > 0 && self.preference == RwPreference::Writer {
                (true, false)
            } else {
                // Reader-preferring (or no writer pressure): drain readers,
                // and let one writer contend too.
                (state.writer_waiters > 0, true)
            }
        };

        if wake_readers {
            self.read_waiters.wake_all();
        }
        if wake_writer {
            self.write_waiters.wake_one();
        }
        Ok(())
    }

    /// Upgrade from reader to writer without a release window.
    ///
    /// Granted only when the caller is the unique reader; otherwise fails
    /// with `UpgradeDenied` and the read lock is retained.
    pub fn try_upgrade(&self) -> KernelResult<()> {
        let me = sched::current_tid().unwrap_or(0);
        let mut state = self.state.lock();
        if state.active_readers == 1 && state.writer.is_none() {
            state.active_readers = 0;
            state.writer = Some(me);
            Ok(())
        } else {
            Err(KernelError::UpgradeDenied)
        }
    }

    /// Snapshot: (active readers, writer active, writer waiters).
    pub fn state(&self) -> (u32, bool, u32) {
        let state = self.state.lock();
        (
            state.active_readers,
            state.writer.is_some(),
            state.writer_waiters,
        )
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new(RwPreference::Writer)
    }
}
