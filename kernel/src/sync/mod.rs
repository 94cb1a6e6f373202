//! Synchronization primitives.
//!
//! The two spinlock types are the foundation; everything else blocks by
//! parking the calling thread on a [`WaitQueue`] and rescheduling. Interrupt
//! handlers may only use [`IrqSpinLock`]; the blocking primitives are for
//! thread context exclusively.

pub mod condvar;
pub mod mutex;
pub mod once_lock;
pub mod rwlock;
pub mod semaphore;
pub mod spinlock;
pub mod wait_queue;
pub mod workqueue;

pub use condvar::CondVar;
pub use mutex::{KMutex, MutexKind};
pub use once_lock::OnceLock;
pub use rwlock::{RwLock, RwPreference};
pub use semaphore::Semaphore;
pub use spinlock::{IrqSpinLock, IrqSpinLockGuard, SpinLock, SpinLockGuard};
pub use wait_queue::{TimedWait, WaitQueue};
pub use workqueue::WorkQueue;
