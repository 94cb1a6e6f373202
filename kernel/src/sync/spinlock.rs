//! Spinlocks.
//!
//! Two distinct types with identical locking discipline but different
//! interrupt behavior:
//!
//! - [`SpinLock`] is a plain test-and-set lock for state touched only from
//!   thread context (e.g. the MMIO registry during driver probe).
//! - [`IrqSpinLock`] additionally saves the interrupt-enable flag and
//!   disables interrupts for the duration of the guard. It is the only lock
//!   an interrupt handler may take; any state shared with IRQ context (ready
//!   queues, ARP cache, frame bitmap, console) must use it, or a handler
//!   arriving mid-critical-section deadlocks the single CPU.
//!
//! Making these separate types keeps the rule checkable: code running in IRQ
//! context simply has no way to name a sleeping primitive or a plain
//! spinlock around shared state.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

use crate::arch;

/// A plain spinlock protecting data of type `T`. Thread context only.
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: The lock serializes all access to the inner data; T only needs to
// be Send for the protected value to move between threads.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

/// RAII guard for a held [`SpinLock`].
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, spinning with a pause hint until available.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        SpinLockGuard { lock: self }
    }

    /// Try to acquire without spinning.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// An IRQ-safe spinlock protecting data of type `T`.
///
/// Saves the interrupt-enable state and disables interrupts before spinning;
/// the guard restores the saved state on drop, after releasing the lock, so
/// nested guards compose (inner guards save-and-restore "disabled").
pub struct IrqSpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: As for SpinLock; interrupt masking adds no aliasing concerns.
unsafe impl<T: Send> Sync for IrqSpinLock<T> {}
unsafe impl<T: Send> Send for IrqSpinLock<T> {}

/// RAII guard for a held [`IrqSpinLock`].
pub struct IrqSpinLockGuard<'a, T> {
    lock: &'a IrqSpinLock<T>,
    irq_was_enabled: bool,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock with interrupts disabled.
    ///
    /// Interrupts are turned off before the first acquisition attempt: a
    /// timer or device IRQ taking this same lock while we hold it would spin
    /// forever on a single CPU.
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let irq_was_enabled = arch::irq_save();

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        IrqSpinLockGuard {
            lock: self,
            irq_was_enabled,
        }
    }

    /// Try to acquire without spinning; restores interrupt state on failure.
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let irq_was_enabled = arch::irq_save();

        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqSpinLockGuard {
                lock: self,
                irq_was_enabled,
            })
        } else {
            arch::irq_restore(irq_was_enabled);
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        // Restore interrupt state only after the lock is released.
        arch::irq_restore(self.irq_was_enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spinlock_basic() {
        let lock = SpinLock::new(5u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn spinlock_try_lock_fails_when_held() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn irq_spinlock_basic() {
        let lock = IrqSpinLock::new(alloc::vec::Vec::<u8>::new());
        lock.lock().push(1);
        lock.lock().push(2);
        assert_eq!(&*lock.lock(), &[1, 2]);
    }

    #[test]
    fn irq_spinlock_is_released_on_drop() {
        let lock = IrqSpinLock::new(0u8);
        drop(lock.lock());
        assert!(!lock.is_locked());
        let g = lock.lock();
        assert!(lock.is_locked());
        drop(g);
    }
}
