//! Write-once global cell.
//!
//! The kernel's singletons (kernel address space, boot info) are initialized
//! exactly once during boot in a fixed order and never torn down. [`OnceLock`]
//! expresses that: a checked one-time `set`, then lock-free `get` for the
//! rest of the kernel's lifetime -- safe to read from interrupt handlers.

use core::sync::atomic::{AtomicPtr, Ordering};

use alloc::boxed::Box;

/// A cell that can be written exactly once.
///
/// Like `std::sync::OnceLock`, but no_std. The value is boxed so `get` can
/// hand out a `&'static T` after a single atomic load.
pub struct OnceLock<T> {
    inner: AtomicPtr<T>,
}

impl<T> OnceLock<T> {
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Get the value if initialized.
    pub fn get(&self) -> Option<&'static T> {
        let ptr = self.inner.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: A non-null pointer was stored by `set` from
            // `Box::into_raw`, so it is valid and fully initialized (the
            // Acquire load pairs with the Release in `set`). The allocation
            // is leaked until Drop, so the 'static lifetime holds while the
            // OnceLock itself is 'static.
            Some(unsafe { &*ptr })
        }
    }

    /// Initialize the cell. Returns `Err(value)` if already initialized.
    pub fn set(&self, value: T) -> Result<(), T> {
        let ptr = Box::into_raw(Box::new(value));

        match self.inner.compare_exchange(
            core::ptr::null_mut(),
            ptr,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                // Lost the race (or a repeat call): reclaim our allocation
                // and hand the value back.
                // SAFETY: `ptr` came from Box::into_raw two lines up and was
                // never published, so we still own it exclusively.
                let boxed = unsafe { Box::from_raw(ptr) };
                Err(*boxed)
            }
        }
    }
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: Ownership of the boxed value transfers with the cell; the atomic
// pointer is the only shared state.
unsafe impl<T: Send> Send for OnceLock<T> {}
// SAFETY: `get` publishes only shared references, so T must be Sync; the
// Acquire/Release pairing guarantees readers observe a fully built value.
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}

impl<T> Drop for OnceLock<T> {
    fn drop(&mut self) {
        let ptr = self.inner.load(Ordering::Acquire);
        if !ptr.is_null() {
            // SAFETY: `&mut self` proves no other reference to the cell
            // exists, and the pointer came from Box::into_raw in `set`.
            unsafe {
                let _ = Box::from_raw(ptr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get() {
        let cell = OnceLock::new();
        assert!(cell.get().is_none());

        assert!(cell.set(42).is_ok());
        assert_eq!(*cell.get().unwrap(), 42);
    }

    #[test]
    fn second_set_returns_value() {
        let cell = OnceLock::new();
        cell.set(1).unwrap();
        assert_eq!(cell.set(2), Err(2));
        assert_eq!(*cell.get().unwrap(), 1);
    }
}
