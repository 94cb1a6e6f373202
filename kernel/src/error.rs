//! Kernel error types
//!
//! A single structured error enum shared by every subsystem. Variants carry
//! enough context to log a useful message without allocating.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-related errors
    OutOfMemory {
        requested_frames: usize,
    },
    InvalidAddress {
        addr: u64,
    },
    UnmappedMemory {
        addr: u64,
    },
    AlreadyMapped {
        addr: u64,
    },
    /// MMIO range overlaps an existing registration with different bounds
    MmioOverlap {
        phys: u64,
        len: usize,
    },

    /// Thread-related errors
    ThreadNotFound {
        tid: u64,
    },
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// Synchronization errors
    WouldDeadlock,
    NotOwner,
    UpgradeDenied,
    Timeout {
        operation: &'static str,
    },

    /// Queue/pool errors
    QueueFull {
        resource: &'static str,
    },
    ShuttingDown,
    ResourceExhausted {
        resource: &'static str,
    },

    /// Network errors
    PacketRejected {
        reason: &'static str,
    },

    /// Generic errors
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    AlreadyExists {
        resource: &'static str,
        id: u64,
    },
    NotFound {
        resource: &'static str,
        id: u64,
    },
    NotInitialized {
        subsystem: &'static str,
    },
    WouldBlock,
    Unsupported {
        feature: &'static str,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory { requested_frames } => {
                write!(f, "out of memory ({} frames requested)", requested_frames)
            }
            KernelError::InvalidAddress { addr } => write!(f, "invalid address {:#x}", addr),
            KernelError::UnmappedMemory { addr } => write!(f, "unmapped memory at {:#x}", addr),
            KernelError::AlreadyMapped { addr } => write!(f, "already mapped at {:#x}", addr),
            KernelError::MmioOverlap { phys, len } => {
                write!(f, "mmio overlap at {:#x} (+{:#x})", phys, len)
            }
            KernelError::ThreadNotFound { tid } => write!(f, "no such thread {}", tid),
            KernelError::InvalidState { expected, actual } => {
                write!(f, "invalid state: expected {}, got {}", expected, actual)
            }
            KernelError::WouldDeadlock => write!(f, "operation would deadlock"),
            KernelError::NotOwner => write!(f, "caller does not own the lock"),
            KernelError::UpgradeDenied => write!(f, "rwlock upgrade denied"),
            KernelError::Timeout { operation } => write!(f, "{} timed out", operation),
            KernelError::QueueFull { resource } => write!(f, "{} queue full", resource),
            KernelError::ShuttingDown => write!(f, "pool is shutting down"),
            KernelError::ResourceExhausted { resource } => write!(f, "{} exhausted", resource),
            KernelError::PacketRejected { reason } => write!(f, "packet rejected: {}", reason),
            KernelError::InvalidArgument { name, value } => {
                write!(f, "invalid argument {}={}", name, value)
            }
            KernelError::AlreadyExists { resource, id } => {
                write!(f, "{} {} already exists", resource, id)
            }
            KernelError::NotFound { resource, id } => write!(f, "{} {} not found", resource, id),
            KernelError::NotInitialized { subsystem } => {
                write!(f, "{} not initialized", subsystem)
            }
            KernelError::WouldBlock => write!(f, "operation would block"),
            KernelError::Unsupported { feature } => write!(f, "{} not supported", feature),
        }
    }
}

/// Result alias used throughout the kernel
pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn display_carries_context() {
        let e = KernelError::OutOfMemory {
            requested_frames: 4,
        };
        assert_eq!(format!("{}", e), "out of memory (4 frames requested)");

        let e = KernelError::Timeout { operation: "join" };
        assert_eq!(format!("{}", e), "join timed out");
    }
}
