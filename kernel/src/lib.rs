//! Ferrite Kernel Library
//!
//! Core of a small monolithic x86-64 kernel booted by a Limine-class loader:
//! physical frame allocation, four-level paging, interrupt dispatch, a
//! preemptive thread scheduler with blocking synchronization primitives, and
//! an Ethernet/ARP/IPv4/ICMP/UDP receive path.
//!
//! The library builds for the bare-metal target and for the host, where the
//! pure parts (allocator bitmap, queues, wire formats, sync state machines)
//! run under the standard test harness.

#![no_std]
#![cfg_attr(
    all(target_arch = "x86_64", target_os = "none"),
    feature(abi_x86_interrupt)
)]

extern crate alloc;

// On the bare-metal target the kernel heap is a linked-list allocator fed
// with contiguous frames from the PMM. On the host (unit tests), delegate to
// the system allocator so test code using Vec/String runs unmodified.
#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Get a reference to the global kernel heap allocator.
#[cfg(target_os = "none")]
pub fn get_allocator() -> &'static LockedHeap {
    &ALLOCATOR
}

#[macro_use]
pub mod print;

pub mod arch;
pub mod boot;
pub mod error;
pub mod irq;
pub mod log_service;
pub mod mm;
pub mod net;
pub mod sched;
pub mod sync;
pub mod timer;

// Re-export memory management types used across subsystem boundaries.
pub use mm::{PhysicalAddress, VirtualAddress, FRAME_SIZE};
// Re-export scheduler items for tests and drivers.
pub use sched::{Priority, ThreadId, ThreadState};

