//! Memory management.
//!
//! Owns physical frames (bitmap allocator over the boot memory map), the
//! four-level page tables of every address space, the kernel heap, and the
//! MMIO remap window. Everything above the HHDM provided by the bootloader.

pub mod address_space;
pub mod frame_allocator;
pub mod heap;
pub mod mmio;
pub mod page_fault;
pub mod page_table;

use core::sync::atomic::{AtomicU64, Ordering};

pub use frame_allocator::{FrameStats, FRAME_SIZE};

use crate::error::KernelResult;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn is_frame_aligned(&self) -> bool {
        self.0 % FRAME_SIZE as u64 == 0
    }

    /// Index of the frame containing this address.
    pub const fn frame_index(&self) -> usize {
        (self.0 / FRAME_SIZE as u64) as usize
    }

    pub const fn offset(&self, offset: u64) -> Self {
        Self(self.0 + offset)
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn as_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }

    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }

    pub const fn offset(&self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    pub const fn page_base(&self) -> Self {
        Self(self.0 & !(FRAME_SIZE as u64 - 1))
    }

    pub const fn page_offset(&self) -> u64 {
        self.0 & (FRAME_SIZE as u64 - 1)
    }
}

bitflags::bitflags! {
    /// x86-64 page table entry flags (4 KiB pages, optional 2 MiB leaves).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        /// 2 MiB leaf when set at level 2.
        const HUGE          = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

/// A region of physical memory as reported by the boot protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

/// Classification of a boot memory-map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Free for the frame allocator.
    Usable,
    /// Holds loader structures; freeable once boot data is consumed.
    BootloaderReclaimable,
    /// The kernel image and modules.
    KernelAndModules,
    /// ACPI tables.
    Acpi,
    /// The boot framebuffer aperture.
    Framebuffer,
    /// Never usable.
    Reserved,
}

/// Higher-half direct-map offset, set once during [`init`].
pub(crate) static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Offset of the higher-half direct map.
pub fn hhdm_offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Relaxed)
}

/// Translate a physical address through the HHDM.
pub fn phys_to_virt(phys: PhysicalAddress) -> VirtualAddress {
    VirtualAddress::new(phys.as_u64() + hhdm_offset())
}

/// Recover the physical address behind an HHDM pointer.
pub fn virt_to_phys_hhdm(virt: VirtualAddress) -> PhysicalAddress {
    PhysicalAddress::new(virt.as_u64() - hhdm_offset())
}

/// Initialize memory management from the boot memory map.
///
/// Order: frame allocator first (everything else allocates through it), then
/// the kernel heap, then the kernel address space adopts the boot page
/// tables. Called exactly once, with interrupts still disabled.
#[cfg(target_os = "none")]
pub fn init(memory_map: &[MemoryRegion], hhdm: u64) -> KernelResult<()> {
    HHDM_OFFSET.store(hhdm, Ordering::Relaxed);

    frame_allocator::init(memory_map, hhdm)?;
    let stats = frame_allocator::stats();
    log::info!(
        target: "pmm",
        "{} frames total, {} free ({} MiB)",
        stats.total_frames,
        stats.free_frames,
        stats.free_frames * FRAME_SIZE / (1024 * 1024)
    );

    heap::init()?;
    log::info!(target: "pmm", "kernel heap ready");

    address_space::init()?;
    log::info!(target: "vmm", "adopted boot page tables");

    Ok(())
}

#[cfg(not(target_os = "none"))]
pub fn init(_memory_map: &[MemoryRegion], hhdm: u64) -> KernelResult<()> {
    HHDM_OFFSET.store(hhdm, Ordering::Relaxed);
    Ok(())
}
