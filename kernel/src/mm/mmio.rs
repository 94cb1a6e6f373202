//! MMIO remap pool and registry.
//!
//! Device BARs get non-cacheable virtual mappings carved out of a dedicated
//! high-kernel window by an append-only cursor. The registry tracks every
//! live mapping {phys, virt, len, label}; repeated requests for an identical
//! (phys, len) pair reuse the existing mapping, overlapping-but-different
//! requests are refused. Unmapping deletes the registry entry but never
//! recycles window space -- fragmentation is accepted, the window is large.

use alloc::vec::Vec;

use crate::{
    error::{KernelError, KernelResult},
    sync::SpinLock,
};

use super::{PageFlags, PhysicalAddress, VirtualAddress, FRAME_SIZE};

/// Base of the virtual window reserved for MMIO remaps.
pub const MMIO_WINDOW_BASE: u64 = 0xFFFF_E000_0000_0000;

/// Size of the window (64 GiB; the cursor never wraps).
pub const MMIO_WINDOW_SIZE: u64 = 64 * 1024 * 1024 * 1024;

/// One registered mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmioRegion {
    pub phys: PhysicalAddress,
    pub virt: VirtualAddress,
    pub len: usize,
    pub label: &'static str,
}

struct MmioPool {
    regions: Vec<MmioRegion>,
    /// Next free window address; append-only.
    cursor: u64,
}

impl MmioPool {
    const fn new() -> Self {
        Self {
            regions: Vec::new(),
            cursor: MMIO_WINDOW_BASE,
        }
    }

    fn find_by_phys(&self, phys: PhysicalAddress) -> Option<&MmioRegion> {
        self.regions.iter().find(|r| {
            phys.as_u64() >= r.phys.as_u64()
                && phys.as_u64() < r.phys.as_u64() + r.len as u64
        })
    }

    /// Check a candidate (phys, len) against existing registrations:
    /// identical -> reuse; overlapping -> error; disjoint -> new mapping.
    fn classify(
        &self,
        phys: PhysicalAddress,
        len: usize,
    ) -> KernelResult<Option<&MmioRegion>> {
        for region in &self.regions {
            let a0 = phys.as_u64();
            let a1 = a0 + len as u64;
            let b0 = region.phys.as_u64();
            let b1 = b0 + region.len as u64;

            if a0 == b0 && len == region.len {
                return Ok(Some(region));
            }
            if a0 < b1 && a1 > b0 {
                return Err(KernelError::MmioOverlap {
                    phys: phys.as_u64(),
                    len,
                });
            }
        }
        Ok(None)
    }

    /// Reserve window space for `page_count` pages.
    fn advance_cursor(&mut self, page_count: u64) -> KernelResult<u64> {
        let start = self.cursor;
        let bytes = page_count * FRAME_SIZE as u64;
        if start + bytes > MMIO_WINDOW_BASE + MMIO_WINDOW_SIZE {
            return Err(KernelError::ResourceExhausted {
                resource: "mmio window",
            });
        }
        self.cursor = start + bytes;
        Ok(start)
    }
}

/// Registry state. A plain (non-IRQ) spinlock: mappings are made and torn
/// down from thread context during driver probe and teardown only.
static MMIO_POOL: SpinLock<MmioPool> = SpinLock::new(MmioPool::new());

/// Map a physical MMIO range into the kernel window.
///
/// Pages are mapped present, writable, and non-cacheable. The returned
/// pointer preserves `phys`'s offset within its first page. Requesting an
/// identical (phys, len) again returns the existing mapping.
pub fn map_mmio(
    phys: PhysicalAddress,
    len: usize,
    label: &'static str,
) -> KernelResult<VirtualAddress> {
    if len == 0 {
        return Err(KernelError::InvalidArgument {
            name: "len",
            value: "zero",
        });
    }

    let page_offset = phys.as_u64() % FRAME_SIZE as u64;
    let first_page = PhysicalAddress::new(phys.as_u64() - page_offset);
    let page_count = (page_offset + len as u64).div_ceil(FRAME_SIZE as u64);

    let virt_base = {
        let mut pool = MMIO_POOL.lock();

        if let Some(existing) = pool.classify(first_page, (page_count as usize) * FRAME_SIZE)? {
            return Ok(VirtualAddress::new(existing.virt.as_u64() + page_offset));
        }

        let virt_base = pool.advance_cursor(page_count)?;
        pool.regions.push(MmioRegion {
            phys: first_page,
            virt: VirtualAddress::new(virt_base),
            len: (page_count as usize) * FRAME_SIZE,
            label,
        });
        virt_base
    };

    // Mapping happens outside the registry lock; the cursor already
    // reserved this range so nobody else can claim it.
    if let Some(kernel) = super::address_space::kernel_space() {
        for page in 0..page_count {
            kernel.map_page(
                VirtualAddress::new(virt_base + page * FRAME_SIZE as u64),
                PhysicalAddress::new(first_page.as_u64() + page * FRAME_SIZE as u64),
                PageFlags::WRITABLE | PageFlags::NO_CACHE,
            )?;
        }
    }

    log::debug!(
        target: "mmio",
        "{}: {:#x} (+{:#x}) -> {:#x}",
        label,
        phys.as_u64(),
        len,
        virt_base + page_offset,
    );
    Ok(VirtualAddress::new(virt_base + page_offset))
}

/// Unmap a range returned by [`map_mmio`] and drop its registry entry.
///
/// Window space is not reused; only the registry shrinks.
pub fn unmap_mmio(virt: VirtualAddress, len: usize) -> KernelResult<()> {
    let page_offset = virt.page_offset();
    let virt_base = virt.page_base();

    let region = {
        let mut pool = MMIO_POOL.lock();
        let pos = pool
            .regions
            .iter()
            .position(|r| r.virt == virt_base && r.len >= len as usize + page_offset as usize)
            .ok_or(KernelError::NotFound {
                resource: "mmio mapping",
                id: virt.as_u64(),
            })?;
        pool.regions.remove(pos)
    };

    if let Some(kernel) = super::address_space::kernel_space() {
        let pages = region.len / FRAME_SIZE;
        for page in 0..pages {
            kernel.unmap_page(VirtualAddress::new(
                region.virt.as_u64() + (page * FRAME_SIZE) as u64,
            ))?;
        }
    }
    Ok(())
}

/// The registered region containing `phys`, if any.
pub fn find_by_phys(phys: PhysicalAddress) -> Option<MmioRegion> {
    MMIO_POOL.lock().find_by_phys(phys).cloned()
}

/// Snapshot of all registered regions, in registration order.
pub fn dump() -> Vec<MmioRegion> {
    MMIO_POOL.lock().regions.clone()
}

/// Number of live registrations.
pub fn region_count() -> usize {
    MMIO_POOL.lock().regions.len()
}

/// Store fence: make a preceding MMIO write visible to the device before
/// anything after it.
#[inline]
fn write_barrier() {
    #[cfg(target_os = "none")]
    // SAFETY: sfence only orders stores.
    unsafe {
        core::arch::asm!("sfence", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(target_os = "none"))]
    core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
}

/// Load fence: order a following MMIO read after everything before it.
#[inline]
fn read_barrier() {
    #[cfg(target_os = "none")]
    // SAFETY: lfence only orders loads.
    unsafe {
        core::arch::asm!("lfence", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(target_os = "none"))]
    core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
}

/// Write a device register through a mapping returned by [`map_mmio`].
///
/// # Safety
///
/// `addr` must lie inside a live MMIO mapping and be naturally aligned for
/// `T`; the write has whatever device side effects the register defines.
pub unsafe fn mmio_write<T>(addr: VirtualAddress, value: T) {
    // SAFETY: forwarded to the caller's contract.
    unsafe {
        core::ptr::write_volatile(addr.as_mut_ptr::<T>(), value);
    }
    write_barrier();
}

/// Read a device register through a mapping returned by [`map_mmio`].
///
/// # Safety
///
/// As for [`mmio_write`]; reads may also have device side effects.
pub unsafe fn mmio_read<T>(addr: VirtualAddress) -> T {
    read_barrier();
    // SAFETY: forwarded to the caller's contract.
    unsafe { core::ptr::read_volatile(addr.as_ptr::<T>()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The registry is a process global; these tests use disjoint physical
    /// ranges so they can run in parallel.

    #[test]
    fn map_preserves_sub_page_offset() {
        let virt = map_mmio(PhysicalAddress::new(0xFEBC_1034), 0x100, "bar0").unwrap();
        assert_eq!(virt.as_u64() % FRAME_SIZE as u64, 0x034);
        assert!(virt.as_u64() >= MMIO_WINDOW_BASE);

        let region = find_by_phys(PhysicalAddress::new(0xFEBC_1000)).unwrap();
        assert_eq!(region.label, "bar0");
        unmap_mmio(virt, 0x100).unwrap();
    }

    #[test]
    fn identical_request_reuses_mapping() {
        let a = map_mmio(PhysicalAddress::new(0xFEA0_0000), 0x2000, "bar1").unwrap();
        let b = map_mmio(PhysicalAddress::new(0xFEA0_0000), 0x2000, "bar1").unwrap();
        assert_eq!(a, b);

        let count_with_mapping = dump()
            .iter()
            .filter(|r| r.phys == PhysicalAddress::new(0xFEA0_0000))
            .count();
        assert_eq!(count_with_mapping, 1);
        unmap_mmio(a, 0x2000).unwrap();
    }

    #[test]
    fn overlapping_request_is_refused() {
        let virt = map_mmio(PhysicalAddress::new(0xFE90_0000), 0x3000, "bar2").unwrap();
        // Overlaps the tail of bar2 with a different shape.
        assert!(matches!(
            map_mmio(PhysicalAddress::new(0xFE90_2000), 0x2000, "bar3"),
            Err(KernelError::MmioOverlap { .. })
        ));
        unmap_mmio(virt, 0x3000).unwrap();
    }

    #[test]
    fn unmap_restores_registry() {
        let before: Vec<_> = dump()
            .into_iter()
            .filter(|r| r.label == "bar4")
            .collect();
        assert!(before.is_empty());

        let virt = map_mmio(PhysicalAddress::new(0xFE80_0000), 0x1000, "bar4").unwrap();
        assert_eq!(
            dump().iter().filter(|r| r.label == "bar4").count(),
            1
        );

        unmap_mmio(virt, 0x1000).unwrap();
        assert_eq!(
            dump().iter().filter(|r| r.label == "bar4").count(),
            0
        );
        // Unmapping twice reports the missing entry.
        assert!(unmap_mmio(virt, 0x1000).is_err());
    }

    #[test]
    fn zero_length_rejected() {
        assert!(map_mmio(PhysicalAddress::new(0xFE70_0000), 0, "bar5").is_err());
    }

    #[test]
    fn cursor_is_append_only() {
        let a = map_mmio(PhysicalAddress::new(0xFE60_0000), 0x1000, "bar6").unwrap();
        unmap_mmio(a, 0x1000).unwrap();
        let b = map_mmio(PhysicalAddress::new(0xFE50_0000), 0x1000, "bar7").unwrap();
        // The freed window range is not recycled.
        assert!(b.as_u64() > a.as_u64());
        unmap_mmio(b, 0x1000).unwrap();
    }
}
