//! Physical frame allocator.
//!
//! A bitmap with one bit per 4 KiB frame, bit set = used. Built from the
//! bootloader's memory map: every frame starts out used, USABLE regions are
//! cleared (aligned inward), and the first MiB is forced back to used for
//! real-mode legacy, the VGA aperture, and ACPI. Loader-reclaimable regions
//! are freed later by [`reclaim_bootloader_memory`] once boot data has been
//! consumed; the kernel image is never USABLE in the map and so never freed.
//!
//! Allocation is a linear first-fit scan. O(frames) per operation is
//! accepted: the bitmap is 32 KiB and stays cache-hot.

use crate::{
    error::{KernelError, KernelResult},
    sync::IrqSpinLock,
};

use super::{MemoryRegion, MemoryRegionKind, PhysicalAddress, VirtualAddress};

/// Size of a physical frame (4 KiB).
pub const FRAME_SIZE: usize = 4096;

/// Configured ceiling on managed physical memory (1 GiB).
const MAX_PHYS_BYTES: u64 = 1 << 30;

/// Maximum number of frames the bitmap can describe.
const MAX_FRAMES: usize = (MAX_PHYS_BYTES / FRAME_SIZE as u64) as usize;

/// Bitmap storage in 64-bit words.
const BITMAP_WORDS: usize = MAX_FRAMES / 64;

/// Frames in the permanently reserved first MiB.
const LOW_MEMORY_FRAMES: usize = 0x100000 / FRAME_SIZE;

/// Snapshot of allocator counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub total_frames: usize,
    pub used_frames: usize,
    pub free_frames: usize,
}

/// The bitmap allocator itself. Pure state: all I/O-free so the whole thing
/// runs under the host test harness.
pub struct FrameBitmap {
    /// One bit per frame, set = used.
    bitmap: [u64; BITMAP_WORDS],
    /// Frames under management (`max_phys / FRAME_SIZE`).
    total_frames: usize,
    /// Count of set bits within `0..total_frames`.
    used_frames: usize,
    /// Higher-half direct-map offset for pointer translation.
    hhdm_offset: u64,
}

impl FrameBitmap {
    pub const fn new() -> Self {
        Self {
            bitmap: [u64::MAX; BITMAP_WORDS],
            total_frames: 0,
            used_frames: 0,
            hhdm_offset: 0,
        }
    }

    /// Build the bitmap from a boot memory map.
    pub fn init(&mut self, memory_map: &[MemoryRegion], hhdm_offset: u64) {
        self.hhdm_offset = hhdm_offset;

        // Highest usable byte bounds the managed range, capped at the ceiling.
        let highest = memory_map
            .iter()
            .filter(|r| r.kind == MemoryRegionKind::Usable)
            .map(|r| r.base + r.length)
            .max()
            .unwrap_or(0);
        let max_phys = highest.min(MAX_PHYS_BYTES);
        self.total_frames = (max_phys / FRAME_SIZE as u64) as usize;

        // Every frame starts used.
        self.bitmap = [u64::MAX; BITMAP_WORDS];
        self.used_frames = self.total_frames;

        // Free usable regions, aligned inward to whole frames.
        for region in memory_map {
            if region.kind != MemoryRegionKind::Usable {
                continue;
            }
            let start = region.base.div_ceil(FRAME_SIZE as u64);
            let end = (region.base + region.length) / FRAME_SIZE as u64;
            for frame in start..end.min(self.total_frames as u64) {
                self.clear_used(frame as usize);
            }
        }

        // The first MiB stays reserved no matter what the map says.
        for frame in 0..LOW_MEMORY_FRAMES.min(self.total_frames) {
            self.set_used(frame);
        }
    }

    fn is_used(&self, frame: usize) -> bool {
        self.bitmap[frame / 64] & (1 << (frame % 64)) != 0
    }

    fn set_used(&mut self, frame: usize) {
        if !self.is_used(frame) {
            self.bitmap[frame / 64] |= 1 << (frame % 64);
            self.used_frames += 1;
        }
    }

    fn clear_used(&mut self, frame: usize) {
        if self.is_used(frame) {
            self.bitmap[frame / 64] &= !(1 << (frame % 64));
            self.used_frames -= 1;
        }
    }

    fn frame_to_virt(&self, frame: usize) -> VirtualAddress {
        VirtualAddress::new(frame as u64 * FRAME_SIZE as u64 + self.hhdm_offset)
    }

    fn virt_to_frame(&self, virt: VirtualAddress) -> KernelResult<usize> {
        let addr = virt.as_u64();
        if addr < self.hhdm_offset || addr % FRAME_SIZE as u64 != 0 {
            return Err(KernelError::InvalidAddress { addr });
        }
        let frame = ((addr - self.hhdm_offset) / FRAME_SIZE as u64) as usize;
        if frame >= self.total_frames {
            return Err(KernelError::InvalidAddress { addr });
        }
        Ok(frame)
    }

    /// Allocate one frame; returns its HHDM-mapped pointer.
    pub fn alloc_one(&mut self) -> KernelResult<VirtualAddress> {
        self.alloc_contig(1)
    }

    /// Allocate `count` physically contiguous frames (first fit, lowest
    /// starting frame). Fails without mutating the bitmap when no run of
    /// `count` free frames exists.
    pub fn alloc_contig(&mut self, count: usize) -> KernelResult<VirtualAddress> {
        if count == 0 {
            return Err(KernelError::InvalidArgument {
                name: "count",
                value: "zero frames",
            });
        }

        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for frame in 0..self.total_frames {
            if self.is_used(frame) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = frame;
            }
            run_len += 1;
            if run_len == count {
                for f in run_start..run_start + count {
                    self.set_used(f);
                }
                return Ok(self.frame_to_virt(run_start));
            }
        }

        Err(KernelError::OutOfMemory {
            requested_frames: count,
        })
    }

    /// Free one frame. Double-free (bit already clear) is ignored.
    pub fn free(&mut self, virt: VirtualAddress) -> KernelResult<()> {
        self.free_contig(virt, 1)
    }

    /// Free `count` contiguous frames starting at `virt`.
    pub fn free_contig(&mut self, virt: VirtualAddress, count: usize) -> KernelResult<()> {
        let start = self.virt_to_frame(virt)?;
        if start + count > self.total_frames {
            return Err(KernelError::InvalidAddress { addr: virt.as_u64() });
        }
        for frame in start..start + count {
            // Never hand back the reserved low megabyte.
            if frame < LOW_MEMORY_FRAMES {
                continue;
            }
            self.clear_used(frame);
        }
        Ok(())
    }

    /// Force a physical frame to used (boot page tables, DMA windows).
    pub fn mark_frame_used(&mut self, phys: PhysicalAddress) {
        let frame = phys.frame_index();
        if frame < self.total_frames {
            self.set_used(frame);
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> FrameStats {
        FrameStats {
            total_frames: self.total_frames,
            used_frames: self.used_frames,
            free_frames: self.total_frames - self.used_frames,
        }
    }

    /// Count set bits in the managed range. Test-only invariant support;
    /// `used_frames` must always equal this.
    pub fn popcount(&self) -> usize {
        let mut count = 0usize;
        for frame in 0..self.total_frames {
            if self.is_used(frame) {
                count += 1;
            }
        }
        count
    }
}

impl Default for FrameBitmap {
    fn default() -> Self {
        Self::new()
    }
}

/// Global frame allocator.
///
/// IRQ-safe: the network receive path and fault handlers may allocate frames
/// with interrupts disabled.
static FRAME_ALLOCATOR: IrqSpinLock<FrameBitmap> = IrqSpinLock::new(FrameBitmap::new());

/// Saved copy of the boot memory map for the reclaim pass.
/// Fixed capacity: Limine maps on PCs run well under this.
const MAX_BOOT_REGIONS: usize = 64;
static BOOT_REGIONS: IrqSpinLock<([Option<MemoryRegion>; MAX_BOOT_REGIONS], usize)> =
    IrqSpinLock::new(([None; MAX_BOOT_REGIONS], 0));

/// Initialize the global allocator from the boot memory map.
pub fn init(memory_map: &[MemoryRegion], hhdm_offset: u64) -> KernelResult<()> {
    FRAME_ALLOCATOR.lock().init(memory_map, hhdm_offset);

    let mut saved = BOOT_REGIONS.lock();
    let count = memory_map.len().min(MAX_BOOT_REGIONS);
    for (slot, region) in saved.0.iter_mut().zip(memory_map.iter()) {
        *slot = Some(*region);
    }
    saved.1 = count;

    Ok(())
}

/// Allocate a single frame, returning its HHDM pointer.
pub fn alloc_one() -> KernelResult<VirtualAddress> {
    FRAME_ALLOCATOR.lock().alloc_one()
}

/// Allocate a single zeroed frame. Used for page tables.
pub fn alloc_zeroed() -> KernelResult<VirtualAddress> {
    let virt = alloc_one()?;
    // SAFETY: the frame was just allocated and is exclusively ours; HHDM maps
    // it writable.
    unsafe {
        core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, FRAME_SIZE);
    }
    Ok(virt)
}

/// Allocate `count` physically contiguous frames.
pub fn alloc_contig(count: usize) -> KernelResult<VirtualAddress> {
    FRAME_ALLOCATOR.lock().alloc_contig(count)
}

/// Free a single frame.
pub fn free(virt: VirtualAddress) -> KernelResult<()> {
    FRAME_ALLOCATOR.lock().free(virt)
}

/// Free `count` contiguous frames.
pub fn free_contig(virt: VirtualAddress, count: usize) -> KernelResult<()> {
    FRAME_ALLOCATOR.lock().free_contig(virt, count)
}

/// Force a physical frame to used.
pub fn mark_frame_used(phys: PhysicalAddress) {
    FRAME_ALLOCATOR.lock().mark_frame_used(phys);
}

/// Counter snapshot.
pub fn stats() -> FrameStats {
    FRAME_ALLOCATOR.lock().stats()
}

/// Release loader-reclaimable regions back to the allocator.
///
/// Call only after every piece of boot data (memory map copies, module
/// blobs, loader page tables) has been consumed or copied out.
pub fn reclaim_bootloader_memory() -> usize {
    let saved = BOOT_REGIONS.lock();
    let mut allocator = FRAME_ALLOCATOR.lock();
    let mut reclaimed = 0usize;

    for region in saved.0.iter().take(saved.1).flatten() {
        if region.kind != MemoryRegionKind::BootloaderReclaimable {
            continue;
        }
        let start = region.base.div_ceil(FRAME_SIZE as u64) as usize;
        let end = ((region.base + region.length) / FRAME_SIZE as u64) as usize;
        for frame in start..end.min(allocator.total_frames) {
            if frame >= LOW_MEMORY_FRAMES && allocator.is_used(frame) {
                allocator.clear_used(frame);
                reclaimed += 1;
            }
        }
    }

    if reclaimed > 0 {
        log::info!(target: "pmm", "reclaimed {} loader frames", reclaimed);
    }
    reclaimed
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    const HHDM: u64 = 0xFFFF_8000_0000_0000;

    fn single_region_allocator() -> Box<FrameBitmap> {
        // One usable MiB right above the reserved low MiB.
        let map = [MemoryRegion {
            base: 0x100000,
            length: 0x100000,
            kind: MemoryRegionKind::Usable,
        }];
        let mut allocator = Box::new(FrameBitmap::new());
        allocator.init(&map, HHDM);
        allocator
    }

    #[test]
    fn init_frees_exactly_the_usable_region() {
        let allocator = single_region_allocator();
        let stats = allocator.stats();
        // [0x100000, 0x200000) = 256 frames
        assert_eq!(stats.free_frames, 256);
        assert_eq!(stats.total_frames, 512);
        assert_eq!(allocator.used_frames, allocator.popcount());
    }

    #[test]
    fn alloc_one_returns_lowest_hhdm_pointer() {
        let mut allocator = single_region_allocator();
        let virt = allocator.alloc_one().unwrap();
        assert_eq!(virt.as_u64(), HHDM + 0x100000);
        assert_eq!(allocator.stats().free_frames, 255);

        allocator.free(virt).unwrap();
        assert_eq!(allocator.stats().free_frames, 256);
        assert_eq!(allocator.used_frames, allocator.popcount());
    }

    #[test]
    fn returned_pointers_are_frame_aligned() {
        let mut allocator = single_region_allocator();
        for _ in 0..8 {
            let virt = allocator.alloc_one().unwrap();
            assert_eq!(virt.as_u64() % FRAME_SIZE as u64, 0);
        }
        assert_eq!(allocator.used_frames, allocator.popcount());
    }

    #[test]
    fn contig_is_first_fit_lowest_start() {
        let mut allocator = single_region_allocator();
        let first = allocator.alloc_one().unwrap();
        let second = allocator.alloc_one().unwrap();
        // Free the first frame: a 1-frame hole below a long free run.
        allocator.free(first).unwrap();

        // A 2-frame request must skip the hole and start after `second`.
        let run = allocator.alloc_contig(2).unwrap();
        assert_eq!(run.as_u64(), second.as_u64() + FRAME_SIZE as u64);

        // A 1-frame request takes the hole (lowest start).
        let hole = allocator.alloc_one().unwrap();
        assert_eq!(hole.as_u64(), first.as_u64());
    }

    #[test]
    fn contig_failure_leaves_bitmap_untouched() {
        let mut allocator = single_region_allocator();
        let before = allocator.stats();
        let result = allocator.alloc_contig(512);
        assert_eq!(
            result.unwrap_err(),
            KernelError::OutOfMemory {
                requested_frames: 512
            }
        );
        assert_eq!(allocator.stats(), before);
    }

    #[test]
    fn zero_frames_is_rejected() {
        let mut allocator = single_region_allocator();
        assert!(allocator.alloc_contig(0).is_err());
    }

    #[test]
    fn double_free_is_ignored() {
        let mut allocator = single_region_allocator();
        let virt = allocator.alloc_one().unwrap();
        allocator.free(virt).unwrap();
        allocator.free(virt).unwrap();
        assert_eq!(allocator.stats().free_frames, 256);
        assert_eq!(allocator.used_frames, allocator.popcount());
    }

    #[test]
    fn first_mib_stays_reserved() {
        let map = [MemoryRegion {
            // Map claims the whole low range is usable; allocator must not
            // believe it.
            base: 0,
            length: 0x200000,
            kind: MemoryRegionKind::Usable,
        }];
        let mut allocator = Box::new(FrameBitmap::new());
        allocator.init(&map, HHDM);

        assert_eq!(allocator.stats().free_frames, 256);
        let virt = allocator.alloc_one().unwrap();
        assert_eq!(virt.as_u64(), HHDM + 0x100000);
    }

    #[test]
    fn unaligned_regions_are_shrunk_inward() {
        let map = [MemoryRegion {
            base: 0x100800,
            length: 0x2000,
            kind: MemoryRegionKind::Usable,
        }];
        let mut allocator = Box::new(FrameBitmap::new());
        allocator.init(&map, HHDM);
        // [0x100800, 0x102800) contains exactly one whole frame: 0x101000.
        assert_eq!(allocator.stats().free_frames, 1);
        let virt = allocator.alloc_one().unwrap();
        assert_eq!(virt.as_u64(), HHDM + 0x101000);
    }

    #[test]
    fn invariant_holds_over_random_walk() {
        let mut allocator = single_region_allocator();
        let mut held: alloc::vec::Vec<VirtualAddress> = alloc::vec::Vec::new();

        // Deterministic pseudo-random alloc/free sequence.
        let mut state = 0x12345678u32;
        for _ in 0..500 {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            if state % 3 != 0 || held.is_empty() {
                if let Ok(v) = allocator.alloc_one() {
                    held.push(v);
                }
            } else {
                let idx = (state as usize) % held.len();
                let v = held.swap_remove(idx);
                allocator.free(v).unwrap();
            }
            assert_eq!(allocator.used_frames, allocator.popcount());
        }
    }
}
