//! Address spaces.
//!
//! An address space is a 4-level page-table tree identified by its root
//! frame. The kernel half of the root (entries 256..511) is copied verbatim
//! into every new space, so the trees below it are shared frames and every
//! space agrees on kernel mappings by construction. The user half is
//! private.
//!
//! Table frames are reached through the HHDM, so walking needs no recursive
//! mapping or temporary windows. The trees are not locked: mapping runs at
//! boot and driver-probe time from a single thread (concurrent mutation
//! after that is a known hazard, documented where it matters).

use crate::{
    error::{KernelError, KernelResult},
    sync::OnceLock,
};

use super::{
    frame_allocator,
    page_table::{PageTable, VirtIndices, KERNEL_HALF_START, PAGE_TABLE_ENTRIES},
    phys_to_virt, virt_to_phys_hhdm, PageFlags, PhysicalAddress, VirtualAddress, FRAME_SIZE,
};

/// A 4-level page-table tree rooted at a physical frame.
///
/// The root's physical address is exactly the value loaded into CR3 when
/// the space is activated.
#[derive(Debug)]
pub struct AddressSpace {
    root: PhysicalAddress,
}

/// The kernel address space, adopted from the bootloader's tables.
static KERNEL_SPACE: OnceLock<AddressSpace> = OnceLock::new();

/// Adopt the boot page tables as the kernel address space.
#[cfg(target_os = "none")]
pub fn init() -> KernelResult<()> {
    let root = crate::arch::x86_64::mmu::read_cr3();
    KERNEL_SPACE
        .set(AddressSpace { root })
        .map_err(|_| KernelError::AlreadyExists {
            resource: "kernel address space",
            id: 0,
        })
}

/// The kernel address space, if initialized.
pub fn kernel_space() -> Option<&'static AddressSpace> {
    KERNEL_SPACE.get()
}

/// Access a page table frame through the HHDM.
///
/// # Safety
///
/// `phys` must be the physical address of a live page-table frame owned by
/// the tree being walked, and the caller must hold the conventional
/// exclusive access to that tree.
unsafe fn table_mut<'a>(phys: PhysicalAddress) -> &'a mut PageTable {
    // SAFETY: forwarded; the HHDM maps all of physical memory writable.
    unsafe { &mut *phys_to_virt(phys).as_mut_ptr::<PageTable>() }
}

impl AddressSpace {
    /// The root frame's physical address (the CR3 value).
    pub const fn root_phys(&self) -> PhysicalAddress {
        self.root
    }

    /// Wrap an existing root. Used by tests and by the boot adoption path.
    pub const fn from_root(root: PhysicalAddress) -> Self {
        Self { root }
    }

    /// Create a fresh address space: new zeroed root with the kernel half
    /// copied from the kernel space, user half empty.
    pub fn create() -> KernelResult<AddressSpace> {
        let root_virt = frame_allocator::alloc_zeroed()?;
        let root_phys = virt_to_phys_hhdm(root_virt);
        let space = AddressSpace { root: root_phys };

        if let Some(kernel) = kernel_space() {
            // SAFETY: both roots are live table frames; the new one is
            // exclusively ours, the kernel root is only read.
            unsafe {
                let src = table_mut(kernel.root);
                let dst = table_mut(root_phys);
                for i in KERNEL_HALF_START..PAGE_TABLE_ENTRIES {
                    dst[i] = src[i];
                }
            }
        }

        Ok(space)
    }

    /// Load this space's root into CR3.
    ///
    /// # Safety
    ///
    /// The space must map the currently executing code, the current stack,
    /// and the HHDM -- guaranteed for spaces made by [`create`], whose
    /// kernel half is shared with the kernel space.
    ///
    /// [`create`]: AddressSpace::create
    #[cfg(target_os = "none")]
    pub unsafe fn switch(&self) {
        // SAFETY: forwarded to the caller's contract.
        unsafe { crate::arch::x86_64::mmu::write_cr3(self.root) }
    }

    /// Map one 4 KiB page, creating interior tables as needed.
    ///
    /// Never produces huge leaves; mapping over an existing leaf (or into a
    /// 2 MiB leaf) fails with `AlreadyMapped`. The TLB entry for `virt` is
    /// always invalidated.
    pub fn map_page(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
    ) -> KernelResult<()> {
        let idx = VirtIndices::of(virt);

        // Interior entries are permissive; the leaf decides. The USER bit
        // must be present at every level for ring-3 access to work at all.
        let mut interior = PageFlags::PRESENT | PageFlags::WRITABLE;
        if flags.contains(PageFlags::USER) {
            interior |= PageFlags::USER;
        }

        let l1_phys = {
            let l3_phys = self.descend_or_create(self.root, idx.l4, interior)?;
            let l2_phys = self.descend_or_create(l3_phys, idx.l3, interior)?;

            // SAFETY: l2_phys is a live interior table of this tree.
            let l2 = unsafe { table_mut(l2_phys) };
            if l2[idx.l2].is_present() && l2[idx.l2].is_huge() {
                return Err(KernelError::AlreadyMapped { addr: virt.as_u64() });
            }
            self.descend_or_create(l2_phys, idx.l2, interior)?
        };

        // SAFETY: l1_phys is a live leaf table of this tree.
        let l1 = unsafe { table_mut(l1_phys) };
        if l1[idx.l1].is_present() {
            return Err(KernelError::AlreadyMapped { addr: virt.as_u64() });
        }
        l1[idx.l1].set(phys, flags);

        crate::arch::x86_64::mmu::tlb_flush_address(virt.as_u64());
        Ok(())
    }

    /// Walk one level down from the table at `parent`, allocating a zeroed
    /// table frame if the slot is empty. Returns the child's physical
    /// address.
    fn descend_or_create(
        &self,
        parent: PhysicalAddress,
        index: usize,
        interior_flags: PageFlags,
    ) -> KernelResult<PhysicalAddress> {
        // SAFETY: parent is a live table of this tree.
        let table = unsafe { table_mut(parent) };
        let entry = &mut table[index];

        if let Some(addr) = entry.addr() {
            // Widen interior permissions if this mapping needs USER access.
            if interior_flags.contains(PageFlags::USER)
                && !entry.flags().contains(PageFlags::USER)
            {
                entry.set(addr, entry.flags() | PageFlags::USER);
            }
            return Ok(addr);
        }

        let child_virt = frame_allocator::alloc_zeroed()?;
        let child_phys = virt_to_phys_hhdm(child_virt);
        entry.set(child_phys, interior_flags);
        Ok(child_phys)
    }

    /// Unmap one 4 KiB page; returns the physical address it mapped.
    /// Interior tables stay in place. Huge leaves are refused.
    pub fn unmap_page(&self, virt: VirtualAddress) -> KernelResult<PhysicalAddress> {
        let idx = VirtIndices::of(virt);

        let l3_phys = self.descend(self.root, idx.l4)?;
        let l2_phys = self.descend(l3_phys, idx.l3)?;

        // SAFETY: live table of this tree.
        let l2 = unsafe { table_mut(l2_phys) };
        if l2[idx.l2].is_present() && l2[idx.l2].is_huge() {
            return Err(KernelError::Unsupported {
                feature: "unmapping 2 MiB leaves",
            });
        }
        let l1_phys = self.descend(l2_phys, idx.l2)?;

        // SAFETY: live table of this tree.
        let l1 = unsafe { table_mut(l1_phys) };
        let phys = l1[idx.l1]
            .addr()
            .ok_or(KernelError::UnmappedMemory { addr: virt.as_u64() })?;
        l1[idx.l1].clear();

        crate::arch::x86_64::mmu::tlb_flush_address(virt.as_u64());
        Ok(phys)
    }

    fn descend(&self, parent: PhysicalAddress, index: usize) -> KernelResult<PhysicalAddress> {
        // SAFETY: parent is a live table of this tree.
        let table = unsafe { table_mut(parent) };
        table[index]
            .addr()
            .ok_or(KernelError::UnmappedMemory { addr: 0 })
    }

    /// Resolve a virtual address to its physical address. Respects 2 MiB
    /// leaves. Returns `None` for unmapped addresses.
    pub fn translate(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let idx = VirtIndices::of(virt);

        // SAFETY: the root is a live table frame.
        let l4 = unsafe { table_mut(self.root) };
        let l3_phys = l4[idx.l4].addr()?;

        // SAFETY: addresses read from present entries of this tree.
        let l3 = unsafe { table_mut(l3_phys) };
        let l2_phys = l3[idx.l3].addr()?;

        let l2 = unsafe { table_mut(l2_phys) };
        let l2_entry = &l2[idx.l2];
        if l2_entry.is_huge() {
            let base = l2_entry.addr()?;
            return Some(PhysicalAddress::new(
                base.as_u64() + idx.huge_offset(virt),
            ));
        }
        let l1_phys = l2_entry.addr()?;

        let l1 = unsafe { table_mut(l1_phys) };
        let base = l1[idx.l1].addr()?;
        Some(PhysicalAddress::new(base.as_u64() + idx.offset))
    }

    /// Set the USER bit at every level along `[start, start+len)` so ring 3
    /// may reference an existing kernel mapping (shared code paths).
    pub fn map_kernel_range_user(
        &self,
        start: VirtualAddress,
        len: usize,
    ) -> KernelResult<()> {
        let first = start.page_base().as_u64();
        let last = (start.as_u64() + len as u64 - 1) & !(FRAME_SIZE as u64 - 1);

        let mut page = first;
        loop {
            let virt = VirtualAddress::new(page);
            let idx = VirtIndices::of(virt);

            // SAFETY: live tables of this tree, levels checked as we go.
            unsafe {
                let l4 = table_mut(self.root);
                let l3_phys = l4[idx.l4]
                    .addr()
                    .ok_or(KernelError::UnmappedMemory { addr: page })?;
                widen_user(&mut l4[idx.l4]);

                let l3 = table_mut(l3_phys);
                let l2_phys = l3[idx.l3]
                    .addr()
                    .ok_or(KernelError::UnmappedMemory { addr: page })?;
                widen_user(&mut l3[idx.l3]);

                let l2 = table_mut(l2_phys);
                if l2[idx.l2].is_huge() {
                    widen_user(&mut l2[idx.l2]);
                } else {
                    let l1_phys = l2[idx.l2]
                        .addr()
                        .ok_or(KernelError::UnmappedMemory { addr: page })?;
                    widen_user(&mut l2[idx.l2]);

                    let l1 = table_mut(l1_phys);
                    if !l1[idx.l1].is_present() {
                        return Err(KernelError::UnmappedMemory { addr: page });
                    }
                    widen_user(&mut l1[idx.l1]);
                }
            }
            crate::arch::x86_64::mmu::tlb_flush_address(page);

            if page >= last {
                break;
            }
            page += FRAME_SIZE as u64;
        }
        Ok(())
    }

    /// Duplicate this space's user half into a new space.
    ///
    /// Leaf pages are deep-copied into freshly allocated frames, so the two
    /// spaces share nothing below the kernel half -- no aliasing, no
    /// copy-on-write machinery. Huge user leaves are not copied.
    pub fn clone_user_half(&self) -> KernelResult<AddressSpace> {
        let new_space = AddressSpace::create()?;

        // SAFETY: the source root is a live table frame, read-only here.
        let l4 = unsafe { table_mut(self.root) };
        for i4 in 0..KERNEL_HALF_START {
            let Some(l3_phys) = l4[i4].addr() else { continue };
            // SAFETY: present entries of the source tree.
            let l3 = unsafe { table_mut(l3_phys) };
            for i3 in 0..PAGE_TABLE_ENTRIES {
                let Some(l2_phys) = l3[i3].addr() else { continue };
                let l2 = unsafe { table_mut(l2_phys) };
                for i2 in 0..PAGE_TABLE_ENTRIES {
                    let entry = &l2[i2];
                    if !entry.is_present() {
                        continue;
                    }
                    if entry.is_huge() {
                        log::warn!(target: "vmm", "clone: skipping huge user leaf");
                        continue;
                    }
                    let l1_phys = match entry.addr() {
                        Some(addr) => addr,
                        None => continue,
                    };
                    let l1 = unsafe { table_mut(l1_phys) };
                    for i1 in 0..PAGE_TABLE_ENTRIES {
                        let Some(src_phys) = l1[i1].addr() else { continue };
                        let flags = l1[i1].flags();

                        let virt = VirtualAddress::new(
                            ((i4 as u64) << 39)
                                | ((i3 as u64) << 30)
                                | ((i2 as u64) << 21)
                                | ((i1 as u64) << 12),
                        );

                        let copy_virt = frame_allocator::alloc_one()?;
                        // SAFETY: src frame is mapped through the HHDM; the
                        // copy frame was just allocated for us.
                        unsafe {
                            core::ptr::copy_nonoverlapping(
                                phys_to_virt(src_phys).as_ptr::<u8>(),
                                copy_virt.as_mut_ptr::<u8>(),
                                FRAME_SIZE,
                            );
                        }
                        new_space.map_page(virt, virt_to_phys_hhdm(copy_virt), flags)?;
                    }
                }
            }
        }

        Ok(new_space)
    }

    /// Tear down the user half, freeing every interior table this space
    /// allocated. Leaf target frames are *not* freed -- the VMM cannot tell
    /// device mappings from memory it ought to own -- and huge leaves are
    /// skipped. The root frame itself is freed last.
    pub fn destroy(self) -> KernelResult<()> {
        // SAFETY: the root is a live table frame, exclusively ours now.
        let l4 = unsafe { table_mut(self.root) };
        for i4 in 0..KERNEL_HALF_START {
            let Some(l3_phys) = l4[i4].addr() else { continue };
            let l3 = unsafe { table_mut(l3_phys) };
            for i3 in 0..PAGE_TABLE_ENTRIES {
                let Some(l2_phys) = l3[i3].addr() else { continue };
                let l2 = unsafe { table_mut(l2_phys) };
                for i2 in 0..PAGE_TABLE_ENTRIES {
                    let entry = &l2[i2];
                    if entry.is_huge() {
                        continue;
                    }
                    if let Some(l1_phys) = entry.addr() {
                        frame_allocator::free(phys_to_virt(l1_phys))?;
                    }
                }
                frame_allocator::free(phys_to_virt(l2_phys))?;
            }
            frame_allocator::free(phys_to_virt(l3_phys))?;
            l4[i4].clear();
        }

        frame_allocator::free(phys_to_virt(self.root))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{MemoryRegion, MemoryRegionKind};
    use alloc::{boxed::Box, vec};
    use core::sync::atomic::Ordering;

    /// Serializes every test in this module: they share the global frame
    /// allocator and HHDM offset.
    static TEST_SERIAL: spin::Mutex<()> = spin::Mutex::new(());

    /// Back "physical" frames with leaked host memory: the global HHDM
    /// offset is chosen so phys + offset lands inside the arena.
    fn setup_fake_phys_memory() -> u64 {
        static ARENA_LOCK: spin::Mutex<Option<u64>> = spin::Mutex::new(None);
        let mut guard = ARENA_LOCK.lock();
        if let Some(base) = *guard {
            return base;
        }

        const PHYS_BASE: u64 = 0x100000;
        const ARENA_FRAMES: usize = 600;
        let arena = vec![0u8; (ARENA_FRAMES + 1) * FRAME_SIZE].into_boxed_slice();
        let raw = Box::leak(arena).as_mut_ptr() as u64;
        let aligned = (raw + FRAME_SIZE as u64 - 1) & !(FRAME_SIZE as u64 - 1);
        let hhdm = aligned - PHYS_BASE;

        crate::mm::HHDM_OFFSET.store(hhdm, Ordering::Relaxed);
        frame_allocator::init(
            &[MemoryRegion {
                base: PHYS_BASE,
                length: (ARENA_FRAMES * FRAME_SIZE) as u64,
                kind: MemoryRegionKind::Usable,
            }],
            hhdm,
        )
        .unwrap();

        *guard = Some(PHYS_BASE);
        PHYS_BASE
    }

    fn fresh_space() -> AddressSpace {
        setup_fake_phys_memory();
        AddressSpace::create().unwrap()
    }

    #[test]
    fn map_then_translate_round_trip() {
        let _serial = TEST_SERIAL.lock();
        let space = fresh_space();
        let virt = VirtualAddress::new(0x0000_0000_4000_0000);
        let phys = PhysicalAddress::new(0x0123_4000);

        space
            .map_page(virt, phys, PageFlags::WRITABLE)
            .unwrap();
        assert_eq!(space.translate(virt), Some(phys));

        // Offsets within the page carry through.
        assert_eq!(
            space.translate(VirtualAddress::new(virt.as_u64() + 0xABC)),
            Some(PhysicalAddress::new(phys.as_u64() + 0xABC))
        );
    }

    #[test]
    fn translate_unmapped_is_none() {
        let _serial = TEST_SERIAL.lock();
        let space = fresh_space();
        assert_eq!(space.translate(VirtualAddress::new(0x5000_0000)), None);
    }

    #[test]
    fn double_map_is_rejected() {
        let _serial = TEST_SERIAL.lock();
        let space = fresh_space();
        let virt = VirtualAddress::new(0x0000_0000_4020_0000);
        let phys = PhysicalAddress::new(0x0200_0000);

        space.map_page(virt, phys, PageFlags::WRITABLE).unwrap();
        assert_eq!(
            space.map_page(virt, phys, PageFlags::WRITABLE),
            Err(KernelError::AlreadyMapped {
                addr: virt.as_u64()
            })
        );
    }

    #[test]
    fn unmap_returns_mapped_frame() {
        let _serial = TEST_SERIAL.lock();
        let space = fresh_space();
        let virt = VirtualAddress::new(0x0000_0000_4040_0000);
        let phys = PhysicalAddress::new(0x0300_0000);

        space.map_page(virt, phys, PageFlags::WRITABLE).unwrap();
        assert_eq!(space.unmap_page(virt).unwrap(), phys);
        assert_eq!(space.translate(virt), None);
        assert_eq!(
            space.unmap_page(virt),
            Err(KernelError::UnmappedMemory {
                addr: virt.as_u64()
            })
        );
    }

    #[test]
    fn huge_leaf_translation() {
        let _serial = TEST_SERIAL.lock();
        let space = fresh_space();
        // Hand-build a 2 MiB leaf at 0x4060_0000.
        let virt = VirtualAddress::new(0x0000_0000_4060_0000);
        let idx = VirtIndices::of(virt);
        let interior = PageFlags::PRESENT | PageFlags::WRITABLE;
        let l3_phys = space.descend_or_create(space.root, idx.l4, interior).unwrap();
        let l2_phys = space.descend_or_create(l3_phys, idx.l3, interior).unwrap();
        let l2 = unsafe { table_mut(l2_phys) };
        l2[idx.l2].set(
            PhysicalAddress::new(0x0800_0000),
            PageFlags::WRITABLE | PageFlags::HUGE,
        );

        assert_eq!(
            space.translate(VirtualAddress::new(virt.as_u64() + 0x12345)),
            Some(PhysicalAddress::new(0x0800_0000 + 0x12345))
        );
        // map_page refuses to split or overwrite the huge leaf.
        assert_eq!(
            space.map_page(virt, PhysicalAddress::new(0x1000), PageFlags::empty()),
            Err(KernelError::AlreadyMapped {
                addr: virt.as_u64()
            })
        );
    }

    #[test]
    fn clone_deep_copies_user_pages() {
        let _serial = TEST_SERIAL.lock();
        let space = fresh_space();
        let virt = VirtualAddress::new(0x0000_0000_4080_0000);

        let page_virt = frame_allocator::alloc_one().unwrap();
        let page_phys = crate::mm::virt_to_phys_hhdm(page_virt);
        // SAFETY: freshly allocated arena-backed frame.
        unsafe {
            core::ptr::write_bytes(page_virt.as_mut_ptr::<u8>(), 0x5A, FRAME_SIZE);
        }
        space
            .map_page(virt, page_phys, PageFlags::WRITABLE | PageFlags::USER)
            .unwrap();

        let cloned = space.clone_user_half().unwrap();
        let copy_phys = cloned.translate(virt).expect("clone lost the mapping");
        // Deep copy: different frame, same contents.
        assert_ne!(copy_phys, page_phys);
        let copy_byte = unsafe { *phys_to_virt(copy_phys).as_ptr::<u8>() };
        assert_eq!(copy_byte, 0x5A);
    }

    #[test]
    fn destroy_returns_interior_tables() {
        let _serial = TEST_SERIAL.lock();
        setup_fake_phys_memory();
        let before = frame_allocator::stats().free_frames;

        let space = AddressSpace::create().unwrap();
        let virt = VirtualAddress::new(0x0000_0000_40A0_0000);
        let page_virt = frame_allocator::alloc_one().unwrap();
        let page_phys = crate::mm::virt_to_phys_hhdm(page_virt);
        space.map_page(virt, page_phys, PageFlags::WRITABLE).unwrap();

        space.destroy().unwrap();
        // Root + 3 interior tables came back; the leaf data frame is the
        // caller's to free.
        assert_eq!(frame_allocator::stats().free_frames, before - 1);
        frame_allocator::free(page_virt).unwrap();
    }
}
