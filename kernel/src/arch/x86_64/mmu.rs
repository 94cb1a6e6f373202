//! MMU control register and TLB primitives.

#[cfg(target_os = "none")]
use crate::mm::PhysicalAddress;

/// Read the physical address of the active top-level page table from CR3.
#[cfg(target_os = "none")]
pub fn read_cr3() -> PhysicalAddress {
    use x86_64::registers::control::Cr3;
    let (frame, _flags) = Cr3::read();
    PhysicalAddress::new(frame.start_address().as_u64())
}

/// Load CR3 with a new top-level page table, switching address spaces.
///
/// # Safety
///
/// `root` must be the physical address of a valid 4-level page table whose
/// kernel half maps the currently executing code, stack, and HHDM.
#[cfg(target_os = "none")]
pub unsafe fn write_cr3(root: PhysicalAddress) {
    use x86_64::{
        registers::control::{Cr3, Cr3Flags},
        structures::paging::PhysFrame,
        PhysAddr,
    };
    let frame = PhysFrame::containing_address(PhysAddr::new(root.as_u64()));
    // SAFETY: forwarded to the caller's contract.
    unsafe { Cr3::write(frame, Cr3Flags::empty()) }
}

/// Invalidate the TLB entry for the page containing `addr`.
pub fn tlb_flush_address(addr: u64) {
    #[cfg(target_os = "none")]
    // SAFETY: invlpg only drops a TLB entry; it has no other side effects.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) addr, options(nostack, preserves_flags));
    }
    #[cfg(not(target_os = "none"))]
    let _ = addr;
}

/// Flush all non-global TLB entries by reloading CR3.
#[cfg(target_os = "none")]
pub fn tlb_flush_all() {
    // SAFETY: Rewriting CR3 with its current value is the architectural way
    // to flush the TLB; no memory side effects.
    unsafe {
        let cr3: u64;
        core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nostack, preserves_flags));
        core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
    }
}
