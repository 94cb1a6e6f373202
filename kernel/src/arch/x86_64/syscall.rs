//! SYSCALL/SYSRET MSR setup.
//!
//! Programs EFER (NXE for no-execute mappings, SCE for the syscall
//! instruction), STAR with the kernel and user selector bases, LSTAR with
//! the entry stub, and SFMASK so interrupts are off on kernel entry. The
//! STAR layout is derived from the live GDT selectors through the checked
//! `Star::write`, which enforces the SYSRET operand packing (SS = base+8,
//! CS = base+16) against the actual descriptor order.

use x86_64::{
    registers::{
        model_specific::{Efer, EferFlags, LStar, SFMask, Star},
        rflags::RFlags,
    },
    VirtAddr,
};

use super::gdt;

pub fn init() {
    let selectors = gdt::selectors();

    // SAFETY: Enabling NXE/SCE only unlocks architecture features; the GDT
    // selectors passed to Star::write reference live descriptors in the
    // order SYSRET requires (user data at base+8, user code at base+16),
    // which Star::write verifies.
    unsafe {
        Efer::update(|flags| {
            flags.insert(EferFlags::NO_EXECUTE_ENABLE | EferFlags::SYSTEM_CALL_EXTENSIONS);
        });

        Star::write(
            selectors.user_code_selector,
            selectors.user_data_selector,
            selectors.code_selector,
            selectors.data_selector,
        )
        .expect("GDT selector order violates SYSRET packing");

        LStar::write(VirtAddr::new(syscall_entry as usize as u64));

        // Mask IF (and TF, to keep single-stepping out of the entry path).
        SFMask::write(RFlags::INTERRUPT_FLAG | RFlags::TRAP_FLAG);
    }
}

/// Bare SYSCALL landing pad.
///
/// The user-space ABI above the core installs the real dispatcher; until
/// then a syscall simply returns. RCX/R11 hold the return RIP/RFLAGS and
/// are preserved untouched between entry and sysretq.
///
/// # Safety
///
/// Entered by the CPU through LSTAR only; never called from Rust.
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() {
    core::arch::naked_asm!("sysretq");
}
