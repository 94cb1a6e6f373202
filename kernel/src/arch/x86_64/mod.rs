//! x86_64 architecture support.
//!
//! Hardware bring-up (GDT, IDT, PIC, PIT, syscall MSRs), interrupt control,
//! serial I/O (COM1 at 0x3F8), I/O port primitives, and the context-switch
//! primitive used by the scheduler.

pub mod context;
pub mod gdt;
#[cfg(target_os = "none")]
pub mod idt;
pub mod mmu;
pub mod pic;
pub mod pit;
pub mod rtc;
pub mod serial;
#[cfg(target_os = "none")]
pub mod syscall;

/// Bring up the CPU-visible tables and the interrupt controller.
///
/// Order matters: the GDT (with the IST stacks in the TSS) must be live
/// before the IDT references its stack indices, and the PIC must be remapped
/// before any IRQ line is unmasked.
#[cfg(target_os = "none")]
pub fn init() {
    // SAFETY: cli disables hardware interrupts. Required during bring-up so
    // no vector fires before the IDT and PIC are configured.
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }

    gdt::init();
    log::info!(target: "arch", "GDT and TSS loaded");

    idt::init();
    log::info!(target: "arch", "IDT loaded (256 gates)");

    pic::init();
    log::info!(target: "arch", "PIC remapped to vectors 32..48");

    syscall::init();
    log::info!(target: "arch", "syscall MSRs programmed");
}

/// Halt the CPU forever. Used by panic and unrecoverable-fault paths.
pub fn halt() -> ! {
    x86_64::instructions::interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}

/// Enable hardware interrupts.
pub fn enable_interrupts() {
    x86_64::instructions::interrupts::enable();
}

/// Disable hardware interrupts.
pub fn disable_interrupts() {
    x86_64::instructions::interrupts::disable();
}

/// Relax the CPU until the next interrupt. The idle thread's whole job.
pub fn idle() {
    x86_64::instructions::hlt();
}

/// Save the interrupt-enable flag and disable interrupts.
///
/// Returns the prior state for [`irq_restore`]. On the host build this is a
/// no-op pair: user space cannot execute cli/sti, and the test harness has
/// no hardware interrupts to race against.
#[inline]
pub fn irq_save() -> bool {
    #[cfg(target_os = "none")]
    {
        let was_enabled = x86_64::instructions::interrupts::are_enabled();
        x86_64::instructions::interrupts::disable();
        was_enabled
    }
    #[cfg(not(target_os = "none"))]
    {
        false
    }
}

/// Restore the interrupt-enable flag saved by [`irq_save`].
#[inline]
pub fn irq_restore(was_enabled: bool) {
    #[cfg(target_os = "none")]
    if was_enabled {
        x86_64::instructions::interrupts::enable();
    }
    #[cfg(not(target_os = "none"))]
    let _ = was_enabled;
}

/// Write a byte to an I/O port. Used by the PIC, PIT, and CMOS paths.
///
/// # Safety
///
/// Port I/O has device-defined side effects; callers must follow the access
/// protocol of the device behind `port`.
pub unsafe fn outb(port: u16, value: u8) {
    // SAFETY: forwarded to the caller's contract.
    unsafe { x86_64::instructions::port::Port::new(port).write(value) }
}

/// Read a byte from an I/O port.
///
/// # Safety
///
/// See [`outb`].
pub unsafe fn inb(port: u16) -> u8 {
    // SAFETY: forwarded to the caller's contract.
    unsafe { x86_64::instructions::port::Port::new(port).read() }
}
