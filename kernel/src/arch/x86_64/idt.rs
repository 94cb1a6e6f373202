// Interrupt Descriptor Table

use lazy_static::lazy_static;
use x86_64::{
    registers::rflags::RFlags,
    structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode},
    PrivilegeLevel,
};

use crate::{
    irq::IrqNumber,
    sched, timer,
};

use super::{gdt, pic};

/// Vector of the int 0x80 system-call gate.
pub const SYSCALL_VECTOR: u8 = 0x80;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        // CPU exceptions (vectors 0..32).
        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.debug.set_handler_fn(debug_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.overflow.set_handler_fn(overflow_handler);
        idt.bound_range_exceeded.set_handler_fn(bound_range_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.device_not_available.set_handler_fn(device_not_available_handler);
        idt.invalid_tss.set_handler_fn(invalid_tss_handler);
        idt.segment_not_present.set_handler_fn(segment_not_present_handler);
        idt.stack_segment_fault.set_handler_fn(stack_segment_handler);
        idt.general_protection_fault.set_handler_fn(general_protection_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.x87_floating_point.set_handler_fn(x87_floating_point_handler);
        idt.alignment_check.set_handler_fn(alignment_check_handler);
        idt.simd_floating_point.set_handler_fn(simd_floating_point_handler);
        idt.virtualization.set_handler_fn(virtualization_handler);

        // Faults that must survive a corrupt task stack run on IST stacks.
        // SAFETY: the IST indices match stacks installed in the TSS by
        // gdt::init, which runs before this table is loaded.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
            idt.non_maskable_interrupt
                .set_handler_fn(nmi_handler)
                .set_stack_index(gdt::NMI_IST_INDEX);
            idt.machine_check
                .set_handler_fn(machine_check_handler)
                .set_stack_index(gdt::MACHINE_CHECK_IST_INDEX);
        }

        // Every remaining vector gets a stub so a stray interrupt can never
        // hit a missing gate.
        for vector in 32..=255u8 {
            idt[vector].set_handler_fn(unexpected_interrupt_handler);
        }

        // Remapped PIC lines.
        idt[pic::PIC_1_OFFSET].set_handler_fn(timer_interrupt_handler);
        idt[pic::PIC_1_OFFSET + 1].set_handler_fn(irq1_handler);
        idt[pic::PIC_1_OFFSET + 2].set_handler_fn(irq2_handler);
        idt[pic::PIC_1_OFFSET + 3].set_handler_fn(irq3_handler);
        idt[pic::PIC_1_OFFSET + 4].set_handler_fn(irq4_handler);
        idt[pic::PIC_1_OFFSET + 5].set_handler_fn(irq5_handler);
        idt[pic::PIC_1_OFFSET + 6].set_handler_fn(irq6_handler);
        idt[pic::PIC_1_OFFSET + 7].set_handler_fn(irq7_handler);
        idt[pic::PIC_1_OFFSET + 8].set_handler_fn(irq8_handler);
        idt[pic::PIC_1_OFFSET + 9].set_handler_fn(irq9_handler);
        idt[pic::PIC_1_OFFSET + 10].set_handler_fn(irq10_handler);
        idt[pic::PIC_1_OFFSET + 11].set_handler_fn(irq11_handler);
        idt[pic::PIC_1_OFFSET + 12].set_handler_fn(irq12_handler);
        idt[pic::PIC_1_OFFSET + 13].set_handler_fn(irq13_handler);
        idt[pic::PIC_1_OFFSET + 14].set_handler_fn(irq14_handler);
        idt[pic::PIC_1_OFFSET + 15].set_handler_fn(irq15_handler);

        // System-call gate: reachable from ring 3.
        idt[SYSCALL_VECTOR]
            .set_handler_fn(syscall_handler)
            .set_privilege_level(PrivilegeLevel::Ring3);

        idt
    };
}

pub fn init() {
    IDT.load();
}

// ---------------------------------------------------------------------------
// Exceptions
// ---------------------------------------------------------------------------

/// Log the exception context and stop the machine.
fn fatal_exception(name: &str, error_code: Option<u64>, stack_frame: &InterruptStackFrame) -> ! {
    log::error!(
        target: "arch",
        "EXCEPTION: {} (error code {:#x}) at rip {:#x}, rsp {:#x}",
        name,
        error_code.unwrap_or(0),
        stack_frame.instruction_pointer.as_u64(),
        stack_frame.stack_pointer.as_u64(),
    );
    super::halt();
}

extern "x86-interrupt" fn divide_error_handler(stack_frame: InterruptStackFrame) {
    fatal_exception("divide error", None, &stack_frame);
}

/// Debug exception: a single-step trap clears the trap flag in the saved
/// RFLAGS and resumes; DR6 is zeroed so the next trap reports fresh status.
extern "x86-interrupt" fn debug_handler(mut stack_frame: InterruptStackFrame) {
    let dr6 = read_dr6();
    // Bit 14 = single-step.
    if dr6 & (1 << 14) != 0 {
        // SAFETY: clearing TF in the saved flags only stops further
        // single-stepping of the interrupted code.
        unsafe {
            stack_frame.as_mut().update(|frame| {
                frame.cpu_flags &= !RFlags::TRAP_FLAG;
            });
        }
    }
    write_dr6(0);
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    log::warn!(
        target: "arch",
        "breakpoint at {:#x}",
        stack_frame.instruction_pointer.as_u64()
    );
}

extern "x86-interrupt" fn overflow_handler(stack_frame: InterruptStackFrame) {
    fatal_exception("overflow", None, &stack_frame);
}

extern "x86-interrupt" fn bound_range_handler(stack_frame: InterruptStackFrame) {
    fatal_exception("bound range exceeded", None, &stack_frame);
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    fatal_exception("invalid opcode", None, &stack_frame);
}

extern "x86-interrupt" fn device_not_available_handler(stack_frame: InterruptStackFrame) {
    fatal_exception("device not available", None, &stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    fatal_exception("double fault", Some(error_code), &stack_frame);
}

extern "x86-interrupt" fn nmi_handler(_stack_frame: InterruptStackFrame) {
    // Nothing to service; NMIs on this platform mean hardware trouble.
    log::error!(target: "arch", "non-maskable interrupt");
}

extern "x86-interrupt" fn invalid_tss_handler(stack_frame: InterruptStackFrame, error_code: u64) {
    fatal_exception("invalid TSS", Some(error_code), &stack_frame);
}

extern "x86-interrupt" fn segment_not_present_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    fatal_exception("segment not present", Some(error_code), &stack_frame);
}

extern "x86-interrupt" fn stack_segment_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    fatal_exception("stack-segment fault", Some(error_code), &stack_frame);
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    fatal_exception("general protection fault", Some(error_code), &stack_frame);
}

/// Page fault: delegate to the VMM. The only exception gate allowed to
/// resume after logging (when the VMM recovers the fault).
extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    let addr = Cr2::read().map(|a| a.as_u64()).unwrap_or(0);
    if crate::mm::page_fault::handle(addr, error_code.bits()) {
        return;
    }
    fatal_exception("page fault", Some(error_code.bits()), &stack_frame);
}

extern "x86-interrupt" fn x87_floating_point_handler(stack_frame: InterruptStackFrame) {
    fatal_exception("x87 floating point", None, &stack_frame);
}

extern "x86-interrupt" fn alignment_check_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    fatal_exception("alignment check", Some(error_code), &stack_frame);
}

extern "x86-interrupt" fn machine_check_handler(stack_frame: InterruptStackFrame) -> ! {
    fatal_exception("machine check", None, &stack_frame);
}

extern "x86-interrupt" fn simd_floating_point_handler(stack_frame: InterruptStackFrame) {
    fatal_exception("SIMD floating point", None, &stack_frame);
}

extern "x86-interrupt" fn virtualization_handler(stack_frame: InterruptStackFrame) {
    fatal_exception("virtualization", None, &stack_frame);
}

fn read_dr6() -> u64 {
    let dr6: u64;
    // SAFETY: reading DR6 has no side effects in ring 0.
    unsafe {
        core::arch::asm!("mov {}, dr6", out(reg) dr6, options(nomem, nostack));
    }
    dr6
}

fn write_dr6(value: u64) {
    // SAFETY: DR6 is status-only; writing it cannot fault in ring 0.
    unsafe {
        core::arch::asm!("mov dr6, {}", in(reg) value, options(nomem, nostack));
    }
}

// ---------------------------------------------------------------------------
// Hardware interrupts
// ---------------------------------------------------------------------------

/// IRQ 0: the tick. Count, acknowledge, then let the scheduler wake
/// sleepers and take the CPU away if a switch is due.
extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    let now = timer::bump_tick();
    pic::end_of_interrupt(pic::PIC_1_OFFSET);
    sched::timer_tick(now);
    sched::preempt_point();
}

/// Generate the non-timer IRQ handlers: dispatch to the registered device
/// callback (which clears the device-side cause), then acknowledge.
macro_rules! irq_handlers {
    ($(($name:ident, $line:literal)),+ $(,)?) => {
        $(
            extern "x86-interrupt" fn $name(_stack_frame: InterruptStackFrame) {
                crate::irq::dispatch(IrqNumber::new($line));
                pic::end_of_interrupt(pic::PIC_1_OFFSET + $line);
            }
        )+
    };
}

irq_handlers!(
    (irq1_handler, 1),
    (irq2_handler, 2),
    (irq3_handler, 3),
    (irq4_handler, 4),
    (irq5_handler, 5),
    (irq6_handler, 6),
    (irq7_handler, 7),
    (irq8_handler, 8),
    (irq9_handler, 9),
    (irq10_handler, 10),
    (irq11_handler, 11),
    (irq12_handler, 12),
    (irq13_handler, 13),
    (irq14_handler, 14),
    (irq15_handler, 15),
);

/// Vectors nobody asked for: acknowledge if the PIC owns them, else ignore.
extern "x86-interrupt" fn unexpected_interrupt_handler(_stack_frame: InterruptStackFrame) {
    // Without the vector number there is nothing to dispatch; PIC lines all
    // have explicit stubs, so this can only be a software-triggered or
    // spurious vector.
}

// ---------------------------------------------------------------------------
// System calls
// ---------------------------------------------------------------------------

/// int 0x80 entry (DPL=3). The syscall table proper lives above the core;
/// unknown numbers are logged and ignored.
extern "x86-interrupt" fn syscall_handler(_stack_frame: InterruptStackFrame) {
    log::debug!(target: "arch", "int 0x80 system call");
}
