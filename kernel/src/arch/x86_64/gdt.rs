// Global Descriptor Table

use lazy_static::lazy_static;
use x86_64::{
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

/// IST slot for the double-fault handler.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;
/// IST slot for the NMI handler.
pub const NMI_IST_INDEX: u16 = 1;
/// IST slot for the machine-check handler.
pub const MACHINE_CHECK_IST_INDEX: u16 = 2;

/// Size of each dedicated exception stack.
const IST_STACK_SIZE: usize = 4096 * 5;

/// Statically allocated, 16-byte aligned exception stack.
#[repr(align(16))]
#[allow(dead_code)] // accessed via raw pointer only
struct AlignedStack([u8; IST_STACK_SIZE]);

macro_rules! ist_stack_top {
    () => {{
        static mut STACK: AlignedStack = AlignedStack([0; IST_STACK_SIZE]);
        let stack_ptr = &raw const STACK;
        VirtAddr::from_ptr(stack_ptr) + IST_STACK_SIZE as u64
    }};
}

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();

        // Ring 3 -> Ring 0 transition stack. Replaced per-thread by the
        // scheduler via set_kernel_stack.
        tss.privilege_stack_table[0] = ist_stack_top!();

        // Dedicated stacks so these faults stay serviceable even when the
        // task stack is corrupt or exhausted.
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = ist_stack_top!();
        tss.interrupt_stack_table[NMI_IST_INDEX as usize] = ist_stack_top!();
        tss.interrupt_stack_table[MACHINE_CHECK_IST_INDEX as usize] = ist_stack_top!();
        tss
    };
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.append(Descriptor::kernel_code_segment());    // 0x08
        let data_selector = gdt.append(Descriptor::kernel_data_segment());    // 0x10
        let tss_selector = gdt.append(Descriptor::tss_segment(&TSS));         // 0x18 (2 entries)
        let user_data_selector = gdt.append(Descriptor::user_data_segment()); // 0x28 (+ RPL 3 = 0x2B)
        let user_code_selector = gdt.append(Descriptor::user_code_segment()); // 0x30 (+ RPL 3 = 0x33)
        (
            gdt,
            Selectors {
                code_selector,
                data_selector,
                tss_selector,
                user_data_selector,
                user_code_selector,
            },
        )
    };
}

/// GDT segment selectors for kernel and user mode.
///
/// Layout:
/// - 0x00: Null descriptor
/// - 0x08: Kernel code segment (Ring 0)
/// - 0x10: Kernel data segment (Ring 0)
/// - 0x18: TSS (occupies 2 entries, 0x18-0x20)
/// - 0x28: User data segment (Ring 3, selector 0x2B with RPL)
/// - 0x30: User code segment (Ring 3, selector 0x33 with RPL)
///
/// The user data/code order matches SYSRET expectations:
/// SYSRET computes SS = STAR[63:48]+8, CS = STAR[63:48]+16.
pub struct Selectors {
    pub code_selector: SegmentSelector,
    pub data_selector: SegmentSelector,
    pub tss_selector: SegmentSelector,
    pub user_data_selector: SegmentSelector,
    pub user_code_selector: SegmentSelector,
}

#[cfg(target_os = "none")]
pub fn init() {
    use x86_64::instructions::{
        segmentation::{Segment, CS, DS, ES, SS},
        tables::load_tss,
    };

    GDT.0.load();
    // SAFETY: After loading the GDT the segment registers must reference the
    // new descriptors. The selectors come from GDT.1, computed from the same
    // table just loaded, so every selector indexes a valid descriptor.
    unsafe {
        CS::set_reg(GDT.1.code_selector);
        DS::set_reg(GDT.1.data_selector);
        ES::set_reg(GDT.1.data_selector);
        SS::set_reg(GDT.1.data_selector);
        load_tss(GDT.1.tss_selector);
    }
}

/// Returns the GDT selectors (kernel and user mode).
pub fn selectors() -> &'static Selectors {
    &GDT.1
}

/// Update the kernel stack pointer in the TSS (RSP0).
///
/// Called on context switch so Ring 3 -> Ring 0 transitions land on the new
/// thread's kernel stack. Must be called with interrupts disabled.
pub fn set_kernel_stack(stack_top: u64) {
    // SAFETY: The TSS is a static initialized during boot. This is only
    // called from the scheduler with interrupts disabled, so there is no
    // concurrent access to privilege_stack_table[0].
    unsafe {
        let tss_ptr = &*TSS as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss_ptr).privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}

/// Read the current kernel stack pointer from the TSS (RSP0).
pub fn get_kernel_stack() -> u64 {
    TSS.privilege_stack_table[0].as_u64()
}
