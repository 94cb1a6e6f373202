//! Ferrite kernel entry point.
//!
//! Boot order is load-bearing: frame allocator before anything that takes a
//! frame, heap before anything that boxes, the adopted kernel address space
//! before MMIO mapping, GDT/IDT/PIC before the first enabled interrupt, and
//! the scheduler's preemption flag last of all.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

// The bare-metal image is the real program; building for the host produces
// an empty stub so `cargo test` can link the workspace.
#[cfg(not(target_os = "none"))]
fn main() {}

#[cfg(target_os = "none")]
mod kernel_main {
    use core::panic::PanicInfo;

    use ferrite_kernel::{
        arch, boot, log_service, mm, net, println, sched, sync::WorkQueue, timer,
    };

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        println!("[KERNEL PANIC] {}", info);
        arch::halt();
    }

    #[no_mangle]
    pub extern "C" fn _start() -> ! {
        log_service::init(log::LevelFilter::Info);
        println!("Ferrite v{}", env!("CARGO_PKG_VERSION"));

        let boot_info = boot::gather();
        let (regions, count) = boot_info.regions_array();
        log::info!(target: "boot", "{} memory regions, hhdm at {:#x}", count, boot_info.hhdm_offset);

        // Physical frames, heap, kernel address space.
        if let Err(e) = mm::init(&regions[..count], boot_info.hhdm_offset) {
            panic!("memory init failed: {}", e);
        }

        // GDT/TSS, IDT, PIC remap, syscall MSRs.
        arch::init();

        // RTC snapshot + 1 kHz PIT tick (still masked behind IF=0).
        timer::init();

        // Idle thread (this context) and the reaper.
        if let Err(e) = sched::init() {
            panic!("scheduler init failed: {}", e);
        }

        // From here on the tick fires; preemption stays off a moment longer
        // so the remaining init cannot be migrated mid-way.
        arch::enable_interrupts();

        // Boot data has been copied out; loader memory returns to the pool.
        mm::frame_allocator::reclaim_bootloader_memory();

        // Deferred-work pool and the packet stack on top of the core.
        match WorkQueue::new("kworker", 2) {
            Ok(pool) => {
                // The pool lives for the kernel's lifetime.
                core::mem::forget(pool);
            }
            Err(e) => log::warn!(target: "sync", "work pool unavailable: {}", e),
        }
        net::init();

        sched::enable_preemption();
        log::info!(target: "boot", "boot complete, {} threads", sched::thread_count());

        // This context is the idle thread: run whoever is ready, halt when
        // nobody is.
        loop {
            sched::reschedule();
            arch::idle();
        }
    }
}
