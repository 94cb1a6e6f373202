//! Kernel heap.
//!
//! A linked-list allocator fed with one physically contiguous run of frames
//! through the HHDM. Sized for kernel bookkeeping (thread records, queue
//! nodes, packet buffers); anything page-granular goes straight to the
//! frame allocator instead.

use crate::error::KernelResult;

/// Heap size in frames (4 MiB).
pub const HEAP_FRAMES: usize = 1024;

/// Carve the heap out of the frame allocator and hand it to the global
/// allocator. Must run before the first `alloc` use on the bare-metal
/// target.
#[cfg(target_os = "none")]
pub fn init() -> KernelResult<()> {
    let base = super::frame_allocator::alloc_contig(HEAP_FRAMES)?;
    let size = HEAP_FRAMES * super::FRAME_SIZE;

    // SAFETY: the frames were just allocated for exclusive heap use and are
    // mapped writable through the HHDM; init is called exactly once.
    unsafe {
        crate::get_allocator()
            .lock()
            .init(base.as_mut_ptr::<u8>(), size);
    }
    Ok(())
}

#[cfg(not(target_os = "none"))]
pub fn init() -> KernelResult<()> {
    // Host build: the system allocator is already in place.
    Ok(())
}
