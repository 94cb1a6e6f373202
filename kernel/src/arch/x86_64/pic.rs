//! Legacy 8259 PIC pair.
//!
//! The two controllers are remapped away from the CPU exception range before
//! anything is unmasked: master IRQ 0..7 become vectors 32..39, slave 8..15
//! become 40..47, cascaded on IRQ 2. EOI for a slave line goes to the slave
//! first, then the master; `pic8259` handles that ordering.

use pic8259::ChainedPics;
use spin::Mutex;

/// First vector of the master PIC after remapping.
pub const PIC_1_OFFSET: u8 = 32;
/// First vector of the slave PIC after remapping.
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// Number of legacy IRQ lines (both controllers).
pub const IRQ_LINES: u8 = 16;

// SAFETY: The offsets place IRQ vectors at 32..48, clear of CPU exceptions.
static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Remap both controllers (ICW1=0x11, ICW2=0x20/0x28, ICW3=0x04/0x02,
/// ICW4=0x01) and unmask every line. Individual devices that want to stay
/// quiet simply never register a handler.
#[cfg(target_os = "none")]
pub fn init() {
    // SAFETY: The initialization sequence is the one defined by the 8259
    // datasheet; interrupts are still disabled at this point of boot, so no
    // vector can fire mid-sequence.
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        // Unmask all lines on both controllers.
        pics.write_masks(0x00, 0x00);
    }
}

/// Signal end-of-interrupt for the given vector (32..48).
///
/// Must be issued before the handler returns; for level-triggered sources the
/// device-side cause must already be cleared or the line re-fires.
pub fn end_of_interrupt(vector: u8) {
    // SAFETY: notify_end_of_interrupt writes the EOI command to the correct
    // controller(s) for this vector; harmless for vectors we own.
    unsafe {
        PICS.lock().notify_end_of_interrupt(vector);
    }
}

/// Does this vector belong to the remapped PIC range?
pub fn owns_vector(vector: u8) -> bool {
    (PIC_1_OFFSET..PIC_1_OFFSET + IRQ_LINES).contains(&vector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_range() {
        assert!(owns_vector(32));
        assert!(owns_vector(47));
        assert!(!owns_vector(48));
        assert!(!owns_vector(14));
    }
}
