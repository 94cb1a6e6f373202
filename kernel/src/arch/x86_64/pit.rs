//! Legacy PIT (8253/8254) channel 0 programming.
//!
//! Channel 0 is wired to IRQ 0 and drives the scheduler tick. It is
//! programmed once at boot for a periodic square wave at [`TICK_HZ`].

/// PIT input clock in Hz.
pub const PIT_BASE_HZ: u32 = 1_193_182;

/// Tick frequency the kernel programs at boot.
pub const TICK_HZ: u32 = 1000;

/// Channel 0 data port.
const PIT_CHANNEL0: u16 = 0x40;
/// Mode/command register.
const PIT_COMMAND: u16 = 0x43;

/// Command byte: channel 0, lobyte/hibyte access, mode 3 (square wave).
const PIT_CMD_SQUARE_WAVE: u8 = 0x36;

/// Compute the 16-bit divisor for the requested frequency.
///
/// The divisor is clamped to the programmable range; a divisor of 0 means
/// 65536 to the hardware, which would be the slowest rate, so requests below
/// ~19 Hz saturate there.
pub fn divisor_for(hz: u32) -> u16 {
    let div = PIT_BASE_HZ / hz.max(1);
    div.min(u16::MAX as u32) as u16
}

/// Program channel 0 for a periodic tick at `hz`.
#[cfg(target_os = "none")]
pub fn program(hz: u32) {
    let divisor = divisor_for(hz);

    // SAFETY: The PIT access protocol is command byte on 0x43, then divisor
    // low-then-high on 0x40. Interrupts are disabled during boot bring-up so
    // the two-byte write cannot be torn by an IRQ.
    unsafe {
        super::outb(PIT_COMMAND, PIT_CMD_SQUARE_WAVE);
        super::outb(PIT_CHANNEL0, (divisor & 0xFF) as u8);
        super::outb(PIT_CHANNEL0, (divisor >> 8) as u8);
    }

    log::info!(target: "timer", "PIT channel 0 at {} Hz (divisor {})", hz, divisor);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divisor_1khz() {
        // 1193182 / 1000 = 1193
        assert_eq!(divisor_for(1000), 1193);
    }

    #[test]
    fn divisor_clamps_to_16_bits() {
        assert_eq!(divisor_for(1), u16::MAX);
        // 100 Hz fits comfortably
        assert_eq!(divisor_for(100), 11931);
    }
}
