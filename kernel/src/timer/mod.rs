//! Timer and clock.
//!
//! The PIT drives a 1 kHz tick. The tick handler increments a monotonic
//! 64-bit counter, and -- once the scheduler has flipped its
//! preemption flag -- feeds the scheduler's tick function. Wall-clock time
//! is an RTC snapshot taken at boot plus the tick-derived uptime.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::x86_64::pit;

/// Tick frequency programmed at boot.
pub const HZ: u32 = pit::TICK_HZ;

/// Monotonic tick counter, incremented by the timer interrupt.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Seconds since the Unix epoch at the moment the tick counter read zero.
static BOOT_EPOCH_SECS: AtomicU64 = AtomicU64::new(0);

/// Program the tick source and snapshot the wall clock.
///
/// Interrupts are still masked when this runs; the first tick arrives once
/// boot enables them.
#[cfg(target_os = "none")]
pub fn init() {
    use crate::arch::x86_64::rtc;

    let time = rtc::read_rtc();
    let epoch = rtc::rtc_to_epoch(&time);
    BOOT_EPOCH_SECS.store(epoch, Ordering::Relaxed);
    log::info!(
        target: "timer",
        "RTC {:04}-{:02}-{:02} {:02}:{:02}:{:02} (epoch {})",
        time.year, time.month, time.day, time.hour, time.minute, time.second, epoch,
    );

    pit::program(HZ);
}

/// Ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Uptime in milliseconds.
pub fn uptime_ms() -> u64 {
    ticks_to_ms(ticks())
}

/// Convert a tick count to milliseconds.
///
/// The kernel runs at 1 kHz, so the common case is the identity and skips
/// the 64-bit division.
pub fn ticks_to_ms(ticks: u64) -> u64 {
    if HZ == 1000 {
        ticks
    } else {
        ticks * 1000 / HZ as u64
    }
}

/// Convert milliseconds to ticks (rounding up so sleeps never undershoot).
pub fn ms_to_ticks(ms: u64) -> u64 {
    if HZ == 1000 {
        ms
    } else {
        (ms * HZ as u64).div_ceil(1000)
    }
}

/// Wall-clock seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    BOOT_EPOCH_SECS.load(Ordering::Relaxed) + uptime_ms() / 1000
}

/// Count one tick. Called first thing in the timer interrupt; the stub then
/// sends EOI and only afterwards runs the scheduler tick, so a context
/// switch inside the handler cannot block further ticks.
pub fn bump_tick() -> u64 {
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}

/// Test hook: advance the tick counter without hardware.
#[cfg(test)]
pub(crate) fn advance_ticks_for_test(n: u64) {
    TICKS.fetch_add(n, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_ms_conversions_at_1khz() {
        assert_eq!(ticks_to_ms(0), 0);
        assert_eq!(ticks_to_ms(1500), 1500);
        assert_eq!(ms_to_ticks(250), 250);
    }

    #[test]
    fn monotonic_counter_advances() {
        let before = ticks();
        advance_ticks_for_test(5);
        assert_eq!(ticks(), before + 5);
    }
}
