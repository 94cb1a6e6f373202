//! x86_64 serial port driver for kernel log output.
//!
//! Uses the `uart_16550` crate to interface with COM1 at I/O port 0x3F8.
//! All kernel text output (print macros, logger, panics) funnels through
//! here; the port is guarded by a spinlock with interrupts disabled so IRQ
//! handlers may log without deadlocking against thread-context writers.

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = {
        // SAFETY: 0x3F8 is the standard COM1 base; the port is initialized
        // immediately after construction and only ever accessed through the
        // lock around this static.
        let mut serial_port = unsafe { SerialPort::new(0x3F8) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;

    use x86_64::instructions::interrupts;

    interrupts::without_interrupts(|| {
        // Serial write cannot fail on the 16550; the expect documents that.
        SERIAL1
            .lock()
            .write_fmt(args)
            .expect("printing to serial failed");
    });
}
