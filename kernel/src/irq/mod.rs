//! IRQ dispatch.
//!
//! A fixed table mapping legacy IRQ lines (0..16, vectors 32..48 after the
//! PIC remap) to registered device handlers. The interrupt stubs in
//! `arch::x86_64::idt` call [`dispatch`]; unknown IRQs are acknowledged and
//! otherwise ignored. Handlers run with interrupts disabled on the
//! interrupted thread's stack: they must not allocate, block, or take
//! anything but IRQ-safe spinlocks.

use crate::{
    arch::x86_64::pic,
    error::{KernelError, KernelResult},
    sync::IrqSpinLock,
};

/// A legacy IRQ line number (0..16).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IrqNumber(pub u8);

impl IrqNumber {
    pub const TIMER: Self = Self(0);
    pub const KEYBOARD: Self = Self(1);
    pub const CASCADE: Self = Self(2);
    pub const MOUSE: Self = Self(12);
    pub const ATA_PRIMARY: Self = Self(14);
    pub const ATA_SECONDARY: Self = Self(15);

    pub const fn new(irq: u8) -> Self {
        Self(irq)
    }

    /// The CPU vector this line lands on after the PIC remap.
    pub const fn vector(self) -> u8 {
        pic::PIC_1_OFFSET + self.0
    }

    /// Recover the line number from a remapped vector.
    pub fn from_vector(vector: u8) -> Option<Self> {
        if pic::owns_vector(vector) {
            Some(Self(vector - pic::PIC_1_OFFSET))
        } else {
            None
        }
    }
}

impl core::fmt::Display for IrqNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "IRQ#{}", self.0)
    }
}

/// Device callback invoked in interrupt context.
pub type IrqHandler = fn(IrqNumber);

/// Handler slots plus dispatch statistics.
struct IrqTable {
    handlers: [Option<IrqHandler>; pic::IRQ_LINES as usize],
    dispatched: u64,
    spurious: u64,
}

impl IrqTable {
    const fn new() -> Self {
        Self {
            handlers: [None; pic::IRQ_LINES as usize],
            dispatched: 0,
            spurious: 0,
        }
    }
}

static IRQ_TABLE: IrqSpinLock<IrqTable> = IrqSpinLock::new(IrqTable::new());

/// Register a device handler for an IRQ line. One handler per line.
pub fn register_handler(irq: IrqNumber, handler: IrqHandler) -> KernelResult<()> {
    if irq.0 >= pic::IRQ_LINES {
        return Err(KernelError::InvalidArgument {
            name: "irq",
            value: "line out of range",
        });
    }
    let mut table = IRQ_TABLE.lock();
    let slot = &mut table.handlers[irq.0 as usize];
    if slot.is_some() {
        return Err(KernelError::AlreadyExists {
            resource: "irq handler",
            id: irq.0 as u64,
        });
    }
    *slot = Some(handler);
    log::debug!(target: "irq", "handler registered for {}", irq);
    Ok(())
}

/// Remove the handler for an IRQ line.
pub fn unregister_handler(irq: IrqNumber) -> KernelResult<()> {
    if irq.0 >= pic::IRQ_LINES {
        return Err(KernelError::InvalidArgument {
            name: "irq",
            value: "line out of range",
        });
    }
    let mut table = IRQ_TABLE.lock();
    if table.handlers[irq.0 as usize].take().is_none() {
        return Err(KernelError::NotFound {
            resource: "irq handler",
            id: irq.0 as u64,
        });
    }
    Ok(())
}

/// Route an interrupt to its registered handler.
///
/// Called by the IRQ stubs with interrupts disabled. Unregistered lines are
/// counted and silently dropped; the stub still acknowledges them so the
/// PIC keeps delivering.
pub fn dispatch(irq: IrqNumber) {
    let handler = {
        let mut table = IRQ_TABLE.lock();
        if irq.0 >= pic::IRQ_LINES {
            return;
        }
        match table.handlers[irq.0 as usize] {
            Some(handler) => {
                table.dispatched += 1;
                Some(handler)
            }
            None => {
                table.spurious += 1;
                None
            }
        }
    };
    // The handler runs outside the table lock so it may register or
    // unregister lines itself.
    if let Some(handler) = handler {
        handler(irq);
    }
}

/// (dispatched, spurious) counts since boot.
pub fn stats() -> (u64, u64) {
    let table = IRQ_TABLE.lock();
    (table.dispatched, table.spurious)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    static FIRED: AtomicU32 = AtomicU32::new(0);

    fn test_handler(_irq: IrqNumber) {
        FIRED.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn vector_mapping_round_trips() {
        assert_eq!(IrqNumber::TIMER.vector(), 32);
        assert_eq!(IrqNumber::ATA_SECONDARY.vector(), 47);
        assert_eq!(IrqNumber::from_vector(33), Some(IrqNumber::KEYBOARD));
        assert_eq!(IrqNumber::from_vector(48), None);
        assert_eq!(IrqNumber::from_vector(13), None);
    }

    #[test]
    fn register_dispatch_unregister() {
        let line = IrqNumber::new(5);
        register_handler(line, test_handler).unwrap();
        // Double registration is refused.
        assert!(register_handler(line, test_handler).is_err());

        let before = FIRED.load(Ordering::Relaxed);
        dispatch(line);
        assert_eq!(FIRED.load(Ordering::Relaxed), before + 1);

        unregister_handler(line).unwrap();
        assert!(unregister_handler(line).is_err());

        // Unknown line: silently dropped.
        dispatch(line);
        assert_eq!(FIRED.load(Ordering::Relaxed), before + 1);
    }

    #[test]
    fn out_of_range_lines_rejected() {
        assert!(register_handler(IrqNumber::new(16), test_handler).is_err());
        assert!(unregister_handler(IrqNumber::new(200)).is_err());
    }
}
