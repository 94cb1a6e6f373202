//! Page-fault decoding and dispatch.
//!
//! The IDT's page-fault gate lands here with the CPU error code and the
//! faulting linear address (CR2). Known-recoverable faults get fixed and
//! resumed; everything else logs the decoded cause and halts the system --
//! a wild kernel access is not survivable.

use super::VirtualAddress;

bitflags::bitflags! {
    /// x86-64 page-fault error code bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultCode: u64 {
        /// Set: protection violation. Clear: non-present page.
        const PROTECTION     = 1 << 0;
        /// Set: caused by a write. Clear: a read.
        const WRITE          = 1 << 1;
        /// Set: fault in user mode.
        const USER           = 1 << 2;
        /// Reserved bit set in a paging structure.
        const RESERVED_BIT   = 1 << 3;
        /// Instruction fetch (with NXE).
        const INSTRUCTION    = 1 << 4;
    }
}

/// Human-readable cause summary for the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    pub addr: VirtualAddress,
    pub code: FaultCode,
}

impl FaultInfo {
    pub fn new(addr: u64, raw_code: u64) -> Self {
        Self {
            addr: VirtualAddress::new(addr),
            code: FaultCode::from_bits_truncate(raw_code),
        }
    }

    pub fn access(&self) -> &'static str {
        if self.code.contains(FaultCode::INSTRUCTION) {
            "instruction fetch"
        } else if self.code.contains(FaultCode::WRITE) {
            "write"
        } else {
            "read"
        }
    }

    pub fn cause(&self) -> &'static str {
        if self.code.contains(FaultCode::RESERVED_BIT) {
            "reserved bit set"
        } else if self.code.contains(FaultCode::PROTECTION) {
            "protection violation"
        } else {
            "page not present"
        }
    }

    pub fn mode(&self) -> &'static str {
        if self.code.contains(FaultCode::USER) {
            "user"
        } else {
            "supervisor"
        }
    }
}

/// Try to service a fault without killing the system.
///
/// This is the hook for reclaim-style fixups (lazily mapped regions,
/// copy-on-write); the base kernel registers none, so every fault falls
/// through to the fatal path. Returns whether the fault was handled.
pub fn try_recover(info: &FaultInfo) -> bool {
    let _ = info;
    false
}

/// The page-fault entry point called from the IDT gate.
///
/// Returns normally only when the fault was recovered; this is the only
/// exception path allowed to resume after logging.
pub fn handle(addr: u64, raw_code: u64) -> bool {
    let info = FaultInfo::new(addr, raw_code);

    if try_recover(&info) {
        return true;
    }

    log::error!(
        target: "vmm",
        "page fault at {:#x}: {} during {} in {} mode",
        info.addr.as_u64(),
        info.cause(),
        info.access(),
        info.mode(),
    );
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_write_to_unmapped() {
        let info = FaultInfo::new(0xDEAD_B000, 0b00010);
        assert_eq!(info.access(), "write");
        assert_eq!(info.cause(), "page not present");
        assert_eq!(info.mode(), "supervisor");
    }

    #[test]
    fn decodes_user_instruction_fetch() {
        let info = FaultInfo::new(0x4000_0000, 0b10101);
        assert_eq!(info.access(), "instruction fetch");
        assert_eq!(info.cause(), "protection violation");
        assert_eq!(info.mode(), "user");
    }

    #[test]
    fn reserved_bit_dominates_cause() {
        let info = FaultInfo::new(0x1000, 0b01001);
        assert_eq!(info.cause(), "reserved bit set");
    }

    #[test]
    fn unrecovered_fault_reports_fatal() {
        assert!(!handle(0xFFFF_FFFF_0000_0000, 0));
    }
}
