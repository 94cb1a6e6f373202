//! Boot protocol handoff.
//!
//! Talks to a Limine-class loader through its request/response protocol and
//! repackages the answers (memory map, HHDM offset, framebuffer geometry)
//! into plain kernel types so nothing downstream depends on loader structs.
//! The memory map is copied into a fixed array: the loader's own copy lives
//! in reclaimable memory and dies with it.

use crate::mm::{MemoryRegion, MemoryRegionKind};

/// Fixed capacity for the copied memory map; PC firmware maps run far
/// below this.
pub const MAX_MEMORY_REGIONS: usize = 64;

/// Everything the kernel keeps from the loader handoff.
#[derive(Debug, Clone, Copy)]
pub struct BootInfo {
    pub memory_map: [Option<MemoryRegion>; MAX_MEMORY_REGIONS],
    pub region_count: usize,
    pub hhdm_offset: u64,
    pub framebuffer: Option<FramebufferInfo>,
}

/// Boot framebuffer geometry, for the console driver stacked on the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferInfo {
    pub phys_base: u64,
    pub width: u64,
    pub height: u64,
    pub pitch: u64,
    pub bpp: u16,
}

impl BootInfo {
    /// The populated prefix of the copied memory map.
    pub fn regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.memory_map.iter().take(self.region_count).flatten()
    }

    /// Collect the populated regions into a slice-backed buffer.
    pub fn regions_array(&self) -> ([MemoryRegion; MAX_MEMORY_REGIONS], usize) {
        let mut out = [MemoryRegion {
            base: 0,
            length: 0,
            kind: MemoryRegionKind::Reserved,
        }; MAX_MEMORY_REGIONS];
        let mut count = 0;
        for region in self.regions() {
            out[count] = *region;
            count += 1;
        }
        (out, count)
    }
}

#[cfg(target_os = "none")]
mod limine_boot {
    use limine::memory_map::EntryType;
    use limine::request::{
        FramebufferRequest, HhdmRequest, MemoryMapRequest, RequestsEndMarker,
        RequestsStartMarker,
    };
    use limine::BaseRevision;

    use super::*;

    #[used]
    #[link_section = ".requests_start_marker"]
    static REQUESTS_START: RequestsStartMarker = RequestsStartMarker::new();

    #[used]
    #[link_section = ".requests"]
    static BASE_REVISION: BaseRevision = BaseRevision::new();

    #[used]
    #[link_section = ".requests"]
    static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

    #[used]
    #[link_section = ".requests"]
    static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

    #[used]
    #[link_section = ".requests"]
    static FRAMEBUFFER_REQUEST: FramebufferRequest = FramebufferRequest::new();

    #[used]
    #[link_section = ".requests_end_marker"]
    static REQUESTS_END: RequestsEndMarker = RequestsEndMarker::new();

    fn classify(entry_type: EntryType) -> MemoryRegionKind {
        if entry_type == EntryType::USABLE {
            MemoryRegionKind::Usable
        } else if entry_type == EntryType::BOOTLOADER_RECLAIMABLE {
            MemoryRegionKind::BootloaderReclaimable
        } else if entry_type == EntryType::EXECUTABLE_AND_MODULES {
            MemoryRegionKind::KernelAndModules
        } else if entry_type == EntryType::ACPI_RECLAIMABLE || entry_type == EntryType::ACPI_NVS {
            MemoryRegionKind::Acpi
        } else if entry_type == EntryType::FRAMEBUFFER {
            MemoryRegionKind::Framebuffer
        } else {
            MemoryRegionKind::Reserved
        }
    }

    /// Collect the loader's responses. Panics when a mandatory response is
    /// missing: without a memory map or HHDM there is no kernel to run.
    pub fn gather() -> BootInfo {
        assert!(
            BASE_REVISION.is_supported(),
            "bootloader does not speak our base revision"
        );

        let memory_map = MEMORY_MAP_REQUEST
            .get_response()
            .expect("bootloader provided no memory map");
        let hhdm = HHDM_REQUEST
            .get_response()
            .expect("bootloader provided no HHDM offset");

        let mut info = BootInfo {
            memory_map: [None; MAX_MEMORY_REGIONS],
            region_count: 0,
            hhdm_offset: hhdm.offset(),
            framebuffer: None,
        };

        for entry in memory_map.entries().iter() {
            if info.region_count == MAX_MEMORY_REGIONS {
                log::warn!(target: "boot", "memory map truncated at {} entries", MAX_MEMORY_REGIONS);
                break;
            }
            info.memory_map[info.region_count] = Some(MemoryRegion {
                base: entry.base,
                length: entry.length,
                kind: classify(entry.entry_type),
            });
            info.region_count += 1;
        }

        if let Some(fb_response) = FRAMEBUFFER_REQUEST.get_response() {
            if let Some(fb) = fb_response.framebuffers().next() {
                info.framebuffer = Some(FramebufferInfo {
                    phys_base: fb.addr() as u64 - info.hhdm_offset,
                    width: fb.width(),
                    height: fb.height(),
                    pitch: fb.pitch(),
                    bpp: fb.bpp(),
                });
            }
        }

        info
    }
}

#[cfg(target_os = "none")]
pub use limine_boot::gather;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_iterates_populated_prefix() {
        let mut info = BootInfo {
            memory_map: [None; MAX_MEMORY_REGIONS],
            region_count: 0,
            hhdm_offset: 0xFFFF_8000_0000_0000,
            framebuffer: None,
        };
        info.memory_map[0] = Some(MemoryRegion {
            base: 0x100000,
            length: 0x100000,
            kind: MemoryRegionKind::Usable,
        });
        info.memory_map[1] = Some(MemoryRegion {
            base: 0x200000,
            length: 0x8000,
            kind: MemoryRegionKind::BootloaderReclaimable,
        });
        info.region_count = 2;

        let (regions, count) = info.regions_array();
        assert_eq!(count, 2);
        assert_eq!(regions[0].kind, MemoryRegionKind::Usable);
        assert_eq!(regions[1].base, 0x200000);
    }
}
