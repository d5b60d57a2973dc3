//! Makes host memory visible to the SeaStar through its HyperTransport bridge map.
//!
//! Two consecutive 256 MiB map entries cover a 512 MiB window of host physical memory,
//! starting at the 256 MiB boundary at or below the host region the driver needs the firmware to see.
//! Firmware addresses of host memory inside that window are tagged with [`HOST_SPACE_TAG`].

use nic_buffers::PhysicalAddress;
use seastar_firmware::{htb_map_entry, SeaStarMemory, HTB_MAP_VALID};

/// log2 of the granularity of one HTB map entry.
pub const HTB_MAP_SHIFT:    usize = 28;
/// The first HTB map entry used for host memory.
pub const HTB_MAP_INDEX:    usize = 8;
/// Number of consecutive map entries used for host memory.
pub const HTB_MAP_ENTRIES:  usize = 2;
/// Size of the host memory window seen by the firmware.
pub const WINDOW_SIZE:      usize = HTB_MAP_ENTRIES << HTB_MAP_SHIFT;
/// High-order bits that tell the firmware an address refers to host space.
pub const HOST_SPACE_TAG:   u32 = 8 << HTB_MAP_SHIFT;


/// The window of host physical memory mapped into the SeaStar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostMemoryMap {
    base: PhysicalAddress,
}

impl HostMemoryMap {
    /// Computes the window that covers `region` without programming any hardware.
    pub fn covering(region: PhysicalAddress) -> HostMemoryMap {
        let base = region.value() & !((1 << HTB_MAP_SHIFT) - 1);
        HostMemoryMap { base: PhysicalAddress::new(base) }
    }

    /// Maps the window covering `region` into the SeaStar's HTB map.
    pub fn map_host_region(mem: &dyn SeaStarMemory, region: PhysicalAddress) -> HostMemoryMap {
        let map = HostMemoryMap::covering(region);
        let page = (map.base.value() >> HTB_MAP_SHIFT) as u32;
        for n in 0..HTB_MAP_ENTRIES {
            mem.write_u32(htb_map_entry(HTB_MAP_INDEX + n), HTB_MAP_VALID | (page + n as u32));
        }
        debug!("HostMemoryMap::map_host_region(): host region {:?} mapped through window base {:?}", region, map.base);
        map
    }

    pub fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Returns true if `addr` lies inside the mapped window.
    pub fn contains(&self, addr: PhysicalAddress) -> bool {
        addr >= self.base && addr.value() - self.base.value() < WINDOW_SIZE
    }

    /// Converts a host physical address inside the window into the address the firmware uses for it.
    ///
    /// Addresses outside the window are not checked and produce a wrong result.
    pub fn translate(&self, addr: PhysicalAddress) -> u32 {
        debug_assert!(self.contains(addr), "{:?} is outside the host window at {:?}", addr, self.base);
        let offset = addr.value().wrapping_sub(self.base.value()) & (WINDOW_SIZE - 1);
        offset as u32 + HOST_SPACE_TAG
    }
}
