use core::ptr::{read_volatile, write_volatile};
use crate::SeaStarAddress;

/// Access to the SeaStar's address space: its registers, the mailbox,
/// the NIC control block and the incoming datagram buffer table.
///
/// All accesses are single, untorn loads and stores of the given width,
/// so implementations over real hardware must use volatile accesses.
/// Methods take `&self` because the other side of this memory (the firmware)
/// changes it concurrently anyway.
pub trait SeaStarMemory: Send + Sync {
    fn read_u16(&self, addr: SeaStarAddress) -> u16;
    fn write_u16(&self, addr: SeaStarAddress, value: u16);
    fn read_u32(&self, addr: SeaStarAddress) -> u32;
    fn write_u32(&self, addr: SeaStarAddress, value: u32);
    fn read_u64(&self, addr: SeaStarAddress) -> u64;
    fn write_u64(&self, addr: SeaStarAddress, value: u64);

    /// Copies `bytes` into adapter memory starting at `addr`.
    ///
    /// The default implementation issues one 32-bit store per quad-byte,
    /// so `addr` and `bytes.len()` should be multiples of four.
    fn write_bytes(&self, addr: SeaStarAddress, bytes: &[u8]) {
        for (i, chunk) in bytes.chunks(4).enumerate() {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.write_u32(addr + (i as u32) * 4, u32::from_le_bytes(word));
        }
    }
}


/// The SeaStar's address space as mapped into the kernel's virtual address space.
///
/// The whole 4 GiB SeaStar address space is mapped at a fixed virtual base,
/// so a SeaStar address is turned into a pointer by simply adding it to that base.
pub struct MappedSeaStar {
    virt_base: usize,
}

impl MappedSeaStar {
    /// Kernel virtual address where the SeaStar memory is mapped.
    pub const DEFAULT_VIRT_BASE: usize = 0xFFFF_FFFF_0000_0000;

    /// Creates a handle to SeaStar memory mapped at `virt_base`.
    ///
    /// # Safety
    /// The full 32-bit SeaStar address space must be mapped, uncached,
    /// starting at `virt_base` for as long as the returned object exists.
    pub unsafe fn new(virt_base: usize) -> MappedSeaStar {
        trace!("MappedSeaStar::new(): SeaStar memory at virtual address {:#X}", virt_base);
        MappedSeaStar { virt_base }
    }

    fn ptr<T>(&self, addr: SeaStarAddress) -> *mut T {
        (self.virt_base + addr.value() as usize) as *mut T
    }
}

// SAFETY: all accesses go through volatile loads and stores of device memory,
// which the firmware already accesses concurrently.
unsafe impl Send for MappedSeaStar {}
unsafe impl Sync for MappedSeaStar {}

impl SeaStarMemory for MappedSeaStar {
    fn read_u16(&self, addr: SeaStarAddress) -> u16 {
        unsafe { read_volatile(self.ptr(addr)) }
    }
    fn write_u16(&self, addr: SeaStarAddress, value: u16) {
        unsafe { write_volatile(self.ptr(addr), value) }
    }
    fn read_u32(&self, addr: SeaStarAddress) -> u32 {
        unsafe { read_volatile(self.ptr(addr)) }
    }
    fn write_u32(&self, addr: SeaStarAddress, value: u32) {
        unsafe { write_volatile(self.ptr(addr), value) }
    }
    fn read_u64(&self, addr: SeaStarAddress) -> u64 {
        unsafe { read_volatile(self.ptr(addr)) }
    }
    fn write_u64(&self, addr: SeaStarAddress, value: u64) {
        unsafe { write_volatile(self.ptr(addr), value) }
    }
}
