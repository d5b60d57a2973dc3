//! A buffer allocator that hands out simulated physical memory.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;
use nic_buffers::{BufferAllocator, DmaBuffer, DmaMemory, PhysicalAddress};

/// Alignment of every simulated allocation.
pub const DMA_ALIGN: usize = 64;


struct DmaState {
    next_phys: usize,
    /// Live buffers, keyed by their starting physical address.
    live: BTreeMap<usize, Arc<DmaMemory>>,
    /// Number of allocations that may still succeed, if limited.
    allocations_left: Option<usize>,
    allocated: usize,
    released: usize,
    bad_releases: usize,
}

/// Simulated DMA-able memory.
///
/// Buffers are placed one after another starting at [`SimulatedDma::BASE`],
/// and can be read and written by physical address as a device would.
pub struct SimulatedDma {
    inner: Mutex<DmaState>,
}

impl SimulatedDma {
    /// Physical address of the first allocation.
    pub const BASE: usize = 0x2_3456_0000;

    pub fn new() -> SimulatedDma {
        SimulatedDma::starting_at(SimulatedDma::BASE)
    }

    /// Creates an allocator whose first buffer starts at `base`.
    pub fn starting_at(base: usize) -> SimulatedDma {
        SimulatedDma {
            inner: Mutex::new(DmaState {
                next_phys: base,
                live: BTreeMap::new(),
                allocations_left: None,
                allocated: 0,
                released: 0,
                bad_releases: 0,
            }),
        }
    }

    /// Lets only `count` more allocations succeed; `None` removes the limit.
    pub fn limit_allocations(&self, count: Option<usize>) {
        self.inner.lock().allocations_left = count;
    }

    /// Number of buffers handed out and not released.
    pub fn live_buffers(&self) -> usize {
        self.inner.lock().live.len()
    }

    pub fn allocated(&self) -> usize {
        self.inner.lock().allocated
    }

    pub fn released(&self) -> usize {
        self.inner.lock().released
    }

    /// Number of releases of buffers this allocator did not have outstanding.
    pub fn bad_releases(&self) -> usize {
        self.inner.lock().bad_releases
    }

    fn find(&self, phys: usize, len: usize) -> Option<(Arc<DmaMemory>, usize)> {
        let inner = self.inner.lock();
        let (&start, memory) = inner.live.range(..=phys).next_back()?;
        let offset = phys - start;
        let size = memory.lock().len();
        if offset + len > size {
            return None;
        }
        Some((memory.clone(), offset))
    }

    /// Reads `len` bytes at physical address `phys`, if they all lie within one live buffer.
    pub fn read(&self, phys: usize, len: usize) -> Option<Vec<u8>> {
        let (memory, offset) = self.find(phys, len)?;
        let bytes = memory.lock()[offset .. offset + len].to_vec();
        Some(bytes)
    }

    /// Writes `bytes` at physical address `phys`, if they all lie within one live buffer.
    pub fn write(&self, phys: usize, bytes: &[u8]) -> bool {
        match self.find(phys, bytes.len()) {
            Some((memory, offset)) => {
                memory.lock()[offset .. offset + bytes.len()].copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    /// Size of the live buffer that contains `phys`, counted from `phys` to its end.
    pub fn room_at(&self, phys: usize) -> usize {
        let inner = self.inner.lock();
        match inner.live.range(..=phys).next_back() {
            Some((&start, memory)) => memory.lock().len().saturating_sub(phys - start),
            None => 0,
        }
    }
}

impl Default for SimulatedDma {
    fn default() -> Self {
        SimulatedDma::new()
    }
}

impl BufferAllocator for SimulatedDma {
    fn allocate(&self, size: usize) -> Option<DmaBuffer> {
        let mut inner = self.inner.lock();
        if let Some(left) = inner.allocations_left.as_mut() {
            if *left == 0 {
                return None;
            }
            *left -= 1;
        }

        let size = size.max(1);
        let phys = inner.next_phys;
        inner.next_phys += (size + DMA_ALIGN - 1) & !(DMA_ALIGN - 1);
        let memory = Arc::new(Mutex::new(vec![0u8; size].into_boxed_slice()));
        inner.live.insert(phys, memory.clone());
        inner.allocated += 1;
        Some(DmaBuffer::new(memory, PhysicalAddress::new(phys)))
    }

    fn release(&self, buffer: DmaBuffer) {
        let mut inner = self.inner.lock();
        let phys = buffer.phys_addr().value();
        let owned = inner.live.get(&phys).map_or(false, |m| Arc::ptr_eq(m, buffer.memory()));
        if owned {
            inner.live.remove(&phys);
            inner.released += 1;
        } else {
            warn!("SimulatedDma::release(): {:?} was not allocated here", buffer);
            inner.bad_releases += 1;
        }
    }
}
