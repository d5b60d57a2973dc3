//! The table of receive buffers posted to the SeaStar.
//!
//! The firmware picks buffers out of the adapter-resident table at [`SEASTAR_SKB_BASE`](seastar_firmware::SEASTAR_SKB_BASE),
//! which holds the quad-byte address of each buffer's data start.
//! The host keeps the matching frames so it can hand them up once the firmware has filled them.

use alloc::vec::Vec;
use nic_buffers::{BufferAllocator, Frame};
use seastar_firmware::{skb_table_entry, SeaStarMemory, NUM_SKBS};
use crate::config::SKB_PAD;


pub struct ReceiveRing {
    frames: Vec<Option<Frame>>,
    buffer_size: usize,
    refill_failures: u64,
}

impl ReceiveRing {
    /// Creates an empty ring whose buffers will be `buffer_size` bytes long, [`SKB_PAD`] of which is headroom.
    pub fn new(buffer_size: usize) -> ReceiveRing {
        let mut frames = Vec::with_capacity(NUM_SKBS);
        frames.resize_with(NUM_SKBS, || None);
        ReceiveRing { frames, buffer_size, refill_failures: 0 }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of failed buffer allocations so far.
    pub fn refill_failures(&self) -> u64 {
        self.refill_failures
    }

    /// Returns true if slot `index` holds a buffer.
    pub fn is_posted(&self, index: usize) -> bool {
        self.frames.get(index).map_or(false, |f| f.is_some())
    }

    /// Number of slots holding a buffer.
    pub fn posted(&self) -> usize {
        self.frames.iter().filter(|f| f.is_some()).count()
    }

    /// Posts a new buffer to slot `index`.
    ///
    /// If no buffer can be allocated the slot stays empty until the next [`refill_empty`](Self::refill_empty).
    /// Returns whether a buffer was posted.
    pub fn refill(&mut self, index: usize, mem: &dyn SeaStarMemory, allocator: &dyn BufferAllocator) -> bool {
        let buffer = match allocator.allocate(self.buffer_size) {
            Some(b) => b,
            None => {
                error!("seastar::refill(): couldn't allocate a {}-byte receive buffer for slot {}", self.buffer_size, index);
                self.refill_failures += 1;
                return false;
            }
        };

        let mut frame = Frame::new(buffer);
        if let Err(e) = frame.reserve(SKB_PAD) {
            error!("seastar::refill(): {}", e);
            allocator.release(frame.into_buffer());
            self.refill_failures += 1;
            return false;
        }

        // The firmware takes the buffer's data start as a quad-byte address.
        mem.write_u64(skb_table_entry(index), (frame.phys_addr().value() >> 2) as u64);
        if let Some(old) = self.frames[index].replace(frame) {
            warn!("seastar::refill(): slot {} was still holding a buffer at {:?}", index, old.phys_addr());
            allocator.release(old.into_buffer());
        }
        true
    }

    /// Removes and returns the buffer in slot `index`, leaving the slot empty.
    pub fn take(&mut self, index: usize) -> Option<Frame> {
        self.frames.get_mut(index).and_then(Option::take)
    }

    /// Posts a buffer to every empty slot. Returns the number of slots that are still empty.
    pub fn refill_empty(&mut self, mem: &dyn SeaStarMemory, allocator: &dyn BufferAllocator) -> usize {
        let mut still_empty = 0;
        for index in 0..NUM_SKBS {
            if self.frames[index].is_none() && !self.refill(index, mem, allocator) {
                still_empty += 1;
            }
        }
        still_empty
    }

    /// Clears the adapter's table, gives back every buffer, and posts fresh ones to every slot.
    pub fn reset(&mut self, mem: &dyn SeaStarMemory, allocator: &dyn BufferAllocator) {
        for index in 0..NUM_SKBS {
            mem.write_u64(skb_table_entry(index), 0);
            if let Some(frame) = self.frames[index].take() {
                allocator.release(frame.into_buffer());
            }
        }
        let still_empty = self.refill_empty(mem, allocator);
        if still_empty != 0 {
            warn!("seastar::reset(): {} of {} receive slots left empty", still_empty, NUM_SKBS);
        }
    }
}
