//! The transmit pending pool.
//!
//! Every transmit handed to the firmware is tracked by a pending slot,
//! whose index the firmware echoes back in the matching transmit-complete event.
//! Free slots form a singly linked list threaded through the slot table by index.

use alloc::vec::Vec;
use nic_buffers::{DmaBuffer, Frame};
use crate::config::{NUM_PENDINGS, NUM_TX_PENDINGS};


/// One in-flight transmit.
#[derive(Default)]
pub struct PendingSlot {
    /// The frame being sent.
    pub frame: Option<Frame>,
    /// A quad-byte aligned copy of the frame's data, used when the frame itself is not aligned.
    pub bounce: Option<DmaBuffer>,
    next: Option<u16>,
    in_use: bool,
}

/// A fixed table of [`NUM_PENDINGS`] pending slots, of which the first [`NUM_TX_PENDINGS`] are handed out.
///
/// The rest of the table only exists so that slot indices line up with the firmware's pending table.
pub struct PendingPool {
    slots: Vec<PendingSlot>,
    free_head: Option<u16>,
    free_count: usize,
}

impl PendingPool {
    pub fn new() -> PendingPool {
        let mut slots = Vec::with_capacity(NUM_PENDINGS);
        slots.resize_with(NUM_PENDINGS, PendingSlot::default);
        let mut pool = PendingPool { slots, free_head: None, free_count: 0 };
        for index in 0..NUM_TX_PENDINGS as u16 {
            pool.push_free(index);
        }
        pool
    }

    fn push_free(&mut self, index: u16) {
        let slot = &mut self.slots[index as usize];
        slot.next = self.free_head;
        slot.in_use = false;
        self.free_head = Some(index);
        self.free_count += 1;
    }

    /// Takes a free slot off the free list, or returns `None` if every transmit slot is in use.
    pub fn allocate(&mut self) -> Option<u16> {
        let index = self.free_head?;
        let slot = &mut self.slots[index as usize];
        self.free_head = slot.next.take();
        slot.in_use = true;
        self.free_count -= 1;
        Some(index)
    }

    /// Puts `index` back on the free list and returns whatever the slot was holding.
    ///
    /// Each allocated slot must be released exactly once.
    pub fn release(&mut self, index: u16) -> PendingSlot {
        debug_assert!(self.slots[index as usize].in_use, "pending slot {} released twice", index);
        let slot = &mut self.slots[index as usize];
        let released = PendingSlot {
            frame: slot.frame.take(),
            bounce: slot.bounce.take(),
            next: None,
            in_use: false,
        };
        self.push_free(index);
        released
    }

    /// Returns the slot at `index`.
    pub fn slot_mut(&mut self, index: u16) -> &mut PendingSlot {
        &mut self.slots[index as usize]
    }

    /// Returns true if `index` is a transmit slot that is currently allocated.
    pub fn is_in_use(&self, index: u16) -> bool {
        (index as usize) < NUM_TX_PENDINGS && self.slots[index as usize].in_use
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    pub fn in_flight(&self) -> usize {
        NUM_TX_PENDINGS - self.free_count
    }
}

impl Default for PendingPool {
    fn default() -> Self {
        PendingPool::new()
    }
}
