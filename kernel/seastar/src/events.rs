//! The SeaStar -> Host event queue.
//!
//! The queue lives in host memory. The firmware publishes an event by writing a non-zero word
//! into the next slot; the host consumes it and writes the slot back to zero,
//! which hands it back to the firmware. There is no shared write cursor.
//!
//! The queue shares one DMA buffer, the host region, with the firmware's upper pending table:
//! ```text
//! offset                  size
//! 0                       NUM_EQ_ENTRIES * 4      event queue
//! HOST_REGION_PENDING     NUM_PENDINGS * 32       upper pending table, owned by the firmware
//! ```

use byteorder::{ByteOrder, LittleEndian};
use nic_buffers::{DmaBuffer, PhysicalAddress};
use seastar_firmware::{Event, FW_PENDING_SIZE};
use crate::config::{EQ_ENTRY_SIZE, NUM_EQ_ENTRIES, NUM_PENDINGS};

/// Size in bytes of the event queue.
pub const EQ_SIZE:              usize = NUM_EQ_ENTRIES * EQ_ENTRY_SIZE;
/// Offset of the upper pending table in the host region.
pub const HOST_REGION_PENDING:  usize = EQ_SIZE;
/// Size in bytes of the host region.
pub const HOST_REGION_SIZE:     usize = HOST_REGION_PENDING + NUM_PENDINGS * FW_PENDING_SIZE as usize;


pub struct EventQueue {
    region: DmaBuffer,
    read: usize,
}

impl EventQueue {
    /// Sets up an empty event queue at the start of `region`.
    pub fn new(region: DmaBuffer) -> Result<EventQueue, &'static str> {
        if region.size() < HOST_REGION_SIZE {
            return Err("EventQueue::new(): host region is too small");
        }
        if !region.phys_addr().is_aligned(EQ_ENTRY_SIZE) {
            return Err("EventQueue::new(): host region is not quad-byte aligned");
        }
        region.lock()[..HOST_REGION_SIZE].fill(0);
        Ok(EventQueue { region, read: 0 })
    }

    /// Physical address of the first queue slot.
    pub fn phys_addr(&self) -> PhysicalAddress {
        self.region.phys_addr()
    }

    /// Physical address of the upper pending table that follows the queue.
    pub fn pending_table_phys_addr(&self) -> PhysicalAddress {
        self.region.phys_addr() + HOST_REGION_PENDING
    }

    /// Index of the next slot to be consumed.
    pub fn read_index(&self) -> usize {
        self.read
    }

    /// Consumes the next event word, or returns `None` if the firmware has not published one.
    pub fn next_word(&mut self) -> Option<u32> {
        let mut slots = self.region.lock();
        let offset = self.read * EQ_ENTRY_SIZE;
        let slot = &mut slots[offset .. offset + EQ_ENTRY_SIZE];
        let word = LittleEndian::read_u32(slot);
        if word == 0 {
            return None;
        }
        LittleEndian::write_u32(slot, 0);
        self.read = (self.read + 1) % NUM_EQ_ENTRIES;
        Some(word)
    }

    /// Consumes and decodes the next event.
    pub fn next_event(&mut self) -> Option<Event> {
        self.next_word().and_then(Event::from_word)
    }

    /// Gives back the host region, ending the queue.
    pub fn into_region(self) -> DmaBuffer {
        self.region
    }
}
