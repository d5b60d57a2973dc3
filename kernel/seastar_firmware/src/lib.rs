//! This crate defines the software interface between the SeaStar NIC firmware and the host driver:
//! the fixed adapter addresses, the command records passed through the mailbox,
//! the event words written into the host's event queue, and the datagram wire header.
//!
//! The SeaStar firmware is closed-source, so every constant, offset and record layout here
//! must match the definitions it was built with. Records are encoded and decoded at explicit
//! byte offsets rather than through `#[repr(C, packed)]` structs.
//!
//! Access to the adapter itself goes through the [`SeaStarMemory`] trait,
//! which lets the driver run against real memory-mapped hardware or a simulated adapter.

#![no_std]

#[macro_use] extern crate log;
#[macro_use] extern crate static_assertions;
extern crate bit_field;
extern crate byteorder;
extern crate num_enum;

pub mod command;
pub mod event;
pub mod header;
pub mod mailbox;
pub mod niccb;
mod memory;

pub use command::{Command, CommandOpcode, InitCommand};
pub use event::{Event, EventKind};
pub use header::WireHeader;
pub use memory::{SeaStarMemory, MappedSeaStar};

use core::fmt;
use core::ops::Add;


/// Number of entries in the Host -> SeaStar command queue.
pub const COMMAND_Q_LENGTH:         usize = 63;
/// Number of entries in the SeaStar -> Host result queue.
pub const RESULT_Q_LENGTH:          usize = 2;
/// Size in bytes of every command record.
pub const COMMAND_SIZE:             usize = 64;
/// Number of entries in the incoming datagram buffer table.
pub const NUM_SKBS:                 usize = 64;
/// Size of the pending structure used by the firmware.
pub const FW_PENDING_SIZE:          u32 = 32;
/// Size of the event queue control block structure used by the firmware.
pub const FW_EQCB_SIZE:             u32 = 32;

/// Base of the adapter's scratch memory.
pub const SEASTAR_SCRATCH_BASE:     SeaStarAddress = SeaStarAddress::new(0xFFFA_0000);
/// Register holding this node's id on the interconnect.
pub const SEASTAR_TX_SOURCE:        SeaStarAddress = SeaStarAddress::new(0xFFE0_0108);
/// The Host <-> SeaStar mailbox.
pub const SEASTAR_MAILBOX_BASE:     SeaStarAddress = SeaStarAddress::new(0xFFFA_0000);
/// The incoming datagram buffer table, an array of `NUM_SKBS` u64 quad-byte addresses.
pub const SEASTAR_SKB_BASE:         SeaStarAddress = SeaStarAddress::new(0xFFFA_4000);
/// Start of adapter memory handed out to the host for firmware-side tables.
pub const SEASTAR_HOST_BASE:        SeaStarAddress = SeaStarAddress::new(0xFFFA_5000);
/// The HyperTransport bridge map, an array of u32 map entries.
pub const SEASTAR_HTB_BASE:         SeaStarAddress = SeaStarAddress::new(0xFFE2_0000);
/// The HyperTransport bridge interrupt routing register.
pub const SEASTAR_HTB_BI:           SeaStarAddress = SeaStarAddress::new(0xFFE2_0048);
/// The NIC control block, see [`niccb`].
pub const SEASTAR_NICCB_BASE:       SeaStarAddress = SeaStarAddress::new(0xFFFF_E000);

/// Size of one HyperTransport map entry in bytes.
pub const HTB_MAP_ENTRY_SIZE:       u32 = 4;
/// Bit that marks an HTB map entry as valid.
pub const HTB_MAP_VALID:            u32 = 0x8000;
/// Value OR'ed into the HTB_BI register along with the interrupt destination.
pub const HTB_BI_ENABLE:            u32 = 0xFD00_0000;

/// PCI vendor id of Cray.
pub const PCI_VENDOR_ID_CRAY:       u16 = 0x17DB;
/// PCI device id of the SeaStar.
pub const PCI_DEVICE_ID_SEASTAR:    u16 = 0x0101;

const_assert_eq!(COMMAND_Q_LENGTH * COMMAND_SIZE, mailbox::RESULTQ_OFFSET as usize);


/// An address in the SeaStar's 32-bit address space.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeaStarAddress(u32);

impl SeaStarAddress {
    pub const fn new(addr: u32) -> SeaStarAddress {
        SeaStarAddress(addr)
    }

    pub const fn value(&self) -> u32 {
        self.0
    }

    /// Returns the address of the `index`-th element of an array of `elem_size`-byte elements starting here.
    pub const fn offset_by(&self, index: usize, elem_size: u32) -> SeaStarAddress {
        SeaStarAddress(self.0 + index as u32 * elem_size)
    }
}

impl Add<u32> for SeaStarAddress {
    type Output = SeaStarAddress;
    fn add(self, rhs: u32) -> SeaStarAddress {
        SeaStarAddress(self.0 + rhs)
    }
}

impl fmt::Debug for SeaStarAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ss:{:#010X}", self.0)
    }
}

impl fmt::Display for SeaStarAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#010X}", self.0)
    }
}

/// Returns the address of entry `index` in the incoming datagram buffer table.
pub fn skb_table_entry(index: usize) -> SeaStarAddress {
    SEASTAR_SKB_BASE.offset_by(index, 8)
}

/// Returns the address of entry `index` in the HyperTransport bridge map.
pub fn htb_map_entry(index: usize) -> SeaStarAddress {
    SEASTAR_HTB_BASE.offset_by(index, HTB_MAP_ENTRY_SIZE)
}

/// Computes the value written to the HTB_BI register for the given interrupt message address.
///
/// The low half of `idr` holds the APIC destination set up by the host, which confuses the SeaStar,
/// so it is masked off.
pub fn htb_bi_value(idr: u32) -> u32 {
    let idr = idr & 0xFFFF_0000;
    HTB_BI_ENABLE | (idr >> 8)
}
