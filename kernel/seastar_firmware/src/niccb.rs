//! The SeaStar NIC Control Block, which lives at [`SEASTAR_NICCB_BASE`](crate::SEASTAR_NICCB_BASE).
//!
//! Only the fields the host driver touches are described here.

use crate::{SeaStarAddress, SeaStarMemory, SEASTAR_NICCB_BASE};

pub const VERSION_OFFSET:       u32 = 0;
pub const BUILD_TIME_OFFSET:    u32 = 28;
pub const IP_TX_OFFSET:         u32 = 100;
pub const IP_TX_DROP_OFFSET:    u32 = 104;
pub const IP_RX_OFFSET:         u32 = 108;
pub const IP_RX_DROP_OFFSET:    u32 = 112;
pub const LOCAL_NID_OFFSET:     u32 = 168;

fn field(offset: u32) -> SeaStarAddress {
    SEASTAR_NICCB_BASE + offset
}

pub fn version<M: SeaStarMemory + ?Sized>(mem: &M) -> u32 {
    mem.read_u32(field(VERSION_OFFSET))
}

pub fn build_time<M: SeaStarMemory + ?Sized>(mem: &M) -> u32 {
    mem.read_u32(field(BUILD_TIME_OFFSET))
}

pub fn local_nid<M: SeaStarMemory + ?Sized>(mem: &M) -> u16 {
    mem.read_u16(field(LOCAL_NID_OFFSET))
}

pub fn set_local_nid<M: SeaStarMemory + ?Sized>(mem: &M, nid: u16) {
    mem.write_u16(field(LOCAL_NID_OFFSET), nid)
}

/// Datagram counters maintained by the firmware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FirmwareCounters {
    pub ip_tx:      u32,
    pub ip_tx_drop: u32,
    pub ip_rx:      u32,
    pub ip_rx_drop: u32,
}

impl FirmwareCounters {
    pub fn read<M: SeaStarMemory + ?Sized>(mem: &M) -> FirmwareCounters {
        FirmwareCounters {
            ip_tx:      mem.read_u32(field(IP_TX_OFFSET)),
            ip_tx_drop: mem.read_u32(field(IP_TX_DROP_OFFSET)),
            ip_rx:      mem.read_u32(field(IP_RX_OFFSET)),
            ip_rx_drop: mem.read_u32(field(IP_RX_DROP_OFFSET)),
        }
    }
}
