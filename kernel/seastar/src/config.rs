//! Sizes fixed by the driver, and the runtime configuration of a SeaStar device.

use crate::mailbox::WaitPolicy;

/// Number of pending structures used to track in-progress transmits.
pub const NUM_TX_PENDINGS:  usize = 64;
/// Number of receive pending structures. The host never uses them,
/// but the firmware expects them to follow the transmit pendings in the pending table.
pub const NUM_RX_PENDINGS:  usize = 64;
pub const NUM_PENDINGS:     usize = NUM_TX_PENDINGS + NUM_RX_PENDINGS;

/// Number of entries in the SeaStar -> Host event queue.
pub const NUM_EQ_ENTRIES:   usize = 1024;
/// Size of one event queue entry in bytes.
pub const EQ_ENTRY_SIZE:    usize = 4;

/// Extra bytes allocated for every receive buffer and reserved in front of its data,
/// so that the link-layer header can be rebuilt in place.
pub const SKB_PAD:          usize = 16 - seastar_firmware::header::WIRE_HEADER_LEN;

/// Default maximum transfer unit in bytes.
pub const DEFAULT_MTU:      usize = 16000;

/// The firmware process index used by the driver.
pub const DEFAULT_PROCESS_INDEX: u8 = 1;

/// Length of a link-layer (Ethernet) header in bytes.
pub const ETH_HLEN:         usize = 14;
/// Length of a link-layer (Ethernet) hardware address in bytes.
pub const ETH_ALEN:         usize = 6;
/// Network-layer type of IPv4.
pub const ETH_P_IP:         u16 = 0x0800;

const_assert!(SKB_PAD >= ETH_HLEN - seastar_firmware::header::WIRE_HEADER_LEN);


/// Runtime configuration of a SeaStar device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeaStarConfig {
    /// Maximum transfer unit, which sizes every receive buffer.
    pub mtu: usize,
    /// Firmware process index claimed by the driver.
    pub process_index: u8,
    pub pid: u16,
    pub jid: u16,
    pub uid: u32,
    /// How long to wait on the firmware before giving up on a mailbox operation.
    pub wait: WaitPolicy,
    /// Initial hardware address of the device.
    /// Only its last byte (the lo_mac) is ever carried on the wire.
    pub mac_address: [u8; ETH_ALEN],
}

impl Default for SeaStarConfig {
    fn default() -> Self {
        SeaStarConfig {
            mtu: DEFAULT_MTU,
            process_index: DEFAULT_PROCESS_INDEX,
            pid: 0,
            jid: 0,
            uid: 0,
            wait: WaitPolicy::default(),
            mac_address: [0; ETH_ALEN],
        }
    }
}

impl SeaStarConfig {
    /// Size of every receive buffer: room for one MTU plus the header padding.
    pub fn rx_buffer_size(&self) -> usize {
        self.mtu + SKB_PAD
    }
}
