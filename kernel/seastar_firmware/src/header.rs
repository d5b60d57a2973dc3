//! The 4-byte SeaStar datagram wire header.
//!
//! ```text
//! offset  size  field
//! 0       2     length     in quad-bytes minus one, header included
//! 2       1     lo_macs    (source lo_mac << 4) | destination lo_mac
//! 3       1     hdr_type   frame type, see HDR_TYPE_IP_DATAGRAM
//! ```

use byteorder::{ByteOrder, LittleEndian};

/// Size of the wire header in bytes.
pub const WIRE_HEADER_LEN: usize = 4;

/// Header type byte for an IP datagram: datagram class 2 in the upper 3 bits, type 0 (IP) below.
pub const HDR_TYPE_IP_DATAGRAM: u8 = 2 << 5;

/// Only 4 bits of host id are carried per node, i.e., 16 virtual hosts per physical node.
pub const LO_MAC_MASK: u8 = 0xF;

/// Rounds `val` up to the nearest quad-byte.
pub const fn roundup4(val: usize) -> usize {
    (val + (4 - 1)) & !(4 - 1)
}

/// Returns the wire length field for a datagram of `len` bytes:
/// the length rounded up to quad-bytes, counted in quad-bytes, minus one.
pub const fn quadbyte_length(len: usize) -> u16 {
    ((roundup4(len) >> 2) - 1) as u16
}

/// Returns the number of bytes described by a wire length field.
pub const fn byte_length(qb_len: u16) -> usize {
    (qb_len as usize + 1) << 2
}

/// Packs the low nibbles of the source and destination host ids into one byte.
pub const fn pack_lo_macs(source_lo_mac: u8, dest_lo_mac: u8) -> u8 {
    ((source_lo_mac & LO_MAC_MASK) << 4) | (dest_lo_mac & LO_MAC_MASK)
}

/// Splits a packed host-id byte into `(source_lo_mac, dest_lo_mac)`.
pub const fn unpack_lo_macs(lo_macs: u8) -> (u8, u8) {
    (lo_macs >> 4, lo_macs & LO_MAC_MASK)
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub length:     u16,
    pub lo_macs:    u8,
    pub hdr_type:   u8,
}

impl WireHeader {
    /// Builds the header of an IP datagram that is `len` bytes long on the wire, header included.
    pub fn ip_datagram(len: usize, source_lo_mac: u8, dest_lo_mac: u8) -> WireHeader {
        WireHeader {
            length: quadbyte_length(len),
            lo_macs: pack_lo_macs(source_lo_mac, dest_lo_mac),
            hdr_type: HDR_TYPE_IP_DATAGRAM,
        }
    }

    /// Reads a header from the first 4 bytes of `bytes`.
    pub fn read(bytes: &[u8]) -> WireHeader {
        WireHeader {
            length: LittleEndian::read_u16(&bytes[0..2]),
            lo_macs: bytes[2],
            hdr_type: bytes[3],
        }
    }

    /// Writes this header into the first 4 bytes of `bytes`.
    pub fn write(&self, bytes: &mut [u8]) {
        LittleEndian::write_u16(&mut bytes[0..2], self.length);
        bytes[2] = self.lo_macs;
        bytes[3] = self.hdr_type;
    }

    pub fn source_lo_mac(&self) -> u8 {
        unpack_lo_macs(self.lo_macs).0
    }

    pub fn dest_lo_mac(&self) -> u8 {
        unpack_lo_macs(self.lo_macs).1
    }

    /// Number of bytes on the wire, header included, as described by the length field.
    pub fn frame_len(&self) -> usize {
        byte_length(self.length)
    }
}
