//! Conversion between Ethernet frames and SeaStar datagrams.
//!
//! The SeaStar carries no hardware addresses. Only the last byte of each, the "lo_mac",
//! survives the trip, packed with its peer into one byte of the 4-byte wire header.
//! On the way out the wire header overwrites the tail of the 14-byte Ethernet header;
//! on the way in an Ethernet header is rebuilt in front of it from the local device address.
//! The conversion is therefore lossy.

use core::fmt;
use byteorder::{BigEndian, ByteOrder};
use nic_buffers::Frame;
use seastar_firmware::header::{WireHeader, WIRE_HEADER_LEN, LO_MAC_MASK};
use crate::config::{ETH_ALEN, ETH_HLEN, ETH_P_IP};

/// Offset of the destination hardware address in an Ethernet header.
const ETH_DEST:     usize = 0;
/// Offset of the source hardware address in an Ethernet header.
const ETH_SOURCE:   usize = ETH_ALEN;
/// Offset of the network-layer type in an Ethernet header.
const ETH_PROTO:    usize = 2 * ETH_ALEN;
/// Index of the lo_mac byte within a hardware address.
const LO_MAC_BYTE:  usize = ETH_ALEN - 1;
/// lo_mac of a broadcast destination, which the SeaStar cannot deliver.
const BROADCAST_LO_MAC: u8 = 0xFF;

/// Number of bytes the data start moves when converting between the two header formats.
pub const HEADER_DELTA: usize = ETH_HLEN - WIRE_HEADER_LEN;


/// Reasons an outbound frame is not sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The frame is shorter than an Ethernet header.
    Truncated,
    /// The frame does not carry IPv4.
    NotIpv4,
    /// The frame is addressed to the broadcast address.
    Broadcast,
    /// A lo_mac does not fit in 4 bits.
    HostIdOutOfRange,
}

impl From<Rejection> for &'static str {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::Truncated => "frame shorter than an Ethernet header",
            Rejection::NotIpv4 => "squashing non-IPv4 packet",
            Rejection::Broadcast => "squashing broadcast packet",
            Rejection::HostIdOutOfRange => "lo_mac out of range",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg: &'static str = (*self).into();
        f.write_str(msg)
    }
}

/// Reasons a frame cannot be converted or given a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    /// The frame is shorter than the header it should start with.
    Truncated,
    /// There is not enough headroom in front of the data to push a header.
    NoHeadroom,
    /// No destination address was supplied; the header was still pushed.
    NoDestination,
}

impl From<FramingError> for &'static str {
    fn from(error: FramingError) -> Self {
        match error {
            FramingError::Truncated => "frame shorter than its header",
            FramingError::NoHeadroom => "not enough headroom for the link-layer header",
            FramingError::NoDestination => "no destination address supplied",
        }
    }
}


/// What an outbound Ethernet frame tells us about where it goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    /// Node id of the destination: the first four bytes of its hardware address, in network order,
    /// truncated to 16 bits.
    pub nid: u16,
    pub source_lo_mac: u8,
    pub dest_lo_mac: u8,
}

/// Checks whether an Ethernet frame can be sent as a SeaStar datagram, without modifying it.
pub fn inspect(frame: &Frame) -> Result<Destination, Rejection> {
    if frame.len() < ETH_HLEN {
        return Err(Rejection::Truncated);
    }
    let data = frame.data();
    let source_lo_mac = data[ETH_SOURCE + LO_MAC_BYTE];
    let dest_lo_mac = data[ETH_DEST + LO_MAC_BYTE];

    if BigEndian::read_u16(&data[ETH_PROTO..]) != ETH_P_IP {
        return Err(Rejection::NotIpv4);
    }
    if dest_lo_mac == BROADCAST_LO_MAC {
        return Err(Rejection::Broadcast);
    }
    if (source_lo_mac & !LO_MAC_MASK) != 0 || (dest_lo_mac & !LO_MAC_MASK) != 0 {
        return Err(Rejection::HostIdOutOfRange);
    }

    Ok(Destination {
        nid: BigEndian::read_u32(&data[ETH_DEST..]) as u16,
        source_lo_mac,
        dest_lo_mac,
    })
}

/// Rewrites an inspected Ethernet frame in place into a SeaStar datagram
/// and returns the wire header it now starts with.
pub fn rewrite(frame: &mut Frame, dest: &Destination) -> Result<WireHeader, FramingError> {
    frame.pull(HEADER_DELTA).map_err(|_| FramingError::Truncated)?;
    // The length counts the wire header itself.
    let header = WireHeader::ip_datagram(frame.len(), dest.source_lo_mac, dest.dest_lo_mac);
    header.write(&mut frame.data());
    Ok(header)
}

/// Converts an Ethernet frame into a SeaStar datagram in place.
///
/// Returns the destination and the wire header. A rejected frame is left untouched.
pub fn encode(frame: &mut Frame) -> Result<(Destination, WireHeader), Rejection> {
    let dest = inspect(frame)?;
    let header = rewrite(frame, &dest).map_err(|_| Rejection::Truncated)?;
    Ok((dest, header))
}

/// Converts a received SeaStar datagram into an Ethernet frame in place.
///
/// Both hardware addresses of the rebuilt header are `local_mac` with their last byte
/// replaced by the lo_mac carried in the datagram, and the type is always IPv4.
pub fn decode(frame: &mut Frame, local_mac: &[u8; ETH_ALEN]) -> Result<WireHeader, FramingError> {
    if frame.len() < WIRE_HEADER_LEN {
        return Err(FramingError::Truncated);
    }
    let header = WireHeader::read(&frame.data());
    frame.push(HEADER_DELTA).map_err(|_| FramingError::NoHeadroom)?;

    let mut data = frame.data();
    let eth = &mut data[..ETH_HLEN];
    eth.fill(0);
    BigEndian::write_u16(&mut eth[ETH_PROTO..], ETH_P_IP);
    eth[ETH_SOURCE .. ETH_SOURCE + ETH_ALEN].copy_from_slice(local_mac);
    eth[ETH_DEST .. ETH_DEST + ETH_ALEN].copy_from_slice(local_mac);
    eth[ETH_SOURCE + LO_MAC_BYTE] = header.source_lo_mac();
    eth[ETH_DEST + LO_MAC_BYTE] = header.dest_lo_mac();
    Ok(header)
}

/// Pushes an Ethernet header in front of the frame's data.
///
/// Headers for protocols other than IPv4 are built too, so that such frames show up
/// as transmit errors rather than vanishing. If `daddr` is `None` the header is still pushed,
/// with a zero destination, and `NoDestination` is returned.
pub fn create_header(
    frame: &mut Frame,
    ethertype: u16,
    daddr: Option<&[u8; ETH_ALEN]>,
    saddr: Option<&[u8; ETH_ALEN]>,
    dev_addr: &[u8; ETH_ALEN],
) -> Result<usize, FramingError> {
    frame.push(ETH_HLEN).map_err(|_| FramingError::NoHeadroom)?;

    let mut data = frame.data();
    let eth = &mut data[..ETH_HLEN];
    eth.fill(0);
    BigEndian::write_u16(&mut eth[ETH_PROTO..], ethertype);
    eth[ETH_SOURCE .. ETH_SOURCE + ETH_ALEN].copy_from_slice(saddr.unwrap_or(dev_addr));

    match daddr {
        Some(daddr) => {
            eth[ETH_DEST .. ETH_DEST + ETH_ALEN].copy_from_slice(daddr);
            Ok(ETH_HLEN)
        }
        None => Err(FramingError::NoDestination),
    }
}
