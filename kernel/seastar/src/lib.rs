//! A driver for the Cray SeaStar interconnect NIC.
//!
//! The SeaStar runs closed-source firmware that the host talks to through a mailbox
//! in the adapter's memory, and that reports back through an event queue in host memory.
//! IP datagrams travel with a compact 4-byte SeaStar header instead of an Ethernet header;
//! the driver converts between the two so that it looks like an Ethernet device to the network stack.
//!
//! Bring-up happens once in [`SeaStarNic::init()`]. After [`SeaStarNic::open()`],
//! frames are sent with [`SeaStarNic::transmit()`], and [`SeaStarNic::handle_interrupt()`]
//! must be called for every interrupt from the device.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
#[macro_use] extern crate static_assertions;
extern crate spin;
extern crate irq_safety;
extern crate byteorder;
extern crate nic_buffers;
extern crate seastar_firmware;

pub mod bringup;
pub mod config;
pub mod events;
pub mod framer;
pub mod mailbox;
pub mod pending;
pub mod rx_ring;
pub mod translator;

pub use bringup::{BringupError, BringupStage};
pub use config::SeaStarConfig;
pub use framer::Rejection;
pub use mailbox::{MailboxError, WaitPolicy};

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use alloc::sync::Arc;
#[cfg(not(test))]
use irq_safety::MutexIrqSafe;
// Hosted tests run in user mode, where masking interrupts faults.
#[cfg(test)]
use spin::Mutex as MutexIrqSafe;
use nic_buffers::{BufferAllocator, DmaBuffer, Frame, ReceivedFrame};
use seastar_firmware::{
    htb_bi_value, niccb::FirmwareCounters, header::{roundup4, WireHeader},
    Command, EventKind, SeaStarMemory,
    NUM_SKBS, PCI_DEVICE_ID_SEASTAR, PCI_VENDOR_ID_CRAY, SEASTAR_HTB_BI,
};
use bringup::BringupParams;
use config::{ETH_ALEN, ETH_HLEN, ETH_P_IP, NUM_TX_PENDINGS};
use events::{EventQueue, HOST_REGION_SIZE};
use mailbox::Mailbox;
use pending::PendingPool;
use rx_ring::ReceiveRing;
use translator::HostMemoryMap;


/// Returns true if the given PCI ids belong to a SeaStar.
pub fn supports_device(vendor_id: u16, device_id: u16) -> bool {
    vendor_id == PCI_VENDOR_ID_CRAY && device_id == PCI_DEVICE_ID_SEASTAR
}


/// The part of the network stack that accepts frames received by the device.
pub trait NetworkStack: Send + Sync {
    fn receive_frame(&self, frame: ReceivedFrame);
}


/// Possible reasons for failure of a SeaStar device operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeaStarError {
    /// The firmware did not come up.
    Bringup(BringupError),
    /// Host memory for the event queue and the pending table could not be allocated.
    OutOfMemory,
    /// The firmware stopped taking commands.
    Mailbox(MailboxError),
}

impl From<BringupError> for SeaStarError {
    fn from(e: BringupError) -> Self {
        SeaStarError::Bringup(e)
    }
}

impl From<MailboxError> for SeaStarError {
    fn from(e: MailboxError) -> Self {
        SeaStarError::Mailbox(e)
    }
}

impl From<SeaStarError> for &'static str {
    fn from(error: SeaStarError) -> Self {
        match error {
            SeaStarError::Bringup(e) => e.into(),
            SeaStarError::OutOfMemory => "couldn't allocate the SeaStar host region",
            SeaStarError::Mailbox(e) => e.into(),
        }
    }
}

impl fmt::Display for SeaStarError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SeaStarError::Bringup(e) => write!(f, "bring-up failed: {}", e),
            SeaStarError::OutOfMemory => f.write_str("couldn't allocate the SeaStar host region"),
            SeaStarError::Mailbox(e) => write!(f, "mailbox error: {}", e),
        }
    }
}


/// The outcome of [`SeaStarNic::transmit()`].
#[derive(Debug)]
pub enum TransmitStatus {
    /// The datagram was handed to the firmware.
    Sent,
    /// The frame was dropped and counted.
    Dropped,
    /// The transmit queue is stopped. The frame is returned untouched and should be retried
    /// once a transmit completes.
    Busy(Frame),
}

/// Counters kept by the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub tx_packets:         u64,
    pub tx_bytes:           u64,
    /// Frames rejected because they cannot be carried by the SeaStar.
    pub tx_errors:          u64,
    /// Frames accepted but then lost for lack of resources.
    pub tx_dropped:         u64,
    /// Transmits refused because the queue was stopped.
    pub tx_busy:            u64,
    pub rx_packets:         u64,
    pub rx_bytes:           u64,
    /// Received datagrams that could not be delivered.
    pub rx_dropped:         u64,
    pub rx_refill_failures: u64,
    pub unknown_events:     u64,
}


/// State shared by the transmit path and the interrupt handler.
struct DeviceState {
    mailbox: Mailbox,
    pending: PendingPool,
    rx_ring: ReceiveRing,
    stats: DeviceStats,
    queue_stopped: bool,
    mac_address: [u8; ETH_ALEN],
}

/// A SeaStar NIC whose firmware has been brought up.
pub struct SeaStarNic {
    mem: Arc<dyn SeaStarMemory>,
    allocator: Arc<dyn BufferAllocator>,
    stack: Arc<dyn NetworkStack>,
    host_map: HostMemoryMap,
    nid: u16,
    mtu: usize,
    state: MutexIrqSafe<DeviceState>,
    /// Held for the whole of an event drain.
    events: MutexIrqSafe<EventQueue>,
    /// Set by every interrupt; cleared by whoever drains the event queue next.
    drain_requested: AtomicBool,
}

impl SeaStarNic {
    /// Brings up the SeaStar behind `mem`.
    ///
    /// Records this node's id in the NIC control block, allocates the host region
    /// holding the event queue and the upper pending table, maps it into the SeaStar,
    /// and runs the firmware handshake. The device stays closed until [`open()`](Self::open).
    pub fn init(
        config: SeaStarConfig,
        mem: Arc<dyn SeaStarMemory>,
        allocator: Arc<dyn BufferAllocator>,
        stack: Arc<dyn NetworkStack>,
    ) -> Result<SeaStarNic, SeaStarError> {
        let nid = bringup::setup_local_nid(&*mem);

        let region = allocator.allocate(HOST_REGION_SIZE).ok_or_else(|| {
            error!("seastar::hw_init(): couldn't allocate {} bytes of host region", HOST_REGION_SIZE);
            SeaStarError::OutOfMemory
        })?;
        let eq = match EventQueue::new(region) {
            Ok(eq) => eq,
            Err(_e) => {
                error!("{}", _e);
                return Err(SeaStarError::OutOfMemory);
            }
        };

        let host_map = HostMemoryMap::map_host_region(&*mem, eq.phys_addr());
        let mut mailbox = Mailbox::load(&*mem, config.wait);

        let params = BringupParams {
            process_index: config.process_index,
            pid: config.pid,
            jid: config.jid,
            uid: config.uid,
            up_pending_table_addr: host_map.translate(eq.pending_table_phys_addr()),
            eq_addr: host_map.translate(eq.phys_addr()),
        };
        if let Err(e) = bringup::bring_up(&*mem, &mut mailbox, &params) {
            error!("seastar::hw_init(): {}", e);
            allocator.release(eq.into_region());
            return Err(e.into());
        }

        let state = DeviceState {
            mailbox,
            pending: PendingPool::new(),
            rx_ring: ReceiveRing::new(config.rx_buffer_size()),
            stats: DeviceStats::default(),
            queue_stopped: true,
            mac_address: config.mac_address,
        };

        Ok(SeaStarNic {
            mem,
            allocator,
            stack,
            host_map,
            nid,
            mtu: config.mtu,
            state: MutexIrqSafe::new(state),
            events: MutexIrqSafe::new(eq),
            drain_requested: AtomicBool::new(false),
        })
    }

    /// Posts a fresh receive buffer to every slot and starts the transmit queue.
    pub fn open(&self) {
        let mut state = self.state.lock();
        let state = &mut *state;
        state.rx_ring.reset(&*self.mem, &*self.allocator);
        state.queue_stopped = false;
        info!("seastar::open(): nid {} up, {} receive buffers posted", self.nid, state.rx_ring.posted());
    }

    /// Sends one Ethernet frame.
    ///
    /// Only IPv4 frames to a non-broadcast address whose source and destination lo_macs fit
    /// in 4 bits can be sent; anything else is dropped and counted as a transmit error.
    /// When every pending slot is in use, the queue is stopped and the frame is returned untouched.
    pub fn transmit(&self, frame: Frame) -> Result<TransmitStatus, SeaStarError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.queue_stopped {
            state.stats.tx_busy += 1;
            return Ok(TransmitStatus::Busy(frame));
        }

        let dest = match framer::inspect(&frame) {
            Ok(dest) => dest,
            Err(rejection) => {
                warn!("seastar::transmit(): {}", rejection);
                state.stats.tx_errors += 1;
                self.allocator.release(frame.into_buffer());
                return Ok(TransmitStatus::Dropped);
            }
        };

        // A pending slot is needed to track the completion of this frame.
        let index = match state.pending.allocate() {
            Some(index) => index,
            None => {
                state.queue_stopped = true;
                state.stats.tx_busy += 1;
                return Ok(TransmitStatus::Busy(frame));
            }
        };

        let mut frame = frame;
        let header = match framer::rewrite(&mut frame, &dest) {
            Ok(header) => header,
            Err(_e) => {
                error!("seastar::transmit(): couldn't rewrite inspected frame: {:?}", _e);
                state.pending.release(index);
                state.stats.tx_dropped += 1;
                self.allocator.release(frame.into_buffer());
                return Ok(TransmitStatus::Dropped);
            }
        };

        // The SeaStar can only read quad-byte aligned data.
        let bounce = if frame.phys_addr().is_aligned(4) {
            None
        } else {
            match self.bounce(&frame) {
                Some(bounce) => Some(bounce),
                None => {
                    state.pending.release(index);
                    state.stats.tx_dropped += 1;
                    self.allocator.release(frame.into_buffer());
                    return Ok(TransmitStatus::Dropped);
                }
            }
        };
        let msg_addr = bounce.as_ref().map_or(frame.phys_addr(), DmaBuffer::phys_addr);

        let len = frame.len();
        let cmd = Command::TransmitDatagram {
            nid: dest.nid,
            length: header.length,
            address: (msg_addr.value() >> 2) as u64,
            pending_index: index,
        };
        let slot = state.pending.slot_mut(index);
        slot.frame = Some(frame);
        slot.bounce = bounce;

        if let Err(e) = state.mailbox.post(&*self.mem, &cmd) {
            let released = state.pending.release(index);
            self.free_pending(released.frame, released.bounce);
            state.stats.tx_dropped += 1;
            return Err(e.into());
        }

        state.stats.tx_packets += 1;
        state.stats.tx_bytes += len as u64;
        Ok(TransmitStatus::Sent)
    }

    /// Copies the frame's data into a freshly allocated, aligned buffer.
    fn bounce(&self, frame: &Frame) -> Option<DmaBuffer> {
        let bounce = match self.allocator.allocate(roundup4(frame.len())) {
            Some(b) => b,
            None => {
                error!("seastar::transmit(): couldn't allocate a {}-byte bounce buffer", frame.len());
                return None;
            }
        };
        bounce.lock()[..frame.len()].copy_from_slice(&frame.data());
        trace!("seastar::transmit(): bounced {} bytes from {:?} to {:?}", frame.len(), frame.phys_addr(), bounce.phys_addr());
        Some(bounce)
    }

    fn free_pending(&self, frame: Option<Frame>, bounce: Option<DmaBuffer>) {
        if let Some(frame) = frame {
            self.allocator.release(frame.into_buffer());
        }
        if let Some(bounce) = bounce {
            self.allocator.release(bounce);
        }
    }

    /// Drains the event queue, handling every event the firmware has published.
    ///
    /// If another caller is already draining, this only records the request and returns;
    /// that caller drains again before it returns.
    /// Returns the number of events handled by this call.
    pub fn handle_interrupt(&self) -> usize {
        self.drain_requested.store(true, Ordering::SeqCst);
        self.drain_requested_events()
    }

    /// Drains the event queue for as long as drains keep being requested.
    fn drain_requested_events(&self) -> usize {
        let mut handled = 0;
        while self.drain_requested.load(Ordering::SeqCst) {
            let mut events = match self.events.try_lock() {
                Some(events) => events,
                None => break,
            };
            self.drain_requested.store(false, Ordering::SeqCst);

            while let Some(event) = events.next_event() {
                handled += 1;
                match event.kind {
                    EventKind::TransmitComplete => self.transmit_complete(event.index),
                    EventKind::ReceiveReady => self.receive(event.index as usize),
                    EventKind::ReceiveEmpty => self.refill_receive_ring(),
                    EventKind::Unknown(kind) => {
                        error!("seastar::handle_interrupt(): unknown event type (type={}, index={})", kind, event.index);
                        self.state.lock().stats.unknown_events += 1;
                    }
                }
            }
        }
        handled
    }

    /// Finishes the transmit tracked by pending slot `index`.
    fn transmit_complete(&self, index: u16) {
        let mut state = self.state.lock();
        if index as usize >= NUM_TX_PENDINGS || !state.pending.is_in_use(index) {
            warn!("seastar::transmit_complete(): ignoring completion for idle pending slot {}", index);
            return;
        }

        let released = state.pending.release(index);
        self.free_pending(released.frame, released.bounce);

        if state.queue_stopped {
            trace!("seastar::transmit_complete(): waking transmit queue");
            state.queue_stopped = false;
        }
    }

    /// Hands the datagram in receive slot `index` up to the network stack and reposts the slot.
    fn receive(&self, index: usize) {
        if index >= NUM_SKBS {
            error!("seastar::receive(): receive slot {} out of range", index);
            self.state.lock().stats.rx_dropped += 1;
            return;
        }

        let (frame, local_mac) = {
            let mut state = self.state.lock();
            match state.rx_ring.take(index) {
                Some(frame) => (frame, state.mac_address),
                None => {
                    warn!("seastar::receive(): no buffer posted in slot {}", index);
                    state.stats.rx_dropped += 1;
                    state.rx_ring.refill(index, &*self.mem, &*self.allocator);
                    return;
                }
            }
        };

        let delivered = match self.convert_received(frame, &local_mac) {
            Ok((received, len)) => {
                self.stack.receive_frame(received);
                Some(len)
            }
            Err(frame) => {
                self.allocator.release(frame.into_buffer());
                None
            }
        };

        let mut state = self.state.lock();
        let state = &mut *state;
        match delivered {
            Some(len) => {
                state.stats.rx_packets += 1;
                state.stats.rx_bytes += len as u64;
            }
            None => state.stats.rx_dropped += 1,
        }
        state.rx_ring.refill(index, &*self.mem, &*self.allocator);
    }

    /// Turns a filled receive buffer into an Ethernet frame for the network stack.
    /// Returns the frame along with the datagram's length on the wire,
    /// or gives the frame back if it holds no valid datagram.
    fn convert_received(&self, mut frame: Frame, local_mac: &[u8; ETH_ALEN]) -> Result<(ReceivedFrame, usize), Frame> {
        let header = WireHeader::read(&frame.tail());
        let len = header.frame_len();
        if frame.put(len).is_err() {
            warn!("seastar::receive(): {}-byte datagram overruns its {}-byte buffer", len, frame.tailroom());
            return Err(frame);
        }
        if let Err(_e) = framer::decode(&mut frame, local_mac) {
            warn!("seastar::receive(): {:?}", _e);
            return Err(frame);
        }
        Ok((ReceivedFrame::new(frame, ETH_P_IP, ETH_HLEN), len))
    }

    /// Posts a buffer to every empty receive slot.
    fn refill_receive_ring(&self) {
        let mut state = self.state.lock();
        let still_empty = state.rx_ring.refill_empty(&*self.mem, &*self.allocator);
        if still_empty != 0 {
            warn!("seastar::refill_receive_ring(): {} receive slots still empty", still_empty);
        }
    }

    /// Pushes an Ethernet header for this device in front of the frame's data.
    /// The source address defaults to the device's own address.
    pub fn create_header(
        &self,
        frame: &mut Frame,
        ethertype: u16,
        daddr: Option<&[u8; ETH_ALEN]>,
        saddr: Option<&[u8; ETH_ALEN]>,
    ) -> Result<usize, framer::FramingError> {
        let dev_addr = self.mac_address();
        framer::create_header(frame, ethertype, daddr, saddr, &dev_addr)
    }

    /// Routes the SeaStar's interrupts to the given HyperTransport interrupt message address.
    pub fn update_irq_routing(&self, address_lo: u32) {
        let value = htb_bi_value(address_lo);
        debug!("seastar::update_irq_routing(): HTB_BI = {:#010X}", value);
        self.mem.write_u32(SEASTAR_HTB_BI, value);
    }

    pub fn mac_address(&self) -> [u8; ETH_ALEN] {
        self.state.lock().mac_address
    }

    pub fn set_mac_address(&self, mac_address: [u8; ETH_ALEN]) {
        self.state.lock().mac_address = mac_address;
    }

    /// This node's id on the interconnect.
    pub fn nid(&self) -> u16 {
        self.nid
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn host_map(&self) -> HostMemoryMap {
        self.host_map
    }

    pub fn is_queue_stopped(&self) -> bool {
        self.state.lock().queue_stopped
    }

    /// Number of transmits waiting for their completion event.
    pub fn transmits_in_flight(&self) -> usize {
        self.state.lock().pending.in_flight()
    }

    /// Number of receive slots holding a buffer.
    pub fn receive_buffers_posted(&self) -> usize {
        self.state.lock().rx_ring.posted()
    }

    pub fn stats(&self) -> DeviceStats {
        let state = self.state.lock();
        DeviceStats {
            rx_refill_failures: state.rx_ring.refill_failures(),
            ..state.stats
        }
    }

    /// Datagram counters kept by the firmware in the NIC control block.
    pub fn firmware_counters(&self) -> FirmwareCounters {
        FirmwareCounters::read(&*self.mem)
    }
}


#[cfg(test)]
mod test;
