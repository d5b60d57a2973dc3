//! A software model of the SeaStar NIC and the parts of its firmware the host driver talks to.
//!
//! [`SimulatedSeaStar`] implements [`SeaStarMemory`] over a sparse byte map of the SeaStar address space.
//! Publishing a new command queue write cursor runs the firmware model, which consumes commands,
//! posts results, reads transmitted datagrams out of [`SimulatedDma`] memory,
//! and writes events into the host event queue through the HTB map the host programmed.
//!
//! Tests steer the model to stall, fail a bring-up stage, deliver datagrams, or post arbitrary events.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
extern crate spin;
extern crate byteorder;
extern crate nic_buffers;
extern crate seastar_firmware;

mod dma;

pub use dma::{SimulatedDma, DMA_ALIGN};

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;
use byteorder::{ByteOrder, LittleEndian};
use spin::Mutex;
use seastar_firmware::{
    header::{byte_length, WireHeader, WIRE_HEADER_LEN, HDR_TYPE_IP_DATAGRAM},
    htb_map_entry, mailbox, niccb, skb_table_entry,
    Command, CommandOpcode, Event, EventKind, SeaStarAddress, SeaStarMemory,
    COMMAND_Q_LENGTH, COMMAND_SIZE, HTB_MAP_VALID, NUM_SKBS, RESULT_Q_LENGTH,
    SEASTAR_NICCB_BASE, SEASTAR_TX_SOURCE,
};

/// HTB map entry through which host memory is reached.
const HOST_MAP_INDEX: usize = 8;
const HOST_MAP_SHIFT: usize = 28;
const HOST_SPACE_TAG: u32 = 8 << HOST_MAP_SHIFT;

pub const DEFAULT_NID: u16 = 0x2A;
pub const FIRMWARE_VERSION: u32 = 0x0001_0002;
pub const FIRMWARE_BUILD_TIME: u32 = 0x4A1B_2C3D;


/// A datagram the firmware model was asked to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    pub nid: u16,
    pub pending_index: u16,
    /// Quad-byte address the datagram was read from.
    pub address: u64,
    pub header: WireHeader,
    /// The whole datagram as read from host memory, wire header included,
    /// as long as the header's length field says.
    pub bytes: Vec<u8>,
}

impl SentDatagram {
    /// The bytes following the wire header.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[WIRE_HEADER_LEN..]
    }
}


struct SimState {
    memory: BTreeMap<u32, u8>,
    stalled: bool,
    withhold_results: bool,
    auto_complete: bool,
    result_overrides: BTreeMap<u8, u32>,
    alive: bool,
    init: Option<Command>,
    eq_base: Option<u32>,
    eq_count: usize,
    eq_write: usize,
    eq_overflows: usize,
    commands: Vec<Command>,
    transmitted: Vec<SentDatagram>,
    in_flight: BTreeSet<u16>,
    duplicate_pendings: usize,
    bad_datagrams: usize,
    next_rx: usize,
}

impl SimState {
    fn read(&self, addr: u32, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.memory.get(&(addr + i as u32)).copied().unwrap_or(0);
        }
    }

    fn write(&mut self, addr: u32, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.memory.insert(addr + i as u32, *b);
        }
    }

    fn read_u32(&self, addr: SeaStarAddress) -> u32 {
        let mut buf = [0u8; 4];
        self.read(addr.value(), &mut buf);
        LittleEndian::read_u32(&buf)
    }

    fn write_u32(&mut self, addr: SeaStarAddress, value: u32) {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.write(addr.value(), &buf);
    }

    fn read_u64(&self, addr: SeaStarAddress) -> u64 {
        let mut buf = [0u8; 8];
        self.read(addr.value(), &mut buf);
        LittleEndian::read_u64(&buf)
    }

    fn write_u64(&mut self, addr: SeaStarAddress, value: u64) {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, value);
        self.write(addr.value(), &buf);
    }

    fn bump_counter(&mut self, offset: u32) {
        let addr = SEASTAR_NICCB_BASE + offset;
        let value = self.read_u32(addr);
        self.write_u32(addr, value.wrapping_add(1));
    }

    /// Converts a firmware address of host memory into a host physical address,
    /// using the HTB map entries the host programmed.
    fn host_phys(&self, fw_addr: u32) -> Option<usize> {
        let entry = self.read_u32(htb_map_entry(HOST_MAP_INDEX));
        if entry & HTB_MAP_VALID == 0 || fw_addr < HOST_SPACE_TAG {
            return None;
        }
        let base = ((entry & !HTB_MAP_VALID) as usize) << HOST_MAP_SHIFT;
        Some(base + (fw_addr - HOST_SPACE_TAG) as usize)
    }
}


/// A simulated SeaStar.
pub struct SimulatedSeaStar {
    dma: Arc<SimulatedDma>,
    inner: Mutex<SimState>,
}

impl SimulatedSeaStar {
    /// Creates a SeaStar with node id [`DEFAULT_NID`] whose host memory is `dma`.
    pub fn new(dma: Arc<SimulatedDma>) -> SimulatedSeaStar {
        let mut state = SimState {
            memory: BTreeMap::new(),
            stalled: false,
            withhold_results: false,
            auto_complete: false,
            result_overrides: BTreeMap::new(),
            alive: false,
            init: None,
            eq_base: None,
            eq_count: 0,
            eq_write: 0,
            eq_overflows: 0,
            commands: Vec::new(),
            transmitted: Vec::new(),
            in_flight: BTreeSet::new(),
            duplicate_pendings: 0,
            bad_datagrams: 0,
            next_rx: 0,
        };
        let mut nid = [0u8; 2];
        LittleEndian::write_u16(&mut nid, DEFAULT_NID);
        state.write(SEASTAR_TX_SOURCE.value(), &nid);
        state.write_u32(SEASTAR_NICCB_BASE + niccb::VERSION_OFFSET, FIRMWARE_VERSION);
        state.write_u32(SEASTAR_NICCB_BASE + niccb::BUILD_TIME_OFFSET, FIRMWARE_BUILD_TIME);

        SimulatedSeaStar { dma, inner: Mutex::new(state) }
    }

    pub fn dma(&self) -> &Arc<SimulatedDma> {
        &self.dma
    }

    /// Sets the node id reported in the TX_SOURCE register.
    pub fn set_nid(&self, nid: u16) {
        let mut buf = [0u8; 2];
        LittleEndian::write_u16(&mut buf, nid);
        self.inner.lock().write(SEASTAR_TX_SOURCE.value(), &buf);
    }

    /// A stalled firmware leaves commands in the queue untouched.
    /// Un-stalling it processes whatever has queued up.
    pub fn set_stalled(&self, stalled: bool) {
        let mut state = self.inner.lock();
        state.stalled = stalled;
        if !stalled {
            self.process_commands(&mut state);
        }
    }

    /// Consume commands but never post their results.
    pub fn set_withhold_results(&self, withhold: bool) {
        self.inner.lock().withhold_results = withhold;
    }

    /// Answer every command with `opcode` with `result` instead of the successful result.
    pub fn set_result(&self, opcode: CommandOpcode, result: u32) {
        self.inner.lock().result_overrides.insert(opcode as u8, result);
    }

    /// Post a transmit-complete event as soon as each datagram is sent.
    pub fn set_auto_complete(&self, auto_complete: bool) {
        self.inner.lock().auto_complete = auto_complete;
    }

    /// Whether the host has completed the bring-up handshake.
    pub fn is_alive(&self) -> bool {
        self.inner.lock().alive
    }

    /// The `Init` command received during bring-up.
    pub fn init_command(&self) -> Option<Command> {
        self.inner.lock().init
    }

    /// Firmware address and entry count of the registered event queue.
    pub fn event_queue(&self) -> Option<(u32, usize)> {
        let state = self.inner.lock();
        state.eq_base.map(|base| (base, state.eq_count))
    }

    /// Every command consumed so far, in order.
    pub fn commands(&self) -> Vec<Command> {
        self.inner.lock().commands.clone()
    }

    /// Number of commands published by the host and not consumed yet.
    pub fn queued_commands(&self) -> usize {
        let state = self.inner.lock();
        let read = state.read_u32(mailbox::commandq_read()) as usize;
        let write = state.read_u32(mailbox::commandq_write()) as usize;
        (write + COMMAND_Q_LENGTH - read) % COMMAND_Q_LENGTH
    }

    /// Removes and returns the datagrams sent so far.
    pub fn take_transmitted(&self) -> Vec<SentDatagram> {
        core::mem::take(&mut self.inner.lock().transmitted)
    }

    /// Pending indices of sent datagrams whose completion has not been posted.
    pub fn in_flight(&self) -> Vec<u16> {
        self.inner.lock().in_flight.iter().copied().collect()
    }

    /// Number of times the host reused a pending index that was still in flight.
    pub fn duplicate_pendings(&self) -> usize {
        self.inner.lock().duplicate_pendings
    }

    /// Number of transmit commands whose datagram could not be read from host memory.
    pub fn bad_datagrams(&self) -> usize {
        self.inner.lock().bad_datagrams
    }

    /// Number of events dropped because the host had not consumed the slot they needed.
    pub fn eq_overflows(&self) -> usize {
        self.inner.lock().eq_overflows
    }

    /// The quad-byte address posted in receive table entry `index`.
    pub fn skb_entry(&self, index: usize) -> u64 {
        self.inner.lock().read_u64(skb_table_entry(index))
    }

    /// Posts a transmit-complete event for `pending_index`.
    pub fn complete(&self, pending_index: u16) -> bool {
        let mut state = self.inner.lock();
        state.in_flight.remove(&pending_index);
        self.post_event(&mut state, Event::new(EventKind::TransmitComplete, pending_index).to_word())
    }

    /// Posts a transmit-complete event for every datagram in flight. Returns how many were posted.
    pub fn complete_all(&self) -> usize {
        let mut state = self.inner.lock();
        let indices: Vec<u16> = core::mem::take(&mut state.in_flight).into_iter().collect();
        for &index in indices.iter() {
            self.post_event(&mut state, Event::new(EventKind::TransmitComplete, index).to_word());
        }
        indices.len()
    }

    /// Posts a raw event word.
    pub fn post_raw_event(&self, word: u32) -> bool {
        let mut state = self.inner.lock();
        self.post_event(&mut state, word)
    }

    /// Receives an IP datagram carrying `payload` from the given lo_macs.
    ///
    /// The datagram goes into the next posted receive buffer, whose table entry is consumed.
    /// If no buffer is posted, a receive-empty event is posted instead and `None` returned.
    pub fn deliver(&self, source_lo_mac: u8, dest_lo_mac: u8, payload: &[u8]) -> Option<usize> {
        let bytes = wire_datagram(source_lo_mac, dest_lo_mac, payload);

        let mut state = self.inner.lock();
        let start = state.next_rx;
        let posted = (0..NUM_SKBS)
            .map(|i| (start + i) % NUM_SKBS)
            .find(|&i| state.read_u64(skb_table_entry(i)) != 0);
        let index = match posted {
            Some(index) => index,
            None => {
                self.post_event(&mut state, Event::new(EventKind::ReceiveEmpty, 0).to_word());
                return None;
            }
        };
        state.next_rx = (index + 1) % NUM_SKBS;

        if self.fill_receive_buffer(&mut state, index, &bytes) {
            state.bump_counter(niccb::IP_RX_OFFSET);
            Some(index)
        } else {
            state.bump_counter(niccb::IP_RX_DROP_OFFSET);
            None
        }
    }

    /// Writes `bytes` into the buffer posted in receive table entry `index` and posts a receive event.
    /// The bytes are written as given, so they may describe a malformed datagram.
    pub fn deliver_raw(&self, index: usize, bytes: &[u8]) -> bool {
        let mut state = self.inner.lock();
        self.fill_receive_buffer(&mut state, index, bytes)
    }

    /// Signals that the firmware ran out of receive buffers.
    pub fn signal_rx_empty(&self) -> bool {
        let mut state = self.inner.lock();
        self.post_event(&mut state, Event::new(EventKind::ReceiveEmpty, 0).to_word())
    }

    fn fill_receive_buffer(&self, state: &mut SimState, index: usize, bytes: &[u8]) -> bool {
        let entry = state.read_u64(skb_table_entry(index));
        if entry == 0 {
            warn!("SimulatedSeaStar::deliver(): no buffer posted in slot {}", index);
            return false;
        }
        let phys = (entry << 2) as usize;
        let room = self.dma.room_at(phys);
        let len = bytes.len().min(room);
        if !self.dma.write(phys, &bytes[..len]) {
            warn!("SimulatedSeaStar::deliver(): slot {} points at unknown memory {:#X}", index, phys);
            return false;
        }
        state.write_u64(skb_table_entry(index), 0);
        self.post_event(state, Event::new(EventKind::ReceiveReady, index as u16).to_word())
    }

    /// Writes an event word into the next slot of the host event queue.
    fn post_event(&self, state: &mut SimState, word: u32) -> bool {
        let (base, count) = match state.eq_base {
            Some(base) if state.eq_count != 0 => (base, state.eq_count),
            _ => {
                warn!("SimulatedSeaStar::post_event(): no event queue registered");
                return false;
            }
        };
        let phys = match state.host_phys(base) {
            Some(phys) => phys + state.eq_write * 4,
            None => {
                warn!("SimulatedSeaStar::post_event(): event queue {:#X} is not mapped", base);
                return false;
            }
        };

        let current = self.dma.read(phys, 4).map(|b| LittleEndian::read_u32(&b));
        if current != Some(0) {
            state.eq_overflows += 1;
            return false;
        }
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, word);
        self.dma.write(phys, &buf);
        state.eq_write = (state.eq_write + 1) % count;
        true
    }

    fn post_result(&self, state: &mut SimState, result: u32) {
        if state.withhold_results {
            return;
        }
        let write = state.read_u32(mailbox::resultq_write()) as usize % RESULT_Q_LENGTH;
        state.write_u32(mailbox::result_slot(write), result);
        state.write_u32(mailbox::resultq_write(), ((write + 1) % RESULT_Q_LENGTH) as u32);
    }

    /// Consumes every published command.
    fn process_commands(&self, state: &mut SimState) {
        if state.stalled {
            return;
        }
        loop {
            let read = state.read_u32(mailbox::commandq_read()) as usize % COMMAND_Q_LENGTH;
            let write = state.read_u32(mailbox::commandq_write()) as usize % COMMAND_Q_LENGTH;
            if read == write {
                break;
            }

            let mut rec = [0u8; COMMAND_SIZE];
            state.read(mailbox::command_slot(read).value(), &mut rec);
            match Command::decode(&rec) {
                Ok(cmd) => {
                    state.commands.push(cmd);
                    self.execute(state, cmd);
                }
                Err(_e) => warn!("SimulatedSeaStar: bad command in slot {}: {}", read, _e),
            }
            state.write_u32(mailbox::commandq_read(), ((read + 1) % COMMAND_Q_LENGTH) as u32);
        }
    }

    fn execute(&self, state: &mut SimState, cmd: Command) {
        let overridden = state.result_overrides.get(&(cmd.opcode() as u8)).copied();
        match cmd {
            Command::Init(_) => {
                state.init = Some(cmd);
                self.post_result(state, overridden.unwrap_or(0));
            }
            Command::InitEventQueue { base, count, .. } => {
                state.eq_base = Some(base);
                state.eq_count = count as usize;
                state.eq_write = 0;
                self.post_result(state, overridden.unwrap_or(1));
            }
            Command::MarkAlive { .. } => {
                let result = overridden.unwrap_or(0);
                state.alive = result == 0;
                self.post_result(state, result);
            }
            Command::TransmitDatagram { nid, length, address, pending_index } => {
                self.transmit(state, nid, length, address, pending_index);
            }
        }
    }

    fn transmit(&self, state: &mut SimState, nid: u16, length: u16, address: u64, pending_index: u16) {
        if !state.in_flight.insert(pending_index) {
            error!("SimulatedSeaStar: pending index {} is already in flight", pending_index);
            state.duplicate_pendings += 1;
        }

        let phys = (address << 2) as usize;
        let len = byte_length(length);
        let bytes = match self.dma.read(phys, len) {
            Some(bytes) => bytes,
            None => {
                warn!("SimulatedSeaStar: can't read {} bytes of datagram at {:#X}", len, phys);
                state.bad_datagrams += 1;
                state.bump_counter(niccb::IP_TX_DROP_OFFSET);
                return;
            }
        };
        let header = WireHeader::read(&bytes);
        if header.length != length || header.hdr_type != HDR_TYPE_IP_DATAGRAM {
            warn!("SimulatedSeaStar: datagram header {:?} doesn't match command length {}", header, length);
            state.bad_datagrams += 1;
        }

        state.transmitted.push(SentDatagram { nid, pending_index, address, header, bytes });
        state.bump_counter(niccb::IP_TX_OFFSET);

        if state.auto_complete {
            state.in_flight.remove(&pending_index);
            self.post_event(state, Event::new(EventKind::TransmitComplete, pending_index).to_word());
        }
    }
}

impl SeaStarMemory for SimulatedSeaStar {
    fn read_u16(&self, addr: SeaStarAddress) -> u16 {
        let mut buf = [0u8; 2];
        self.inner.lock().read(addr.value(), &mut buf);
        LittleEndian::read_u16(&buf)
    }

    fn write_u16(&self, addr: SeaStarAddress, value: u16) {
        let mut buf = [0u8; 2];
        LittleEndian::write_u16(&mut buf, value);
        self.inner.lock().write(addr.value(), &buf);
    }

    fn read_u32(&self, addr: SeaStarAddress) -> u32 {
        self.inner.lock().read_u32(addr)
    }

    fn write_u32(&self, addr: SeaStarAddress, value: u32) {
        let mut state = self.inner.lock();
        state.write_u32(addr, value);
        // Publishing the write cursor is the firmware's doorbell.
        if addr == mailbox::commandq_write() {
            self.process_commands(&mut state);
        }
    }

    fn read_u64(&self, addr: SeaStarAddress) -> u64 {
        self.inner.lock().read_u64(addr)
    }

    fn write_u64(&self, addr: SeaStarAddress, value: u64) {
        self.inner.lock().write_u64(addr, value);
    }
}


/// Builds the wire bytes of an IP datagram carrying `payload`, the way the SeaStar delivers it.
pub fn wire_datagram(source_lo_mac: u8, dest_lo_mac: u8, payload: &[u8]) -> Vec<u8> {
    let total = WIRE_HEADER_LEN + payload.len();
    let mut bytes = Vec::with_capacity(total);
    bytes.resize(WIRE_HEADER_LEN, 0);
    WireHeader::ip_datagram(total, source_lo_mac, dest_lo_mac).write(&mut bytes);
    bytes.extend_from_slice(payload);
    bytes
}
