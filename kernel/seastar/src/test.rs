//! Tests of the driver against a simulated SeaStar.

extern crate std;

use super::*;
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use spin::Mutex;
use nic_buffers::PhysicalAddress;
use seastar_firmware::{
    htb_map_entry, niccb, mailbox as mailbox_layout,
    header::{quadbyte_length, WireHeader},
    CommandOpcode, Event, InitCommand, SEASTAR_HOST_BASE,
};
use seastar_sim::{SimulatedDma, SimulatedSeaStar, DEFAULT_NID};
use crate::config::SKB_PAD;
use crate::events::EventQueue;
use crate::framer::FramingError;
use crate::pending::PendingPool;
use crate::translator::WINDOW_SIZE;

const LOCAL_MAC: [u8; ETH_ALEN] = [0x02, 0x00, 0x00, 0x00, 0x2A, 0x03];
const PEER_MAC:  [u8; ETH_ALEN] = [0x00, 0x00, 0x00, 0x2B, 0x00, 0x0A];


#[derive(Default)]
struct CapturingStack {
    frames: Mutex<Vec<ReceivedFrame>>,
}

impl NetworkStack for CapturingStack {
    fn receive_frame(&self, frame: ReceivedFrame) {
        self.frames.lock().push(frame);
    }
}

struct Rig {
    dma: Arc<SimulatedDma>,
    sim: Arc<SimulatedSeaStar>,
    stack: Arc<CapturingStack>,
    nic: SeaStarNic,
}

fn test_config() -> SeaStarConfig {
    SeaStarConfig {
        mtu: 2000,
        wait: WaitPolicy::new(1000),
        mac_address: LOCAL_MAC,
        ..Default::default()
    }
}

fn parts() -> (Arc<SimulatedDma>, Arc<SimulatedSeaStar>, Arc<CapturingStack>) {
    let dma = Arc::new(SimulatedDma::new());
    let sim = Arc::new(SimulatedSeaStar::new(dma.clone()));
    (dma, sim, Arc::new(CapturingStack::default()))
}

fn init(
    dma: &Arc<SimulatedDma>,
    sim: &Arc<SimulatedSeaStar>,
    stack: &Arc<CapturingStack>,
) -> Result<SeaStarNic, SeaStarError> {
    SeaStarNic::init(test_config(), sim.clone(), dma.clone(), stack.clone())
}

/// A device that has been brought up and opened.
fn rig() -> Rig {
    let (dma, sim, stack) = parts();
    let nic = init(&dma, &sim, &stack).unwrap();
    nic.open();
    Rig { dma, sim, stack, nic }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 1) as u8).collect()
}

fn ethernet(dest: &[u8; ETH_ALEN], source: &[u8; ETH_ALEN], ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(dest);
    bytes.extend_from_slice(source);
    bytes.extend_from_slice(&ethertype.to_be_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// Places `bytes` in a new buffer, `headroom` bytes past its 64-byte aligned start.
fn frame_in(dma: &SimulatedDma, headroom: usize, bytes: &[u8]) -> Frame {
    let buffer = dma.allocate(headroom + bytes.len() + 16).unwrap();
    Frame::from_bytes(buffer, headroom, bytes).unwrap()
}

/// A frame whose datagram will be quad-byte aligned once the Ethernet header is stripped.
fn ip_frame(dma: &SimulatedDma, payload: &[u8]) -> Frame {
    frame_in(dma, 2, &ethernet(&PEER_MAC, &LOCAL_MAC, ETH_P_IP, payload))
}

fn expect_busy(status: TransmitStatus) -> Frame {
    match status {
        TransmitStatus::Busy(frame) => frame,
        other => panic!("expected Busy, got {:?}", other),
    }
}


#[test]
fn host_window_starts_at_256mib_boundary() {
    let map = HostMemoryMap::covering(PhysicalAddress::new(0x2_3456_0000));
    assert_eq!(map.base(), PhysicalAddress::new(0x2_3000_0000));
    assert_eq!(map.translate(PhysicalAddress::new(0x2_3456_0000)), 0x8456_0000);
    assert_eq!(map.translate(PhysicalAddress::new(0x2_3000_0000)), 0x8000_0000);
    assert_eq!(map.translate(PhysicalAddress::new(0x2_3000_0000 + WINDOW_SIZE - 4)), 0x9FFF_FFFC);

    assert!(map.contains(PhysicalAddress::new(0x2_4FFF_FFFF)));
    assert!(!map.contains(PhysicalAddress::new(0x2_5000_0000)));
    assert!(!map.contains(PhysicalAddress::new(0x2_2FFF_FFFF)));
}

#[test]
fn mapping_programs_two_consecutive_entries() {
    let (_dma, sim, _stack) = parts();
    let map = HostMemoryMap::map_host_region(&*sim, PhysicalAddress::new(0x2_3456_0000));
    assert_eq!(map.base(), PhysicalAddress::new(0x2_3000_0000));
    assert_eq!(sim.read_u32(htb_map_entry(8)), 0x8000 | 0x23);
    assert_eq!(sim.read_u32(htb_map_entry(9)), 0x8000 | 0x24);
    assert_eq!(sim.read_u32(htb_map_entry(10)), 0);
}


#[test]
fn command_queue_holds_62_outstanding_commands() {
    let (_dma, sim, _stack) = parts();
    sim.set_stalled(true);
    let mut mailbox = Mailbox::load(&*sim, WaitPolicy::new(100));

    for _ in 0..62 {
        mailbox.post(&*sim, &Command::MarkAlive { index: 1 }).unwrap();
    }
    assert_eq!(mailbox.outstanding(), 62);
    assert_eq!(sim.queued_commands(), 62);

    assert_eq!(
        mailbox.post(&*sim, &Command::MarkAlive { index: 1 }),
        Err(MailboxError::CommandQueueFull)
    );
    // The failed command was never published.
    assert_eq!(sim.queued_commands(), 62);

    sim.set_stalled(false);
    assert_eq!(sim.queued_commands(), 0);
    assert_eq!(sim.commands().len(), 62);
    mailbox.post(&*sim, &Command::MarkAlive { index: 1 }).unwrap();
    assert_eq!(sim.commands().len(), 63);
}

#[test]
fn call_returns_the_firmware_result() {
    let (_dma, sim, _stack) = parts();
    let mut mailbox = Mailbox::load(&*sim, WaitPolicy::new(100));
    let cmd = Command::MarkAlive { index: 1 };

    assert_eq!(mailbox.call(&*sim, &cmd), Ok(0));
    assert_eq!(sim.read_u32(mailbox_layout::resultq_read()), 1);

    sim.set_result(CommandOpcode::MarkAlive, 7);
    assert_eq!(mailbox.submit(&*sim, &cmd, true), Ok(Some(7)));
    // The result ring wraps after two entries.
    assert_eq!(sim.read_u32(mailbox_layout::resultq_read()), 0);
    assert_eq!(mailbox.call(&*sim, &cmd), Ok(7));
    assert_eq!(sim.read_u32(mailbox_layout::resultq_read()), 1);

    assert_eq!(mailbox.submit(&*sim, &cmd, false), Ok(None));
    assert_eq!(sim.commands().len(), 4);
}

#[test]
fn call_times_out_without_a_result() {
    let (_dma, sim, _stack) = parts();
    sim.set_withhold_results(true);
    let mut mailbox = Mailbox::load(&*sim, WaitPolicy::new(100));
    assert_eq!(mailbox.wait_policy(), WaitPolicy::new(100));
    assert_eq!(
        mailbox.call(&*sim, &Command::MarkAlive { index: 1 }),
        Err(MailboxError::ResultTimeout)
    );
    // The command itself was consumed.
    assert_eq!(sim.commands().len(), 1);
}


#[test]
fn pending_slots_are_unique_until_released() {
    let mut pool = PendingPool::new();
    assert_eq!(pool.free_count(), NUM_TX_PENDINGS);

    let mut taken = BTreeSet::new();
    while let Some(index) = pool.allocate() {
        assert!((index as usize) < NUM_TX_PENDINGS);
        assert!(taken.insert(index), "slot {} handed out twice", index);
        assert!(pool.is_in_use(index));
    }
    assert_eq!(taken.len(), NUM_TX_PENDINGS);
    assert_eq!(pool.free_count(), 0);
    assert_eq!(pool.in_flight(), NUM_TX_PENDINGS);

    let released = pool.release(17);
    assert!(released.frame.is_none() && released.bounce.is_none());
    assert!(!pool.is_in_use(17));
    assert_eq!(pool.allocate(), Some(17));
    assert_eq!(pool.allocate(), None);

    for index in taken {
        pool.release(index);
    }
    assert_eq!(pool.free_count(), NUM_TX_PENDINGS);
    assert!(!pool.is_in_use(100));
}

#[test]
fn released_slot_gives_back_its_frame() {
    let dma = SimulatedDma::new();
    let mut pool = PendingPool::new();
    let index = pool.allocate().unwrap();
    pool.slot_mut(index).frame = Some(ip_frame(&dma, &payload(8)));

    let released = pool.release(index);
    assert_eq!(released.frame.map(|f| f.len()), Some(ETH_HLEN + 8));
    assert!(pool.slot_mut(index).frame.is_none());
}


#[test]
fn unsendable_frames_are_rejected_untouched() {
    let dma = SimulatedDma::new();
    let body = payload(20);
    let mut broadcast = PEER_MAC;
    broadcast[5] = 0xFF;
    let mut wide_dest = PEER_MAC;
    wide_dest[5] = 0x10;
    let mut wide_source = LOCAL_MAC;
    wide_source[5] = 0x20;

    let cases = [
        (ethernet(&broadcast, &LOCAL_MAC, ETH_P_IP, &body), Rejection::Broadcast),
        (ethernet(&wide_dest, &LOCAL_MAC, ETH_P_IP, &body), Rejection::HostIdOutOfRange),
        (ethernet(&PEER_MAC, &wide_source, ETH_P_IP, &body), Rejection::HostIdOutOfRange),
        (ethernet(&PEER_MAC, &LOCAL_MAC, 0x0806, &body), Rejection::NotIpv4),
        // Protocol is checked before the destination.
        (ethernet(&broadcast, &LOCAL_MAC, 0x86DD, &body), Rejection::NotIpv4),
        (body[..10].to_vec(), Rejection::Truncated),
    ];

    for (bytes, rejection) in cases.iter() {
        let mut frame = frame_in(&dma, 2, bytes);
        assert_eq!(framer::encode(&mut frame).err(), Some(*rejection));
        assert_eq!(&*frame.data(), &bytes[..]);
    }
}

#[test]
fn encode_packs_lo_macs_and_nid() {
    let dma = SimulatedDma::new();
    let body = payload(32);
    let mut frame = ip_frame(&dma, &body);

    let (dest, header) = framer::encode(&mut frame).unwrap();
    assert_eq!(dest.nid, 0x2B);
    assert_eq!((dest.source_lo_mac, dest.dest_lo_mac), (0x3, 0xA));
    assert_eq!(header.lo_macs, 0x3A);
    assert_eq!(header.length, quadbyte_length(4 + 32));
    assert_eq!(frame.len(), 4 + 32);

    let data = frame.data();
    assert_eq!(&data[..4], &[8, 0, 0x3A, 0x40]);
    assert_eq!(&data[4..], &body[..]);
}

#[test]
fn nid_is_the_low_half_of_the_destination_prefix() {
    let dma = SimulatedDma::new();
    let dest = [0x12, 0x34, 0x56, 0x78, 0x9A, 0x01];
    let frame = frame_in(&dma, 2, &ethernet(&dest, &LOCAL_MAC, ETH_P_IP, &payload(4)));
    assert_eq!(framer::inspect(&frame).unwrap().nid, 0x5678);
}

#[test]
fn decode_rebuilds_header_from_local_address() {
    let dma = SimulatedDma::new();
    let body = payload(32);
    let mut frame = ip_frame(&dma, &body);
    framer::encode(&mut frame).unwrap();

    let local = [0x02, 0x00, 0x00, 0x00, 0x77, 0x07];
    let header = framer::decode(&mut frame, &local).unwrap();
    assert_eq!(header.lo_macs, 0x3A);
    assert_eq!(frame.len(), ETH_HLEN + 32);

    let data = frame.data();
    // Only the lo_macs survive the trip, the rest comes from the local address.
    assert_eq!(&data[0..6], &[0x02, 0x00, 0x00, 0x00, 0x77, 0x0A]);
    assert_eq!(&data[6..12], &[0x02, 0x00, 0x00, 0x00, 0x77, 0x03]);
    assert_eq!(&data[12..14], &[0x08, 0x00]);
    assert_eq!(&data[14..], &body[..]);
}

#[test]
fn decode_needs_room_for_the_ethernet_header() {
    let dma = SimulatedDma::new();
    let wire = seastar_sim::wire_datagram(1, 2, &payload(8));
    let mut frame = frame_in(&dma, 0, &wire);
    assert_eq!(framer::decode(&mut frame, &LOCAL_MAC), Err(FramingError::NoHeadroom));

    let mut short = frame_in(&dma, 16, &[1, 2]);
    assert_eq!(framer::decode(&mut short, &LOCAL_MAC), Err(FramingError::Truncated));
}

#[test]
fn create_header_fills_in_addresses() {
    let dma = SimulatedDma::new();
    let body = payload(12);

    let mut frame = frame_in(&dma, ETH_HLEN, &body);
    assert_eq!(framer::create_header(&mut frame, ETH_P_IP, Some(&PEER_MAC), None, &LOCAL_MAC), Ok(ETH_HLEN));
    assert_eq!(&*frame.data(), &ethernet(&PEER_MAC, &LOCAL_MAC, ETH_P_IP, &body)[..]);

    let other = [0x0E, 0, 0, 0, 0, 0x05];
    let mut frame = frame_in(&dma, ETH_HLEN, &body);
    assert_eq!(
        framer::create_header(&mut frame, 0x0806, None, Some(&other), &LOCAL_MAC),
        Err(FramingError::NoDestination)
    );
    // The header is pushed anyway, with a zero destination.
    assert_eq!(&*frame.data(), &ethernet(&[0; ETH_ALEN], &other, 0x0806, &body)[..]);

    let mut cramped = frame_in(&dma, 4, &body);
    assert_eq!(
        framer::create_header(&mut cramped, ETH_P_IP, Some(&PEER_MAC), None, &LOCAL_MAC),
        Err(FramingError::NoHeadroom)
    );
}


#[test]
fn event_queue_consumes_and_clears_slots() {
    let dma = SimulatedDma::new();
    assert!(EventQueue::new(dma.allocate(64).unwrap()).is_err());

    let mut eq = EventQueue::new(dma.allocate(events::HOST_REGION_SIZE).unwrap()).unwrap();
    let phys = eq.phys_addr().value();
    assert_eq!(eq.pending_table_phys_addr().value(), phys + 4096);
    assert_eq!(eq.next_event(), None);

    dma.write(phys, &((126u32 << 16) | 7).to_le_bytes());
    dma.write(phys + 4, &((125u32 << 16) | 3).to_le_bytes());
    assert_eq!(eq.next_event(), Some(Event::new(EventKind::ReceiveReady, 7)));
    assert_eq!(eq.next_event(), Some(Event::new(EventKind::TransmitComplete, 3)));
    assert_eq!(eq.next_event(), None);
    assert_eq!(eq.read_index(), 2);
    assert_eq!(dma.read(phys, 8), Some(alloc::vec![0u8; 8]));
}


#[test]
fn init_runs_the_three_stage_handshake() {
    let (dma, sim, stack) = parts();
    let nic = init(&dma, &sim, &stack).unwrap();

    let opcodes: Vec<CommandOpcode> = sim.commands().iter().map(Command::opcode).collect();
    assert_eq!(opcodes, [CommandOpcode::Init, CommandOpcode::InitEventQueue, CommandOpcode::MarkAlive]);
    assert!(sim.is_alive());
    assert_eq!(sim.commands()[2], Command::MarkAlive { index: 1 });

    // The host region is the first allocation, at SimulatedDma::BASE.
    assert_eq!(nic.host_map().base(), PhysicalAddress::new(0x2_3000_0000));
    assert_eq!(sim.event_queue(), Some((0x8456_0000, 1024)));

    let expected = InitCommand {
        process_index: 1,
        num_pendings: 128,
        pending_tx_limit: 64,
        pending_table_addr: SEASTAR_HOST_BASE.value(),
        up_pending_table_addr: 0x8456_1000,
        num_eqcbs: 1,
        eqcb_table_addr: SEASTAR_HOST_BASE.value() + 128 * 32,
        eqheap_addr: 0x8456_0000,
        eqheap_length: 4096,
        ..Default::default()
    };
    assert_eq!(sim.init_command(), Some(Command::Init(expected)));

    assert_eq!(nic.nid(), DEFAULT_NID);
    assert_eq!(niccb::local_nid(&*sim), DEFAULT_NID);
    assert_eq!(nic.mtu(), 2000);
    assert_eq!(dma.live_buffers(), 1);
}

#[test]
fn bringup_stops_at_the_first_failed_stage() {
    let cases = [
        (CommandOpcode::Init, BringupStage::Init, 1, 1),
        (CommandOpcode::InitEventQueue, BringupStage::InitEventQueue, 0, 2),
        (CommandOpcode::MarkAlive, BringupStage::MarkAlive, 2, 3),
    ];

    for &(opcode, stage, result, commands) in cases.iter() {
        let (dma, sim, stack) = parts();
        sim.set_result(opcode, result);
        let err = init(&dma, &sim, &stack).err();
        assert_eq!(err, Some(SeaStarError::Bringup(BringupError::UnexpectedResult { stage, result })));
        assert_eq!(sim.commands().len(), commands);
        assert!(!sim.is_alive());
        // The host region is given back.
        assert_eq!(dma.live_buffers(), 0);
    }
}

#[test]
fn bringup_times_out_on_silent_firmware() {
    let (dma, sim, stack) = parts();
    sim.set_withhold_results(true);
    assert_eq!(
        init(&dma, &sim, &stack).err(),
        Some(SeaStarError::Bringup(BringupError::Timeout {
            stage: BringupStage::Init,
            cause: MailboxError::ResultTimeout,
        }))
    );
}

#[test]
fn init_fails_without_host_memory() {
    let (dma, sim, stack) = parts();
    dma.limit_allocations(Some(0));
    assert_eq!(init(&dma, &sim, &stack).err(), Some(SeaStarError::OutOfMemory));
    assert!(sim.commands().is_empty());
}


#[test]
fn transmit_waits_for_open() {
    let (dma, sim, stack) = parts();
    let nic = init(&dma, &sim, &stack).unwrap();
    assert!(nic.is_queue_stopped());

    let bytes = ethernet(&PEER_MAC, &LOCAL_MAC, ETH_P_IP, &payload(16));
    let frame = expect_busy(nic.transmit(frame_in(&dma, 2, &bytes)).unwrap());
    assert_eq!(&*frame.data(), &bytes[..]);
    assert_eq!(nic.stats().tx_busy, 1);

    nic.open();
    assert!(!nic.is_queue_stopped());
    assert_eq!(nic.receive_buffers_posted(), NUM_SKBS);
    assert!(matches!(nic.transmit(frame).unwrap(), TransmitStatus::Sent));
}

#[test]
fn transmit_and_complete() {
    let r = rig();
    assert_eq!(r.dma.live_buffers(), 1 + NUM_SKBS);

    let body = payload(32);
    let frame = ip_frame(&r.dma, &body);
    let datagram_phys = frame.phys_addr().value() + framer::HEADER_DELTA;
    assert!(matches!(r.nic.transmit(frame).unwrap(), TransmitStatus::Sent));
    assert_eq!(r.nic.transmits_in_flight(), 1);

    let sent = r.sim.take_transmitted();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].nid, 0x2B);
    assert_eq!((sent[0].address << 2) as usize, datagram_phys);
    assert_eq!(sent[0].header, WireHeader::ip_datagram(36, 0x3, 0xA));
    assert_eq!(sent[0].payload(), &body[..]);
    assert_eq!(r.sim.bad_datagrams(), 0);

    assert!(r.sim.complete(sent[0].pending_index));
    assert_eq!(r.nic.handle_interrupt(), 1);
    assert_eq!(r.nic.transmits_in_flight(), 0);
    assert_eq!(r.dma.live_buffers(), 1 + NUM_SKBS);

    let stats = r.nic.stats();
    assert_eq!(stats.tx_packets, 1);
    assert_eq!(stats.tx_bytes, 36);
    assert_eq!(stats.tx_errors, 0);
    assert_eq!(r.nic.firmware_counters().ip_tx, 1);
}

#[test]
fn created_header_can_be_sent() {
    let r = rig();
    let body = payload(20);
    let mut frame = frame_in(&r.dma, 2 + ETH_HLEN, &body);
    assert_eq!(r.nic.create_header(&mut frame, ETH_P_IP, Some(&PEER_MAC), None), Ok(ETH_HLEN));
    assert!(matches!(r.nic.transmit(frame).unwrap(), TransmitStatus::Sent));

    let sent = r.sim.take_transmitted();
    assert_eq!(sent[0].header.lo_macs, 0x3A);
    assert_eq!(sent[0].payload(), &body[..]);
}

#[test]
fn rejected_frames_count_as_errors() {
    let r = rig();
    let mut broadcast = PEER_MAC;
    broadcast[5] = 0xFF;
    let frame = frame_in(&r.dma, 2, &ethernet(&broadcast, &LOCAL_MAC, ETH_P_IP, &payload(16)));

    assert!(matches!(r.nic.transmit(frame).unwrap(), TransmitStatus::Dropped));
    assert_eq!(r.nic.stats().tx_errors, 1);
    assert_eq!(r.nic.transmits_in_flight(), 0);
    assert!(r.sim.take_transmitted().is_empty());
    assert_eq!(r.dma.live_buffers(), 1 + NUM_SKBS);
}

#[test]
fn unaligned_frames_are_bounced() {
    let r = rig();
    let body = payload(30);
    let frame = frame_in(&r.dma, 0, &ethernet(&PEER_MAC, &LOCAL_MAC, ETH_P_IP, &body));
    let datagram_phys = frame.phys_addr().value() + framer::HEADER_DELTA;
    assert!(!PhysicalAddress::new(datagram_phys).is_aligned(4));

    assert!(matches!(r.nic.transmit(frame).unwrap(), TransmitStatus::Sent));
    assert_eq!(r.dma.live_buffers(), 1 + NUM_SKBS + 2);

    let sent = r.sim.take_transmitted();
    assert_ne!((sent[0].address << 2) as usize, datagram_phys);
    assert_eq!(sent[0].bytes.len(), 36);
    assert_eq!(&sent[0].payload()[..30], &body[..]);

    r.sim.complete(sent[0].pending_index);
    r.nic.handle_interrupt();
    // Both the frame and its bounce copy are freed.
    assert_eq!(r.dma.live_buffers(), 1 + NUM_SKBS);
    assert_eq!(r.dma.bad_releases(), 0);
}

#[test]
fn bounce_allocation_failure_drops_the_frame() {
    let r = rig();
    let frame = frame_in(&r.dma, 0, &ethernet(&PEER_MAC, &LOCAL_MAC, ETH_P_IP, &payload(30)));
    r.dma.limit_allocations(Some(0));

    assert!(matches!(r.nic.transmit(frame).unwrap(), TransmitStatus::Dropped));
    assert_eq!(r.nic.stats().tx_dropped, 1);
    assert_eq!(r.nic.transmits_in_flight(), 0);
    assert!(r.sim.take_transmitted().is_empty());
}

#[test]
fn full_pool_stops_the_queue_until_a_completion() {
    let r = rig();
    for _ in 0..NUM_TX_PENDINGS {
        assert!(matches!(r.nic.transmit(ip_frame(&r.dma, &payload(16))).unwrap(), TransmitStatus::Sent));
    }
    let indices: BTreeSet<u16> = r.sim.take_transmitted().iter().map(|d| d.pending_index).collect();
    assert_eq!(indices.len(), NUM_TX_PENDINGS);
    assert_eq!(r.sim.duplicate_pendings(), 0);

    let bytes = ethernet(&PEER_MAC, &LOCAL_MAC, ETH_P_IP, &payload(16));
    let frame = expect_busy(r.nic.transmit(frame_in(&r.dma, 2, &bytes)).unwrap());
    assert_eq!(&*frame.data(), &bytes[..]);
    assert!(r.nic.is_queue_stopped());
    let frame = expect_busy(r.nic.transmit(frame).unwrap());
    assert_eq!(r.nic.stats().tx_busy, 2);

    let done = r.sim.in_flight()[10];
    r.sim.complete(done);
    assert_eq!(r.nic.handle_interrupt(), 1);
    assert!(!r.nic.is_queue_stopped());

    assert!(matches!(r.nic.transmit(frame).unwrap(), TransmitStatus::Sent));
    assert_eq!(r.sim.take_transmitted()[0].pending_index, done);
    assert_eq!(r.sim.duplicate_pendings(), 0);
}

#[test]
fn stuck_firmware_fails_transmit() {
    let r = rig();
    r.sim.set_stalled(true);

    // The host's cached read cursor still sits before the three bring-up commands.
    for _ in 0..62 {
        assert!(matches!(r.nic.transmit(ip_frame(&r.dma, &payload(8))).unwrap(), TransmitStatus::Sent));
    }
    let live = r.dma.live_buffers();
    assert_eq!(
        r.nic.transmit(ip_frame(&r.dma, &payload(8))).err(),
        Some(SeaStarError::Mailbox(MailboxError::CommandQueueFull))
    );
    assert_eq!(r.dma.live_buffers(), live);
    assert_eq!(r.nic.transmits_in_flight(), 62);
    assert_eq!(r.nic.stats().tx_dropped, 1);

    r.sim.set_stalled(false);
    assert_eq!(r.sim.take_transmitted().len(), 62);
}

#[test]
fn completions_for_idle_slots_are_ignored() {
    let r = rig();
    r.sim.complete(5);
    r.sim.post_raw_event(Event::new(EventKind::TransmitComplete, 100).to_word());
    assert_eq!(r.nic.handle_interrupt(), 2);
    assert_eq!(r.nic.transmits_in_flight(), 0);
    assert_eq!(r.dma.bad_releases(), 0);
}


#[test]
fn received_datagram_reaches_the_stack() {
    let r = rig();
    let body = payload(40);
    let index = r.sim.deliver(0x5, 0x3, &body).unwrap();
    assert_eq!(r.nic.handle_interrupt(), 1);

    let frames = r.stack.frames.lock();
    assert_eq!(frames.len(), 1);
    let received = &frames[0];
    assert_eq!(received.protocol(), ETH_P_IP);
    assert_eq!(received.link_header_len(), ETH_HLEN);
    assert_eq!(received.payload_len(), 40);

    let data = received.frame().data();
    assert_eq!(&data[0..6], &[0x02, 0x00, 0x00, 0x00, 0x2A, 0x03]);
    assert_eq!(&data[6..12], &[0x02, 0x00, 0x00, 0x00, 0x2A, 0x05]);
    assert_eq!(&data[14..], &body[..]);
    drop(data);
    drop(frames);

    // The slot got a fresh buffer.
    assert_ne!(r.sim.skb_entry(index), 0);
    assert_eq!(r.nic.receive_buffers_posted(), NUM_SKBS);
    let stats = r.nic.stats();
    assert_eq!(stats.rx_packets, 1);
    assert_eq!(stats.rx_bytes, 44);
    assert_eq!(r.nic.firmware_counters().ip_rx, 1);

    // The stack owns the buffer it was handed.
    let frame = r.stack.frames.lock().pop().unwrap().into_frame();
    assert_eq!(frame.len(), ETH_HLEN + 40);
    assert!(r.nic.host_map().contains(frame.phys_addr()));
}

#[test]
fn receive_follows_the_device_address() {
    let r = rig();
    r.nic.set_mac_address([0x0E, 0x01, 0x02, 0x03, 0x04, 0x09]);
    r.sim.deliver(0x1, 0x9, &payload(8)).unwrap();
    r.nic.handle_interrupt();

    let frames = r.stack.frames.lock();
    let data = frames[0].frame().data();
    assert_eq!(&data[0..6], &[0x0E, 0x01, 0x02, 0x03, 0x04, 0x09]);
    assert_eq!(&data[6..12], &[0x0E, 0x01, 0x02, 0x03, 0x04, 0x01]);
}

#[test]
fn oversized_datagram_is_dropped() {
    let r = rig();
    let mut header = [0u8; 4];
    WireHeader::ip_datagram(4000, 0x1, 0x3).write(&mut header);
    assert!(r.sim.deliver_raw(0, &header));
    assert_eq!(r.nic.handle_interrupt(), 1);

    assert!(r.stack.frames.lock().is_empty());
    assert_eq!(r.nic.stats().rx_dropped, 1);
    assert_eq!(r.nic.receive_buffers_posted(), NUM_SKBS);
    assert_eq!(r.dma.live_buffers(), 1 + NUM_SKBS);
}

#[test]
fn receive_event_out_of_range_is_dropped() {
    let r = rig();
    r.sim.post_raw_event(Event::new(EventKind::ReceiveReady, 70).to_word());
    assert_eq!(r.nic.handle_interrupt(), 1);
    assert_eq!(r.nic.stats().rx_dropped, 1);
    assert!(r.stack.frames.lock().is_empty());
}

#[test]
fn unknown_events_are_counted() {
    let r = rig();
    r.sim.post_raw_event(0x0042_0001);
    r.sim.post_raw_event(Event::new(EventKind::Unknown(3), 0).to_word());
    assert_eq!(r.nic.handle_interrupt(), 2);
    assert_eq!(r.nic.stats().unknown_events, 2);
    assert_eq!(r.nic.handle_interrupt(), 0);
}

#[test]
fn rx_empty_refills_the_ring() {
    let (dma, sim, stack) = parts();
    let nic = init(&dma, &sim, &stack).unwrap();
    dma.limit_allocations(Some(10));
    nic.open();
    assert_eq!(nic.receive_buffers_posted(), 10);
    assert_eq!(nic.stats().rx_refill_failures, (NUM_SKBS - 10) as u64);
    {
        let state = nic.state.lock();
        assert_eq!(state.rx_ring.buffer_size(), test_config().mtu + SKB_PAD);
        assert!((0..10).all(|index| state.rx_ring.is_posted(index)));
        assert!(!state.rx_ring.is_posted(10));
        assert!(!state.rx_ring.is_posted(NUM_SKBS));
    }

    dma.limit_allocations(None);
    assert!(sim.signal_rx_empty());
    assert_eq!(nic.handle_interrupt(), 1);
    assert_eq!(nic.receive_buffers_posted(), NUM_SKBS);
    for index in 0..NUM_SKBS {
        assert_ne!(sim.skb_entry(index), 0);
    }
}

#[test]
fn interrupt_during_a_drain_is_not_lost() {
    let r = rig();
    // Another context is draining and has already found the queue empty.
    let events = r.nic.events.lock();
    r.sim.deliver(0x5, 0x3, &payload(16)).unwrap();
    assert_eq!(r.nic.handle_interrupt(), 0);
    assert!(r.nic.drain_requested.load(Ordering::SeqCst));
    drop(events);

    // That drainer looks at the queue again before it returns.
    assert_eq!(r.nic.drain_requested_events(), 1);
    assert!(!r.nic.drain_requested.load(Ordering::SeqCst));
    assert_eq!(r.stack.frames.lock().len(), 1);

    // Without a request, events wait for the next interrupt.
    r.sim.deliver(0x5, 0x3, &payload(16)).unwrap();
    assert_eq!(r.nic.drain_requested_events(), 0);
    assert_eq!(r.nic.handle_interrupt(), 1);
    assert_eq!(r.stack.frames.lock().len(), 2);
}

#[test]
fn only_the_seastar_is_supported() {
    assert!(supports_device(0x17DB, 0x0101));
    assert!(!supports_device(0x17DB, 0x0102));
    assert!(!supports_device(0x8086, 0x0101));
}

#[test]
fn irq_routing_masks_the_apic_destination() {
    let r = rig();
    r.nic.update_irq_routing(0xFEE0_1234);
    assert_eq!(r.sim.read_u32(SEASTAR_HTB_BI), 0xFDFE_E000);
}


#[test]
fn concurrent_transmit_and_dispatch() {
    const PER_THREAD: usize = 200;

    let (dma, sim, stack) = parts();
    let nic = Arc::new(init(&dma, &sim, &stack).unwrap());
    nic.open();
    sim.set_auto_complete(true);

    let stop = Arc::new(AtomicBool::new(false));
    let dispatcher = {
        let nic = nic.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                nic.handle_interrupt();
                thread::yield_now();
            }
        })
    };

    let senders: Vec<_> = (0..2).map(|_| {
        let nic = nic.clone();
        let dma = dma.clone();
        thread::spawn(move || {
            for _ in 0..PER_THREAD {
                let mut frame = ip_frame(&dma, &payload(24));
                loop {
                    match nic.transmit(frame).unwrap() {
                        TransmitStatus::Sent => break,
                        TransmitStatus::Busy(f) => {
                            frame = f;
                            thread::yield_now();
                        }
                        TransmitStatus::Dropped => panic!("frame dropped"),
                    }
                }
            }
        })
    }).collect();

    for sender in senders {
        sender.join().unwrap();
    }
    stop.store(true, Ordering::Release);
    dispatcher.join().unwrap();

    for _ in 0..1000 {
        if nic.transmits_in_flight() == 0 {
            break;
        }
        nic.handle_interrupt();
    }
    assert_eq!(nic.transmits_in_flight(), 0);
    assert_eq!(sim.duplicate_pendings(), 0);
    assert_eq!(sim.eq_overflows(), 0);
    assert_eq!(sim.take_transmitted().len(), 2 * PER_THREAD);
    assert_eq!(nic.stats().tx_packets, (2 * PER_THREAD) as u64);
    assert_eq!(dma.live_buffers(), 1 + NUM_SKBS);
}
