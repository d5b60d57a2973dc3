//! Brings up the SeaStar firmware: a three-stage handshake over the mailbox.
//!
//! 1. `Init` declares the pending tables, the event queue heap and the process identity; it must return 0.
//! 2. `InitEventQueue` registers the host event queue; it must return 1.
//! 3. `MarkAlive` tells the firmware the host is ready for events; it must return 0.
//!
//! Any other outcome leaves the device unusable. Nothing is retried.

use core::fmt;
use seastar_firmware::{
    niccb, Command, InitCommand, SeaStarMemory,
    FW_PENDING_SIZE, SEASTAR_HOST_BASE, SEASTAR_TX_SOURCE,
};
use crate::config::{NUM_EQ_ENTRIES, EQ_ENTRY_SIZE, NUM_PENDINGS, NUM_TX_PENDINGS};
use crate::mailbox::{Mailbox, MailboxError};

/// Number of event queues the driver uses.
pub const NUM_EQ: usize = 1;
/// Index of the driver's only event queue.
pub const EQCB_INDEX: u16 = 0;


/// The stages of bring-up, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringupStage {
    Init,
    InitEventQueue,
    MarkAlive,
}

impl BringupStage {
    /// The result the firmware returns when this stage succeeds.
    pub fn expected_result(&self) -> u32 {
        match self {
            BringupStage::Init => 0,
            BringupStage::InitEventQueue => 1,
            BringupStage::MarkAlive => 0,
        }
    }
}

/// Reasons bring-up may fail. All of them are fatal for the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringupError {
    /// The firmware answered a stage with something other than its expected result.
    UnexpectedResult { stage: BringupStage, result: u32 },
    /// The firmware did not take or answer a stage's command in time.
    Timeout { stage: BringupStage, cause: MailboxError },
}

impl BringupError {
    pub fn stage(&self) -> BringupStage {
        match *self {
            BringupError::UnexpectedResult { stage, .. } => stage,
            BringupError::Timeout { stage, .. } => stage,
        }
    }
}

impl From<BringupError> for &'static str {
    fn from(error: BringupError) -> Self {
        match error {
            BringupError::UnexpectedResult { stage: BringupStage::Init, .. } => "init command failed",
            BringupError::UnexpectedResult { stage: BringupStage::InitEventQueue, .. } => "init_eqcb command failed",
            BringupError::UnexpectedResult { stage: BringupStage::MarkAlive, .. } => "mark_alive command failed",
            BringupError::Timeout { cause, .. } => cause.into(),
        }
    }
}

impl fmt::Display for BringupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BringupError::UnexpectedResult { stage, result } =>
                write!(f, "{:?} stage failed, result={}", stage, result),
            BringupError::Timeout { stage, cause } =>
                write!(f, "{:?} stage failed: {}", stage, cause),
        }
    }
}


/// Everything the firmware needs to know about the host to come up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BringupParams {
    pub process_index: u8,
    pub pid: u16,
    pub jid: u16,
    pub uid: u32,
    /// Firmware address of the host-resident (upper) pending table.
    pub up_pending_table_addr: u32,
    /// Firmware address of the host event queue.
    pub eq_addr: u32,
}

impl BringupParams {
    /// Builds the `Init` command, placing the lower pending table and the event queue
    /// control block at the start of the SeaStar memory reserved for the host.
    pub fn init_command(&self) -> InitCommand {
        let lower_pending = SEASTAR_HOST_BASE.value();
        let lower_eqcb = lower_pending + NUM_PENDINGS as u32 * FW_PENDING_SIZE;

        InitCommand {
            process_index: self.process_index,
            pid: self.pid,
            jid: self.jid,
            uid: self.uid,
            num_pendings: NUM_PENDINGS as u16,
            pending_tx_limit: NUM_TX_PENDINGS as u16,
            pending_table_addr: lower_pending,
            up_pending_table_addr: self.up_pending_table_addr,
            num_eqcbs: NUM_EQ as u16,
            eqcb_table_addr: lower_eqcb,
            eqheap_addr: self.eq_addr,
            eqheap_length: (NUM_EQ_ENTRIES * EQ_ENTRY_SIZE) as u32,
            ..Default::default()
        }
    }
}


/// Reads this node's id from the SeaStar and records it in the NIC control block.
/// Returns the node id.
pub fn setup_local_nid(mem: &dyn SeaStarMemory) -> u16 {
    let nid = mem.read_u16(SEASTAR_TX_SOURCE);
    niccb::set_local_nid(mem, nid);
    info!("seastar::hw_init(): nid {} ({:#x}) version {:#x} built {:#x}",
        nid, nid, niccb::version(mem), niccb::build_time(mem),
    );
    nid
}

/// Runs the three bring-up stages in order, stopping at the first one that fails.
pub fn bring_up(
    mem: &dyn SeaStarMemory,
    mailbox: &mut Mailbox,
    params: &BringupParams,
) -> Result<(), BringupError> {
    let stages = [
        (BringupStage::Init, Command::Init(params.init_command())),
        (BringupStage::InitEventQueue, Command::InitEventQueue {
            eqcb_index: EQCB_INDEX,
            base: params.eq_addr,
            count: NUM_EQ_ENTRIES as u32,
        }),
        (BringupStage::MarkAlive, Command::MarkAlive { index: params.process_index }),
    ];

    for (stage, cmd) in stages.iter() {
        let result = mailbox.call(mem, cmd)
            .map_err(|cause| BringupError::Timeout { stage: *stage, cause })?;
        if result != stage.expected_result() {
            error!("seastar::bring_up(): {:?} command failed, result={}", stage, result);
            return Err(BringupError::UnexpectedResult { stage: *stage, result });
        }
        debug!("seastar::bring_up(): {:?} done", stage);
    }

    info!("seastar::bring_up(): firmware is alive");
    Ok(())
}
