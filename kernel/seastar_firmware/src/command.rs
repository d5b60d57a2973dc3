//! Host -> SeaStar command records.
//!
//! Every command is a 64-byte record whose first byte is the opcode.
//! The remaining bytes are opcode-specific and always little-endian;
//! bytes not covered by a field are zero.

use core::fmt;
use byteorder::{ByteOrder, LittleEndian};
use num_enum::TryFromPrimitive;
use crate::COMMAND_SIZE;

/// Command opcode written in byte 0 of every command record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum CommandOpcode {
    Init                = 0,
    MarkAlive           = 1,
    InitEventQueue      = 2,
    TransmitDatagram    = 13,
}

/// Offset of the opcode byte, common to all commands.
pub const OP_OFFSET: usize = 0;

/// Field offsets of the `Init` command.
pub mod init {
    pub const PROCESS_INDEX:            usize = 1;
    pub const PID:                      usize = 4;
    pub const JID:                      usize = 6;
    pub const NUM_PENDINGS:             usize = 8;
    pub const NUM_MEMDS:                usize = 10;
    pub const NUM_EQCBS:                usize = 12;
    pub const PENDING_TX_LIMIT:         usize = 14;
    pub const PENDING_TABLE_ADDR:       usize = 16;
    pub const UP_PENDING_TABLE_ADDR:    usize = 20;
    pub const UP_PENDING_TABLE_HT_ADDR: usize = 24;
    pub const MEMD_TABLE_ADDR:          usize = 28;
    pub const EQCB_TABLE_ADDR:          usize = 32;
    pub const SHDR_TABLE_HT_ADDR:       usize = 36;
    pub const RESULT_BLOCK_ADDR:        usize = 40;
    pub const EQHEAP_ADDR:              usize = 44;
    pub const EQHEAP_LENGTH:            usize = 48;
    pub const SMB_TABLE_ADDR:           usize = 52;
    pub const UID:                      usize = 56;
}

/// Field offsets of the `MarkAlive` command.
pub mod mark_alive {
    pub const INDEX:        usize = 1;
}

/// Field offsets of the `InitEventQueue` command.
pub mod init_eqcb {
    pub const EQCB_INDEX:   usize = 2;
    pub const BASE:         usize = 4;
    pub const COUNT:        usize = 8;
}

/// Field offsets of the `TransmitDatagram` command.
pub mod ip_tx {
    pub const NID:              usize = 2;
    pub const LENGTH:           usize = 4;
    pub const ADDRESS:          usize = 8;
    pub const PENDING_INDEX:    usize = 16;
}

const_assert!(init::UID + 4 <= crate::COMMAND_SIZE);
const_assert!(ip_tx::PENDING_INDEX + 2 <= crate::COMMAND_SIZE);


/// Arguments of the firmware initialization command.
///
/// Addresses ending in `_addr` are either SeaStar-local addresses (tables in adapter memory)
/// or firmware-visible host addresses produced by the host memory map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitCommand {
    pub process_index:              u8,
    pub pid:                        u16,
    pub jid:                        u16,
    pub num_pendings:               u16,
    pub num_memds:                  u16,
    pub num_eqcbs:                  u16,
    pub pending_tx_limit:           u16,
    pub pending_table_addr:         u32,
    pub up_pending_table_addr:      u32,
    pub up_pending_table_ht_addr:   u32,
    pub memd_table_addr:            u32,
    pub eqcb_table_addr:            u32,
    pub shdr_table_ht_addr:         u32,
    pub result_block_addr:          u32,
    pub eqheap_addr:                u32,
    pub eqheap_length:              u32,
    pub smb_table_addr:             u32,
    pub uid:                        u32,
}

/// A command sent from the host to the SeaStar firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Declares the pending table geometry, event queue heap and process identity.
    Init(InitCommand),
    /// Tells the firmware that the host is ready to receive events.
    MarkAlive {
        index: u8,
    },
    /// Registers the base address and number of entries of one event queue.
    InitEventQueue {
        eqcb_index: u16,
        base:       u32,
        count:      u32,
    },
    /// Sends one datagram to node `nid`.
    TransmitDatagram {
        nid:            u16,
        /// Length of the datagram in quad-bytes, minus one.
        length:         u16,
        /// Physical address of the datagram in quad-bytes (the byte address shifted right by 2).
        address:        u64,
        /// Index of the pending slot echoed back in the completion event.
        pending_index:  u16,
    },
}

/// Reasons a 64-byte record cannot be decoded into a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandDecodeError {
    /// The record is not exactly [`COMMAND_SIZE`] bytes long.
    InvalidLength,
    /// Byte 0 holds an opcode the host driver does not know.
    UnknownOpcode(u8),
}

impl From<CommandDecodeError> for &'static str {
    fn from(error: CommandDecodeError) -> Self {
        match error {
            CommandDecodeError::InvalidLength => "command record is not 64 bytes long",
            CommandDecodeError::UnknownOpcode(_) => "unknown command opcode",
        }
    }
}

impl fmt::Display for CommandDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CommandDecodeError::UnknownOpcode(op) => write!(f, "unknown command opcode {}", op),
            other => {
                let msg: &'static str = (*other).into();
                f.write_str(msg)
            }
        }
    }
}

impl Command {
    pub fn opcode(&self) -> CommandOpcode {
        match self {
            Command::Init(_) => CommandOpcode::Init,
            Command::MarkAlive { .. } => CommandOpcode::MarkAlive,
            Command::InitEventQueue { .. } => CommandOpcode::InitEventQueue,
            Command::TransmitDatagram { .. } => CommandOpcode::TransmitDatagram,
        }
    }

    /// Lays out this command as the 64-byte record expected by the firmware.
    pub fn encode(&self) -> [u8; COMMAND_SIZE] {
        let mut rec = [0u8; COMMAND_SIZE];
        rec[OP_OFFSET] = self.opcode() as u8;

        match *self {
            Command::Init(ref c) => {
                rec[init::PROCESS_INDEX] = c.process_index;
                LittleEndian::write_u16(&mut rec[init::PID..],                      c.pid);
                LittleEndian::write_u16(&mut rec[init::JID..],                      c.jid);
                LittleEndian::write_u16(&mut rec[init::NUM_PENDINGS..],             c.num_pendings);
                LittleEndian::write_u16(&mut rec[init::NUM_MEMDS..],                c.num_memds);
                LittleEndian::write_u16(&mut rec[init::NUM_EQCBS..],                c.num_eqcbs);
                LittleEndian::write_u16(&mut rec[init::PENDING_TX_LIMIT..],         c.pending_tx_limit);
                LittleEndian::write_u32(&mut rec[init::PENDING_TABLE_ADDR..],       c.pending_table_addr);
                LittleEndian::write_u32(&mut rec[init::UP_PENDING_TABLE_ADDR..],    c.up_pending_table_addr);
                LittleEndian::write_u32(&mut rec[init::UP_PENDING_TABLE_HT_ADDR..], c.up_pending_table_ht_addr);
                LittleEndian::write_u32(&mut rec[init::MEMD_TABLE_ADDR..],          c.memd_table_addr);
                LittleEndian::write_u32(&mut rec[init::EQCB_TABLE_ADDR..],          c.eqcb_table_addr);
                LittleEndian::write_u32(&mut rec[init::SHDR_TABLE_HT_ADDR..],       c.shdr_table_ht_addr);
                LittleEndian::write_u32(&mut rec[init::RESULT_BLOCK_ADDR..],        c.result_block_addr);
                LittleEndian::write_u32(&mut rec[init::EQHEAP_ADDR..],              c.eqheap_addr);
                LittleEndian::write_u32(&mut rec[init::EQHEAP_LENGTH..],            c.eqheap_length);
                LittleEndian::write_u32(&mut rec[init::SMB_TABLE_ADDR..],           c.smb_table_addr);
                LittleEndian::write_u32(&mut rec[init::UID..],                      c.uid);
            }
            Command::MarkAlive { index } => {
                rec[mark_alive::INDEX] = index;
            }
            Command::InitEventQueue { eqcb_index, base, count } => {
                LittleEndian::write_u16(&mut rec[init_eqcb::EQCB_INDEX..], eqcb_index);
                LittleEndian::write_u32(&mut rec[init_eqcb::BASE..], base);
                LittleEndian::write_u32(&mut rec[init_eqcb::COUNT..], count);
            }
            Command::TransmitDatagram { nid, length, address, pending_index } => {
                LittleEndian::write_u16(&mut rec[ip_tx::NID..], nid);
                LittleEndian::write_u16(&mut rec[ip_tx::LENGTH..], length);
                LittleEndian::write_u64(&mut rec[ip_tx::ADDRESS..], address);
                LittleEndian::write_u16(&mut rec[ip_tx::PENDING_INDEX..], pending_index);
            }
        }
        rec
    }

    /// Parses a 64-byte command record, the inverse of [`Command::encode`].
    pub fn decode(rec: &[u8]) -> Result<Command, CommandDecodeError> {
        if rec.len() != COMMAND_SIZE {
            return Err(CommandDecodeError::InvalidLength);
        }
        let op = CommandOpcode::try_from(rec[OP_OFFSET])
            .map_err(|_| CommandDecodeError::UnknownOpcode(rec[OP_OFFSET]))?;

        let cmd = match op {
            CommandOpcode::Init => Command::Init(InitCommand {
                process_index:              rec[init::PROCESS_INDEX],
                pid:                        LittleEndian::read_u16(&rec[init::PID..]),
                jid:                        LittleEndian::read_u16(&rec[init::JID..]),
                num_pendings:               LittleEndian::read_u16(&rec[init::NUM_PENDINGS..]),
                num_memds:                  LittleEndian::read_u16(&rec[init::NUM_MEMDS..]),
                num_eqcbs:                  LittleEndian::read_u16(&rec[init::NUM_EQCBS..]),
                pending_tx_limit:           LittleEndian::read_u16(&rec[init::PENDING_TX_LIMIT..]),
                pending_table_addr:         LittleEndian::read_u32(&rec[init::PENDING_TABLE_ADDR..]),
                up_pending_table_addr:      LittleEndian::read_u32(&rec[init::UP_PENDING_TABLE_ADDR..]),
                up_pending_table_ht_addr:   LittleEndian::read_u32(&rec[init::UP_PENDING_TABLE_HT_ADDR..]),
                memd_table_addr:            LittleEndian::read_u32(&rec[init::MEMD_TABLE_ADDR..]),
                eqcb_table_addr:            LittleEndian::read_u32(&rec[init::EQCB_TABLE_ADDR..]),
                shdr_table_ht_addr:         LittleEndian::read_u32(&rec[init::SHDR_TABLE_HT_ADDR..]),
                result_block_addr:          LittleEndian::read_u32(&rec[init::RESULT_BLOCK_ADDR..]),
                eqheap_addr:                LittleEndian::read_u32(&rec[init::EQHEAP_ADDR..]),
                eqheap_length:              LittleEndian::read_u32(&rec[init::EQHEAP_LENGTH..]),
                smb_table_addr:             LittleEndian::read_u32(&rec[init::SMB_TABLE_ADDR..]),
                uid:                        LittleEndian::read_u32(&rec[init::UID..]),
            }),
            CommandOpcode::MarkAlive => Command::MarkAlive {
                index: rec[mark_alive::INDEX],
            },
            CommandOpcode::InitEventQueue => Command::InitEventQueue {
                eqcb_index: LittleEndian::read_u16(&rec[init_eqcb::EQCB_INDEX..]),
                base:       LittleEndian::read_u32(&rec[init_eqcb::BASE..]),
                count:      LittleEndian::read_u32(&rec[init_eqcb::COUNT..]),
            },
            CommandOpcode::TransmitDatagram => Command::TransmitDatagram {
                nid:            LittleEndian::read_u16(&rec[ip_tx::NID..]),
                length:         LittleEndian::read_u16(&rec[ip_tx::LENGTH..]),
                address:        LittleEndian::read_u64(&rec[ip_tx::ADDRESS..]),
                pending_index:  LittleEndian::read_u16(&rec[ip_tx::PENDING_INDEX..]),
            },
        };
        Ok(cmd)
    }
}
