//! Layout of the Host <-> SeaStar mailbox, which lives at [`SEASTAR_MAILBOX_BASE`](crate::SEASTAR_MAILBOX_BASE).
//!
//! ```text
//! offset  field
//! 0       commandq[COMMAND_Q_LENGTH]   64-byte command records, written by the host
//! 4032    resultq[RESULT_Q_LENGTH]     u32 results, written by the firmware
//! 4040    resultq_read                 owned by the host
//! 4044    resultq_write                owned by the firmware
//! 4048    commandq_write               owned by the host
//! 4052    commandq_read                owned by the firmware
//! ```

use crate::{SeaStarAddress, SEASTAR_MAILBOX_BASE, COMMAND_Q_LENGTH, COMMAND_SIZE, RESULT_Q_LENGTH};

pub const COMMANDQ_OFFSET:          u32 = 0;
pub const RESULTQ_OFFSET:           u32 = 4032;
pub const RESULTQ_READ_OFFSET:      u32 = 4040;
pub const RESULTQ_WRITE_OFFSET:     u32 = 4044;
pub const COMMANDQ_WRITE_OFFSET:    u32 = 4048;
pub const COMMANDQ_READ_OFFSET:     u32 = 4052;

const_assert_eq!(RESULTQ_READ_OFFSET, RESULTQ_OFFSET + (RESULT_Q_LENGTH as u32) * 4);

/// Address of command slot `index`.
pub fn command_slot(index: usize) -> SeaStarAddress {
    debug_assert!(index < COMMAND_Q_LENGTH);
    SEASTAR_MAILBOX_BASE.offset_by(index, COMMAND_SIZE as u32) + COMMANDQ_OFFSET
}

/// Address of result slot `index`.
pub fn result_slot(index: usize) -> SeaStarAddress {
    debug_assert!(index < RESULT_Q_LENGTH);
    SEASTAR_MAILBOX_BASE.offset_by(index, 4) + RESULTQ_OFFSET
}

pub fn resultq_read() -> SeaStarAddress {
    SEASTAR_MAILBOX_BASE + RESULTQ_READ_OFFSET
}

pub fn resultq_write() -> SeaStarAddress {
    SEASTAR_MAILBOX_BASE + RESULTQ_WRITE_OFFSET
}

pub fn commandq_write() -> SeaStarAddress {
    SEASTAR_MAILBOX_BASE + COMMANDQ_WRITE_OFFSET
}

pub fn commandq_read() -> SeaStarAddress {
    SEASTAR_MAILBOX_BASE + COMMANDQ_READ_OFFSET
}
