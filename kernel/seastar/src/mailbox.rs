//! The Host -> SeaStar command channel.
//!
//! Commands are copied into a ring of [`COMMAND_Q_LENGTH`] slots in the mailbox.
//! The host owns the ring's write cursor and the firmware owns its read cursor;
//! one slot always stays empty, so at most `COMMAND_Q_LENGTH - 1` commands are outstanding.
//! Commands that produce a result are answered through a ring of [`RESULT_Q_LENGTH`] u32 results.
//!
//! The firmware's progress is observed by polling, bounded by a [`WaitPolicy`].

use core::fmt;
use seastar_firmware::{mailbox, Command, SeaStarMemory, COMMAND_Q_LENGTH, RESULT_Q_LENGTH};


/// Bounds how long the host spins waiting on the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// How many times the firmware-owned cursor is polled before giving up.
    pub max_polls: u32,
}

impl WaitPolicy {
    pub const DEFAULT_MAX_POLLS: u32 = 1 << 24;

    pub const fn new(max_polls: u32) -> WaitPolicy {
        WaitPolicy { max_polls }
    }

    /// Spins until `done` returns true, giving up after `max_polls` attempts.
    /// Returns whether `done` was satisfied.
    pub fn spin_until<F: FnMut() -> bool>(&self, mut done: F) -> bool {
        for _ in 0..self.max_polls {
            if done() {
                return true;
            }
            core::hint::spin_loop();
        }
        done()
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        WaitPolicy::new(WaitPolicy::DEFAULT_MAX_POLLS)
    }
}


/// Possible reasons for failure when submitting a command to the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxError {
    /// The firmware did not free a command slot in time.
    CommandQueueFull,
    /// The firmware did not post a result in time.
    ResultTimeout,
}

impl From<MailboxError> for &'static str {
    fn from(error: MailboxError) -> Self {
        match error {
            MailboxError::CommandQueueFull => "Timed out waiting for a free command queue slot",
            MailboxError::ResultTimeout => "Timed out waiting for a command result",
        }
    }
}

impl fmt::Display for MailboxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg: &'static str = (*self).into();
        f.write_str(msg)
    }
}


/// The host's side of the mailbox: its cached view of both command ring cursors.
///
/// Submitting a command requires `&mut self`, so a caller that shares the mailbox
/// must serialize submissions itself. Only one command waiting for a result
/// can be in flight at a time, because results carry no correlation with their command.
pub struct Mailbox {
    cached_read: usize,
    cached_write: usize,
    wait: WaitPolicy,
}

impl Mailbox {
    /// Creates the host's view of the mailbox from the cursors currently held by the adapter.
    pub fn load(mem: &dyn SeaStarMemory, wait: WaitPolicy) -> Mailbox {
        let read = mem.read_u32(mailbox::commandq_read()) as usize;
        let write = mem.read_u32(mailbox::commandq_write()) as usize;
        if read >= COMMAND_Q_LENGTH || write >= COMMAND_Q_LENGTH {
            warn!("Mailbox::load(): command queue cursors out of range (read {}, write {})", read, write);
        }
        trace!("Mailbox::load(): commandq_read {}, commandq_write {}", read, write);
        Mailbox {
            cached_read: read % COMMAND_Q_LENGTH,
            cached_write: write % COMMAND_Q_LENGTH,
            wait,
        }
    }

    /// Number of commands the host believes the firmware has not consumed yet.
    /// This uses the cached read cursor, so it may overestimate.
    pub fn outstanding(&self) -> usize {
        (self.cached_write + COMMAND_Q_LENGTH - self.cached_read) % COMMAND_Q_LENGTH
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        self.wait
    }

    /// Sends `cmd` to the firmware.
    ///
    /// If `wait_for_result` is true, waits for the firmware's answer and returns it;
    /// otherwise returns `None` as soon as the command is published.
    pub fn submit(
        &mut self,
        mem: &dyn SeaStarMemory,
        cmd: &Command,
        wait_for_result: bool,
    ) -> Result<Option<u32>, MailboxError> {
        if wait_for_result {
            self.call(mem, cmd).map(Some)
        } else {
            self.post(mem, cmd).map(|_| None)
        }
    }

    /// Publishes `cmd` without waiting for a result.
    pub fn post(&mut self, mem: &dyn SeaStarMemory, cmd: &Command) -> Result<(), MailboxError> {
        mem.write_bytes(mailbox::command_slot(self.cached_write), &cmd.encode());

        let next_write = (self.cached_write + 1) % COMMAND_Q_LENGTH;
        if next_write == self.cached_read {
            // Only refresh our copy of the firmware's cursor when the ring looks full.
            let cached_read = &mut self.cached_read;
            let freed = self.wait.spin_until(|| {
                *cached_read = mem.read_u32(mailbox::commandq_read()) as usize;
                next_write != *cached_read
            });
            if !freed {
                error!("Mailbox::post(): firmware stuck at command {}, cannot send {:?}", self.cached_read, cmd.opcode());
                return Err(MailboxError::CommandQueueFull);
            }
        }

        mem.write_u32(mailbox::commandq_write(), next_write as u32);
        self.cached_write = next_write;
        trace!("Mailbox::post(): {:?} published, commandq_write {}", cmd.opcode(), next_write);
        Ok(())
    }

    /// Publishes `cmd` and waits for the firmware's result.
    ///
    /// If this times out, a result posted later will be taken as the answer to the next call.
    pub fn call(&mut self, mem: &dyn SeaStarMemory, cmd: &Command) -> Result<u32, MailboxError> {
        self.post(mem, cmd)?;

        let tail = mem.read_u32(mailbox::resultq_read());
        if !self.wait.spin_until(|| tail != mem.read_u32(mailbox::resultq_write())) {
            error!("Mailbox::call(): no result for {:?}", cmd.opcode());
            return Err(MailboxError::ResultTimeout);
        }

        let tail = tail as usize % RESULT_Q_LENGTH;
        let result = mem.read_u32(mailbox::result_slot(tail));
        let next = if tail >= RESULT_Q_LENGTH - 1 { 0 } else { tail + 1 };
        mem.write_u32(mailbox::resultq_read(), next as u32);
        debug!("Mailbox::call(): {:?} returned {}", cmd.opcode(), result);
        Ok(result)
    }
}
