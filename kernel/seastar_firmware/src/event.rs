//! SeaStar -> Host events.
//!
//! The firmware reports progress by writing 32-bit words into the host's event queue:
//! the upper 16 bits are the event type and the lower 16 bits an index whose meaning depends on the type.
//! A zero word means the slot holds no event, so no event may encode to zero.

use bit_field::BitField;
use num_enum::TryFromPrimitive;

/// Event type code: a datagram transmit finished, index is the pending slot.
pub const EVENT_TX_END:     u16 = 125;
/// Event type code: a datagram arrived, index is the incoming buffer table entry.
pub const EVENT_RX:         u16 = 126;
/// Event type code: the firmware found no free incoming buffer.
pub const EVENT_RX_EMPTY:   u16 = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
enum KnownKind {
    TransmitComplete    = EVENT_TX_END,
    ReceiveReady        = EVENT_RX,
    ReceiveEmpty        = EVENT_RX_EMPTY,
}

/// The type of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    TransmitComplete,
    ReceiveReady,
    ReceiveEmpty,
    /// A type code the driver does not understand.
    Unknown(u16),
}

impl EventKind {
    pub fn from_code(code: u16) -> EventKind {
        match KnownKind::try_from(code) {
            Ok(KnownKind::TransmitComplete) => EventKind::TransmitComplete,
            Ok(KnownKind::ReceiveReady) => EventKind::ReceiveReady,
            Ok(KnownKind::ReceiveEmpty) => EventKind::ReceiveEmpty,
            Err(_) => EventKind::Unknown(code),
        }
    }

    pub fn code(&self) -> u16 {
        match *self {
            EventKind::TransmitComplete => EVENT_TX_END,
            EventKind::ReceiveReady => EVENT_RX,
            EventKind::ReceiveEmpty => EVENT_RX_EMPTY,
            EventKind::Unknown(code) => code,
        }
    }
}

/// A decoded event queue word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub kind:   EventKind,
    pub index:  u16,
}

impl Event {
    pub fn new(kind: EventKind, index: u16) -> Event {
        Event { kind, index }
    }

    /// Decodes an event queue word, returning `None` for the empty word 0.
    pub fn from_word(word: u32) -> Option<Event> {
        if word == 0 {
            return None;
        }
        Some(Event {
            kind: EventKind::from_code(word.get_bits(16..32) as u16),
            index: word.get_bits(0..16) as u16,
        })
    }

    /// Encodes this event the way the firmware writes it into the event queue.
    pub fn to_word(&self) -> u32 {
        let mut word = 0u32;
        word.set_bits(16..32, self.kind.code() as u32);
        word.set_bits(0..16, self.index as u32);
        word
    }
}
