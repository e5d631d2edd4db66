//! MIDI backend traits and the short message type.

use std::fmt;
use std::sync::Arc;

use super::DeviceError;
use crate::device::DeviceDescriptor;

/// Broad category of a short message, derived from its status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    NoteOff,
    NoteOn,
    PolyPressure,
    ControlChange,
    ProgramChange,
    ChannelPressure,
    PitchBend,
    /// System common and real-time messages (0xF1..=0xFF, minus SysEx).
    System,
}

/// A MIDI short message: status plus up to two data bytes, packed as
/// `status | data1 << 8 | data2 << 16`, with its delivery timestamp.
///
/// System-exclusive messages have no short form and are never represented.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ShortMessage {
    packed: u32,
    timestamp_us: u64,
}

impl ShortMessage {
    /// Builds a message from its three bytes.
    pub fn new(status: u8, data1: u8, data2: u8, timestamp_us: u64) -> Self {
        Self {
            packed: status as u32 | (data1 as u32) << 8 | (data2 as u32) << 16,
            timestamp_us,
        }
    }

    /// Wraps an already packed message.
    pub fn from_packed(packed: u32, timestamp_us: u64) -> Self {
        Self {
            packed: packed & 0x00FF_FFFF,
            timestamp_us,
        }
    }

    /// Parses raw bytes as delivered by the OS.
    ///
    /// Returns None for empty input, running status, SysEx, undefined status
    /// bytes, or a length that does not match the status byte.
    pub fn from_bytes(data: &[u8], timestamp_us: u64) -> Option<Self> {
        let &status = data.first()?;
        let len = Self::length_for_status(status)?;
        if data.len() != len {
            return None;
        }
        let data1 = data.get(1).copied().unwrap_or(0);
        let data2 = data.get(2).copied().unwrap_or(0);
        Some(Self::new(status, data1, data2, timestamp_us))
    }

    /// Wire length of a message with this status byte.
    pub fn length_for_status(status: u8) -> Option<usize> {
        match status {
            0x80..=0xBF | 0xE0..=0xEF => Some(3),
            0xC0..=0xDF => Some(2),
            0xF1 | 0xF3 => Some(2),
            0xF2 => Some(3),
            0xF6 | 0xF8..=0xFF => Some(1),
            // Data bytes (running status), SysEx framing, undefined 0xF4/0xF5
            _ => None,
        }
    }

    /// Packed representation.
    pub fn packed(&self) -> u32 {
        self.packed
    }

    pub fn status(&self) -> u8 {
        (self.packed & 0xFF) as u8
    }

    pub fn data1(&self) -> u8 {
        ((self.packed >> 8) & 0xFF) as u8
    }

    pub fn data2(&self) -> u8 {
        ((self.packed >> 16) & 0xFF) as u8
    }

    /// Delivery timestamp in microseconds, as reported by the input device.
    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    /// Number of meaningful bytes on the wire.
    pub fn len(&self) -> usize {
        Self::length_for_status(self.status()).unwrap_or(3)
    }

    /// Short messages always carry at least a status byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// All three bytes; only the first [`len`](Self::len) are meaningful.
    pub fn as_array(&self) -> [u8; 3] {
        [self.status(), self.data1(), self.data2()]
    }

    /// Category of the message.
    pub fn kind(&self) -> MessageKind {
        match self.status() & 0xF0 {
            0x80 => MessageKind::NoteOff,
            0x90 => MessageKind::NoteOn,
            0xA0 => MessageKind::PolyPressure,
            0xB0 => MessageKind::ControlChange,
            0xC0 => MessageKind::ProgramChange,
            0xD0 => MessageKind::ChannelPressure,
            0xE0 => MessageKind::PitchBend,
            _ => MessageKind::System,
        }
    }

    /// MIDI channel (0-15) for channel messages.
    pub fn channel(&self) -> Option<u8> {
        match self.kind() {
            MessageKind::System => None,
            _ => Some(self.status() & 0x0F),
        }
    }
}

impl fmt::Debug for ShortMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}[{:02X} {:02X} {:02X}]@{}us",
            self.kind(),
            self.status(),
            self.data1(),
            self.data2(),
            self.timestamp_us
        )
    }
}

/// Handler invoked by the input device on its own thread per message.
pub type MidiHandler = Arc<dyn Fn(ShortMessage) + Send + Sync>;

/// An open MIDI input, owned by the control thread.
pub trait MidiInputDevice {
    /// Begins delivering messages to the handler.
    fn start(&mut self) -> Result<(), DeviceError>;
    /// Stops delivering messages.
    fn stop(&mut self);
    /// Releases the port. Idempotent.
    fn close(&mut self);
}

/// An open MIDI output, shared with the input handler.
pub trait MidiOutputDevice: Send + Sync {
    /// Sends one short message immediately.
    fn send(&self, message: ShortMessage) -> Result<(), DeviceError>;
    /// Releases the port. Idempotent.
    fn close(&self);
}

/// Opens MIDI ports.
pub trait MidiBackend {
    type Input: MidiInputDevice;
    type Output: MidiOutputDevice + 'static;

    /// Opens an input port, registering `handler` for incoming messages.
    fn open_input(
        &mut self,
        device: &DeviceDescriptor,
        handler: MidiHandler,
    ) -> Result<Self::Input, DeviceError>;

    /// Opens an output port.
    fn open_output(&mut self, device: &DeviceDescriptor) -> Result<Arc<Self::Output>, DeviceError>;
}
