//! Route errors

use std::fmt;

use crate::backend::DeviceError;

/// Which endpoint of a route an error concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Capture,
    Playback,
    MidiInput,
    MidiOutput,
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRole::Capture => write!(f, "capture"),
            DeviceRole::Playback => write!(f, "playback"),
            DeviceRole::MidiInput => write!(f, "MIDI input"),
            DeviceRole::MidiOutput => write!(f, "MIDI output"),
        }
    }
}

/// Errors raised while connecting or running a route.
///
/// Every variant is local to the route that produced it. Connect failures
/// leave the route fully disconnected; `TransientWrite` never leaves the
/// completion callback and is only logged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// The "No Device" entry was passed to connect.
    #[error("'{0}' is not a connectable device")]
    InvalidDevice(String),

    #[error("Failed to open {role} device: {source}")]
    DeviceOpen {
        role: DeviceRole,
        #[source]
        source: DeviceError,
    },

    /// Registering or queueing a pool buffer failed during connect.
    #[error("Failed to set up buffer {index}: {source}")]
    BufferSetup {
        index: usize,
        #[source]
        source: DeviceError,
    },

    #[error("Failed to start {role} streaming: {source}")]
    StreamStart {
        role: DeviceRole,
        #[source]
        source: DeviceError,
    },

    /// A single playback submission failed; the frame is dropped.
    #[error("Playback of buffer {index} failed, frame dropped: {source}")]
    TransientWrite {
        index: usize,
        #[source]
        source: DeviceError,
    },
}
