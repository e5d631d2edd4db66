//! Backend module
//!
//! The platform seam between the routes and the operating system.
//! Routes talk only to the traits defined here; cpal and midir provide the
//! real implementations and `mock` provides an in-process one for tests.

pub mod audio;
pub mod cpal_audio;
pub mod midi;
pub mod midir_midi;
pub mod mock;

pub use audio::{
    AudioBackend, AudioFormat, CaptureDevice, CaptureHandler, CaptureQueue, Completion,
    PlaybackDevice, PlaybackWriter,
};
pub use cpal_audio::CpalAudioBackend;
pub use midi::{MessageKind, MidiBackend, MidiHandler, MidiInputDevice, MidiOutputDevice, ShortMessage};
pub use midir_midi::MidirBackend;

/// Errors reported by a device backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// The sentinel or an index past the end of the port list.
    #[error("Device not found: {0}")]
    NotFound(String),

    /// The port at this index no longer has the enumerated name.
    #[error("Device changed since enumeration: expected '{expected}', found '{found}'")]
    Stale { expected: String, found: String },

    /// The device rejected the fixed session format.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The buffer index was never registered with this device.
    #[error("Buffer {0} is not registered with the device")]
    NotRegistered(usize),

    /// The device's pending queue has no room for the submission.
    #[error("Device queue is full")]
    QueueFull,

    /// The handle has already been closed.
    #[error("Device is closed")]
    Closed,

    /// Any other failure reported by the OS layer.
    #[error("Backend error: {0}")]
    Backend(String),
}
