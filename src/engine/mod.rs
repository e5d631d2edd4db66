//! Engine module
//!
//! The routes and the controller that drives them.
//! Handles buffer management, audio passthrough, and MIDI passthrough.

pub mod audio_route;
pub mod buffer_pool;
pub mod controller;
pub mod error;
pub mod midi_route;

pub use audio_route::{AudioRoute, DrainSettings, RouteState, RouteStats};
pub use buffer_pool::{AudioBuffer, BufferPool, BufferState, BUFFER_SIZE, NUM_BUFFERS};
pub use controller::ConnectionController;
pub use error::{DeviceRole, RouteError};
pub use midi_route::{MidiRoute, MidiStats};
