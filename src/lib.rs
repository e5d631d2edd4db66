//! Device Router Library
//!
//! Real-time audio and MIDI passthrough between a chosen pair of devices.

pub mod backend;
pub mod config;
pub mod device;
pub mod engine;
