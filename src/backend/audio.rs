//! Audio backend traits
//!
//! Models a buffer-queue audio API: buffers are registered with a device,
//! submitted to its pending queue, and handed back through a completion
//! callback once the device has filled them.

use std::sync::Arc;

use super::DeviceError;
use crate::device::DeviceDescriptor;
use crate::engine::buffer_pool::AudioBuffer;

/// The session format. Fixed; never negotiated with the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Interleaved channel count.
    pub channels: u16,
    /// Bits per sample (linear PCM).
    pub bits_per_sample: u16,
    /// Frames per second.
    pub sample_rate: u32,
}

impl AudioFormat {
    /// Stereo, 16-bit linear PCM, 44.1 kHz.
    pub const SESSION: AudioFormat = AudioFormat {
        channels: 2,
        bits_per_sample: 16,
        sample_rate: 44100,
    };

    /// Bytes per interleaved frame.
    pub fn block_align(&self) -> usize {
        (self.channels as usize * self.bits_per_sample as usize) / 8
    }

    /// Bytes per second of audio.
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.block_align()
    }
}

/// A filled capture buffer handed back by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Index of the buffer in the route's pool.
    pub buffer: usize,
    /// Number of bytes the device wrote into the capture region.
    pub bytes_recorded: usize,
}

/// Resubmission access given to the completion handler.
pub trait CaptureQueue: Send + Sync {
    /// Appends a registered buffer to the device's pending queue.
    fn submit(&self, buffer: usize) -> Result<(), DeviceError>;
}

/// Handler invoked by the capture device on its own thread for each
/// completed buffer.
pub type CaptureHandler = Arc<dyn Fn(&dyn CaptureQueue, Completion) + Send + Sync>;

/// An open capture device, owned by the control thread.
pub trait CaptureDevice {
    /// Makes a buffer's capture region available to the device.
    fn register(&mut self, buffer: &Arc<AudioBuffer>) -> Result<(), DeviceError>;
    /// Appends a registered buffer to the pending queue.
    fn submit(&mut self, buffer: usize) -> Result<(), DeviceError>;
    /// Starts streaming into queued buffers.
    fn start(&mut self) -> Result<(), DeviceError>;
    /// Stops streaming. Completions already scheduled may still arrive.
    fn stop(&mut self);
    /// Discards every pending buffer.
    fn reset(&mut self);
    /// Withdraws a buffer's capture region from the device.
    fn unregister(&mut self, buffer: usize);
    /// Releases the device. Idempotent.
    fn close(&mut self);
}

/// Playback submission access, shared with the completion handler.
pub trait PlaybackWriter: Send + Sync {
    /// Queues the first `len` bytes of a registered buffer's playback region.
    fn write(&self, buffer: usize, len: usize) -> Result<(), DeviceError>;
}

/// An open playback device, owned by the control thread.
pub trait PlaybackDevice {
    /// Makes a buffer's playback region available to the device.
    fn register(&mut self, buffer: &Arc<AudioBuffer>) -> Result<(), DeviceError>;
    /// The writer the completion handler submits through.
    fn writer(&self) -> Arc<dyn PlaybackWriter>;
    /// Drops everything queued for playback.
    fn reset(&mut self);
    /// Withdraws a buffer's playback region from the device.
    fn unregister(&mut self, buffer: usize);
    /// Releases the device. Idempotent.
    fn close(&mut self);
}

/// Opens capture and playback devices.
pub trait AudioBackend {
    type Capture: CaptureDevice;
    type Playback: PlaybackDevice;

    /// Opens a capture device, registering `handler` for completions.
    fn open_capture(
        &mut self,
        device: &DeviceDescriptor,
        format: AudioFormat,
        handler: CaptureHandler,
    ) -> Result<Self::Capture, DeviceError>;

    /// Opens a playback device.
    fn open_playback(
        &mut self,
        device: &DeviceDescriptor,
        format: AudioFormat,
    ) -> Result<Self::Playback, DeviceError>;
}
