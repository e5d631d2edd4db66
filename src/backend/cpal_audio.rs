//! cpal audio backend
//!
//! Presents cpal's pull-style streams as a buffer-queue device. The capture
//! stream fills registered buffers in submission order and hands each one
//! to the completion handler when full. Playback writes are converted to
//! samples and pushed into an rtrb ring buffer drained by the output stream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, BuildStreamError, Device, Host, SampleRate, Stream, StreamConfig};
use rtrb::{Consumer, Producer, RingBuffer};

use super::audio::{
    AudioBackend, AudioFormat, CaptureDevice, CaptureHandler, CaptureQueue, Completion,
    PlaybackDevice, PlaybackWriter,
};
use super::DeviceError;
use crate::device::{DeviceDescriptor, Direction, UNKNOWN_DEVICE_NAME};
use crate::engine::buffer_pool::{AudioBuffer, BUFFER_SIZE};

/// Default number of buffers the playback ring can hold.
pub const DEFAULT_PLAYBACK_QUEUE_BUFFERS: usize = 8;

/// Upper bound on the playback ring, in buffers.
pub const MAX_PLAYBACK_QUEUE_BUFFERS: usize = 256;

/// Samples the playback ring holds for a requested number of buffers.
fn ring_capacity(queue_buffers: usize) -> usize {
    queue_buffers.clamp(1, MAX_PLAYBACK_QUEUE_BUFFERS) * (BUFFER_SIZE / 2)
}

/// Registered buffers, indexed by pool position.
type Regions = Mutex<Vec<Option<Arc<AudioBuffer>>>>;

fn register_region(regions: &Regions, buffer: &Arc<AudioBuffer>) -> Result<(), DeviceError> {
    let mut regions = regions
        .lock()
        .map_err(|_| DeviceError::Backend("region table poisoned".to_string()))?;
    let index = buffer.index();
    if regions.len() <= index {
        regions.resize(index + 1, None);
    }
    regions[index] = Some(Arc::clone(buffer));
    Ok(())
}

fn lookup_region(regions: &Regions, index: usize) -> Option<Arc<AudioBuffer>> {
    regions.lock().ok()?.get(index).cloned().flatten()
}

fn unregister_region(regions: &Regions, index: usize) {
    if let Ok(mut regions) = regions.lock() {
        if let Some(slot) = regions.get_mut(index) {
            *slot = None;
        }
    }
}

/// Streams run at the session format exactly, with i16 samples. There is no
/// conversion, so hosts whose shared mode only offers f32 or another rate
/// (WASAPI at 48 kHz, for one) refuse the stream.
fn stream_config(format: AudioFormat) -> Result<StreamConfig, DeviceError> {
    if format.bits_per_sample != 16 {
        return Err(DeviceError::UnsupportedFormat(format!(
            "{}-bit samples",
            format.bits_per_sample
        )));
    }
    Ok(StreamConfig {
        channels: format.channels,
        sample_rate: SampleRate(format.sample_rate),
        buffer_size: BufferSize::Default,
    })
}

fn map_build_error(err: BuildStreamError) -> DeviceError {
    match err {
        BuildStreamError::StreamConfigNotSupported => {
            log::info!(
                "Audio: device refused stereo i16 at 44100 Hz; its shared mode may only offer f32 or another rate"
            );
            DeviceError::UnsupportedFormat("stereo 16-bit 44100 Hz".to_string())
        }
        BuildStreamError::DeviceNotAvailable => DeviceError::NotFound(err.to_string()),
        other => DeviceError::Backend(other.to_string()),
    }
}

/// Audio backend on the default cpal host.
pub struct CpalAudioBackend {
    host: Host,
    playback_queue_buffers: usize,
}

impl CpalAudioBackend {
    /// Create a backend whose playback ring holds `playback_queue_buffers`
    /// full buffers.
    pub fn new(playback_queue_buffers: usize) -> Self {
        Self {
            host: cpal::default_host(),
            playback_queue_buffers: playback_queue_buffers.clamp(1, MAX_PLAYBACK_QUEUE_BUFFERS),
        }
    }

    /// Re-resolve a descriptor against the current device list.
    fn resolve(&self, device: &DeviceDescriptor) -> Result<Device, DeviceError> {
        let index = device
            .port_index()
            .ok_or_else(|| DeviceError::NotFound(device.display_name.clone()))?;

        let devices: Vec<Device> = match device.direction {
            Direction::Input => self.host.input_devices().map(|d| d.collect::<Vec<_>>()),
            Direction::Output => self.host.output_devices().map(|d| d.collect::<Vec<_>>()),
        }
        .map_err(|e| DeviceError::Backend(e.to_string()))?;

        let found = devices
            .into_iter()
            .nth(index)
            .ok_or_else(|| DeviceError::NotFound(device.display_name.clone()))?;

        let name = found
            .name()
            .unwrap_or_else(|_| UNKNOWN_DEVICE_NAME.to_string());
        if name != device.display_name {
            return Err(DeviceError::Stale {
                expected: device.display_name.clone(),
                found: name,
            });
        }

        Ok(found)
    }
}

impl Default for CpalAudioBackend {
    fn default() -> Self {
        Self::new(DEFAULT_PLAYBACK_QUEUE_BUFFERS)
    }
}

impl AudioBackend for CpalAudioBackend {
    type Capture = CpalCapture;
    type Playback = CpalPlayback;

    fn open_capture(
        &mut self,
        device: &DeviceDescriptor,
        format: AudioFormat,
        handler: CaptureHandler,
    ) -> Result<CpalCapture, DeviceError> {
        let config = stream_config(format)?;
        let device = self.resolve(device)?;

        let shared = Arc::new(CaptureShared {
            regions: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
            flush: AtomicBool::new(false),
        });

        let stream_shared = Arc::clone(&shared);
        // Buffer being filled and how many bytes it holds so far
        let mut current: Option<(Arc<AudioBuffer>, usize)> = None;
        let mut scratch = vec![0u8; BUFFER_SIZE];

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    if stream_shared.flush.swap(false, Ordering::AcqRel) {
                        current = None;
                    }
                    if !stream_shared.running.load(Ordering::Acquire) {
                        return;
                    }

                    let mut samples = data;
                    while !samples.is_empty() {
                        let (buffer, written) = match current.take() {
                            Some(filling) => filling,
                            None => match stream_shared.next_pending() {
                                Some(buffer) => (buffer, 0),
                                // Nothing queued: this data has nowhere to go
                                None => return,
                            },
                        };

                        let count = ((BUFFER_SIZE - written) / 2).min(samples.len());
                        for (i, sample) in samples[..count].iter().enumerate() {
                            scratch[i * 2..i * 2 + 2].copy_from_slice(&sample.to_le_bytes());
                        }
                        let written = written + buffer.write_capture(written, &scratch[..count * 2]);
                        samples = &samples[count..];

                        if written >= BUFFER_SIZE {
                            let queue: &dyn CaptureQueue = &*stream_shared;
                            handler(
                                queue,
                                Completion {
                                    buffer: buffer.index(),
                                    bytes_recorded: written,
                                },
                            );
                        } else {
                            current = Some((buffer, written));
                        }
                    }
                },
                |err| {
                    log::error!("Audio: capture stream error: {}", err);
                },
                None,
            )
            .map_err(map_build_error)?;

        // Some hosts start streams as soon as they are built
        if let Err(e) = stream.pause() {
            log::debug!("Audio: could not pause new capture stream: {}", e);
        }

        Ok(CpalCapture {
            stream: Some(stream),
            shared,
        })
    }

    fn open_playback(
        &mut self,
        device: &DeviceDescriptor,
        format: AudioFormat,
    ) -> Result<CpalPlayback, DeviceError> {
        let config = stream_config(format)?;
        let device = self.resolve(device)?;

        let capacity = ring_capacity(self.playback_queue_buffers);
        let (producer, mut consumer): (Producer<i16>, Consumer<i16>) = RingBuffer::new(capacity);

        let shared = Arc::new(PlaybackShared {
            regions: Mutex::new(Vec::new()),
            producer: Mutex::new(producer),
            flush: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let stream_shared = Arc::clone(&shared);
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    // REAL-TIME SAFE: no allocations, no locks
                    if stream_shared.flush.swap(false, Ordering::AcqRel) {
                        while consumer.pop().is_ok() {}
                    }
                    for sample in data.iter_mut() {
                        *sample = consumer.pop().unwrap_or(0);
                    }
                },
                |err| {
                    log::error!("Audio: playback stream error: {}", err);
                },
                None,
            )
            .map_err(map_build_error)?;

        stream
            .play()
            .map_err(|e| DeviceError::Backend(e.to_string()))?;

        Ok(CpalPlayback {
            stream: Some(stream),
            shared,
        })
    }
}

/// State shared between the capture handle and its stream callback.
struct CaptureShared {
    regions: Regions,
    pending: Mutex<VecDeque<usize>>,
    running: AtomicBool,
    flush: AtomicBool,
}

impl CaptureShared {
    fn next_pending(&self) -> Option<Arc<AudioBuffer>> {
        loop {
            let index = self.pending.lock().ok()?.pop_front()?;
            // Skip anything unregistered while it sat in the queue
            if let Some(buffer) = lookup_region(&self.regions, index) {
                return Some(buffer);
            }
        }
    }
}

impl CaptureQueue for CaptureShared {
    fn submit(&self, buffer: usize) -> Result<(), DeviceError> {
        if lookup_region(&self.regions, buffer).is_none() {
            return Err(DeviceError::NotRegistered(buffer));
        }
        self.pending
            .lock()
            .map_err(|_| DeviceError::Backend("pending queue poisoned".to_string()))?
            .push_back(buffer);
        Ok(())
    }
}

/// An open cpal input stream.
pub struct CpalCapture {
    stream: Option<Stream>,
    shared: Arc<CaptureShared>,
}

impl CpalCapture {
    fn stream(&self) -> Result<&Stream, DeviceError> {
        self.stream.as_ref().ok_or(DeviceError::Closed)
    }
}

impl CaptureDevice for CpalCapture {
    fn register(&mut self, buffer: &Arc<AudioBuffer>) -> Result<(), DeviceError> {
        self.stream()?;
        register_region(&self.shared.regions, buffer)
    }

    fn submit(&mut self, buffer: usize) -> Result<(), DeviceError> {
        self.stream()?;
        self.shared.submit(buffer)
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        let stream = self.stream()?;
        self.shared.running.store(true, Ordering::Release);
        stream.play().map_err(|e| {
            self.shared.running.store(false, Ordering::Release);
            DeviceError::Backend(e.to_string())
        })
    }

    fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(stream) = &self.stream {
            if let Err(e) = stream.pause() {
                log::debug!("Audio: capture pause failed: {}", e);
            }
        }
    }

    fn reset(&mut self) {
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.clear();
        }
        self.shared.flush.store(true, Ordering::Release);
    }

    fn unregister(&mut self, buffer: usize) {
        unregister_region(&self.shared.regions, buffer);
    }

    fn close(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        // Dropping the stream drops the completion handler with it
        self.stream = None;
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.clear();
        }
        if let Ok(mut regions) = self.shared.regions.lock() {
            regions.clear();
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.close();
    }
}

/// State shared between the playback handle, its writer, and its stream.
struct PlaybackShared {
    regions: Regions,
    producer: Mutex<Producer<i16>>,
    flush: AtomicBool,
    closed: AtomicBool,
}

impl PlaybackWriter for PlaybackShared {
    fn write(&self, buffer: usize, len: usize) -> Result<(), DeviceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DeviceError::Closed);
        }
        let region =
            lookup_region(&self.regions, buffer).ok_or(DeviceError::NotRegistered(buffer))?;

        let mut producer = self
            .producer
            .lock()
            .map_err(|_| DeviceError::Backend("playback queue poisoned".to_string()))?;

        let len = len.min(BUFFER_SIZE);
        if producer.slots() < len / 2 {
            return Err(DeviceError::QueueFull);
        }

        region
            .with_playback(len, |bytes| {
                for pair in bytes.chunks_exact(2) {
                    let _ = producer.push(i16::from_le_bytes([pair[0], pair[1]]));
                }
            })
            .ok_or_else(|| DeviceError::Backend("playback region poisoned".to_string()))
    }
}

/// An open cpal output stream.
pub struct CpalPlayback {
    stream: Option<Stream>,
    shared: Arc<PlaybackShared>,
}

impl PlaybackDevice for CpalPlayback {
    fn register(&mut self, buffer: &Arc<AudioBuffer>) -> Result<(), DeviceError> {
        if self.stream.is_none() {
            return Err(DeviceError::Closed);
        }
        register_region(&self.shared.regions, buffer)
    }

    fn writer(&self) -> Arc<dyn PlaybackWriter> {
        Arc::clone(&self.shared) as Arc<dyn PlaybackWriter>
    }

    fn reset(&mut self) {
        self.shared.flush.store(true, Ordering::Release);
    }

    fn unregister(&mut self, buffer: usize) {
        unregister_region(&self.shared.regions, buffer);
    }

    fn close(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.stream = None;
        if let Ok(mut regions) = self.shared.regions.lock() {
            regions.clear();
        }
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.close();
    }
}
