//! Mock backends for testing without hardware.
//!
//! The mocks record every call made against them, can be told to fail at a
//! chosen step, and let a test play the role of the OS by delivering capture
//! completions and MIDI input from whatever thread it likes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::audio::{
    AudioBackend, AudioFormat, CaptureDevice, CaptureHandler, CaptureQueue, Completion,
    PlaybackDevice, PlaybackWriter,
};
use super::midi::{MidiBackend, MidiHandler, MidiInputDevice, MidiOutputDevice, ShortMessage};
use super::DeviceError;
use crate::device::{with_sentinel, DeviceCatalog, DeviceDescriptor, DeviceKind, Direction};
use crate::engine::buffer_pool::AudioBuffer;

fn injected(step: &str) -> DeviceError {
    DeviceError::Backend(format!("injected {} failure", step))
}

fn lock<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking test thread must not hide the recorded calls from the others
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn store_region(regions: &mut Vec<Option<Arc<AudioBuffer>>>, buffer: &Arc<AudioBuffer>) {
    let index = buffer.index();
    if regions.len() <= index {
        regions.resize(index + 1, None);
    }
    regions[index] = Some(Arc::clone(buffer));
}

fn lookup(regions: &[Option<Arc<AudioBuffer>>], index: usize) -> Option<Arc<AudioBuffer>> {
    regions.get(index).cloned().flatten()
}

/// A call made against the mock audio backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioCall {
    OpenCapture(String),
    OpenPlayback(String),
    RegisterCapture(usize),
    RegisterPlayback(usize),
    SubmitCapture(usize),
    StartCapture,
    StopCapture,
    ResetCapture,
    ResetPlayback,
    UnregisterCapture(usize),
    UnregisterPlayback(usize),
    CloseCapture,
    ClosePlayback,
    Write { buffer: usize, len: usize },
}

/// Steps the mock audio backend should fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct AudioFaults {
    pub capture_open: bool,
    pub playback_open: bool,
    /// Fail registering this buffer's capture region.
    pub register_capture: Option<usize>,
    /// Fail registering this buffer's playback region.
    pub register_playback: Option<usize>,
    /// Fail submitting this buffer to the capture queue.
    pub submit: Option<usize>,
    pub start: bool,
    /// Fail every playback write.
    pub write: bool,
}

type Hook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct AudioState {
    calls: Vec<AudioCall>,
    faults: AudioFaults,
    handler: Option<CaptureHandler>,
    capture_regions: Vec<Option<Arc<AudioBuffer>>>,
    playback_regions: Vec<Option<Arc<AudioBuffer>>>,
    pending: VecDeque<usize>,
    streaming: bool,
    open_handles: usize,
    written: Vec<Vec<u8>>,
    write_hook: Option<Hook>,
}

impl AudioState {
    fn submit(&mut self, buffer: usize) -> Result<(), DeviceError> {
        if self.faults.submit == Some(buffer) {
            return Err(injected("submit"));
        }
        if lookup(&self.capture_regions, buffer).is_none() {
            return Err(DeviceError::NotRegistered(buffer));
        }
        self.calls.push(AudioCall::SubmitCapture(buffer));
        self.pending.push_back(buffer);
        Ok(())
    }
}

/// Audio backend that records calls and lets tests drive completions.
///
/// Clones share the same state, so a test can keep one clone while a route
/// owns another.
#[derive(Clone, Default)]
pub struct MockAudioBackend {
    state: Arc<Mutex<AudioState>>,
}

impl MockAudioBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend that fails at the given steps.
    pub fn with_faults(faults: AudioFaults) -> Self {
        let backend = Self::new();
        backend.set_faults(faults);
        backend
    }

    pub fn set_faults(&self, faults: AudioFaults) {
        lock(&self.state).faults = faults;
    }

    /// Every call recorded so far, in order.
    pub fn calls(&self) -> Vec<AudioCall> {
        lock(&self.state).calls.clone()
    }

    /// Number of recorded calls matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&AudioCall) -> bool) -> usize {
        lock(&self.state).calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    /// Devices opened and not yet closed.
    pub fn open_handles(&self) -> usize {
        lock(&self.state).open_handles
    }

    /// Buffer indices waiting in the capture queue.
    pub fn pending(&self) -> Vec<usize> {
        lock(&self.state).pending.iter().copied().collect()
    }

    pub fn is_streaming(&self) -> bool {
        lock(&self.state).streaming
    }

    /// Bytes of every successful playback write, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        lock(&self.state).written.clone()
    }

    /// Runs `hook` at the start of every playback write, before the write
    /// is recorded. Lets a test hold a completion in flight.
    pub fn set_write_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        lock(&self.state).write_hook = Some(Arc::new(hook));
    }

    /// Plays the OS: fills the oldest queued buffer with `data` and invokes
    /// the completion handler on the calling thread.
    ///
    /// Returns the completed buffer index, or None if nothing was queued or
    /// no capture device is open.
    pub fn complete_next(&self, data: &[u8]) -> Option<usize> {
        let (handler, buffer) = {
            let mut state = lock(&self.state);
            let handler = state.handler.clone()?;
            let index = state.pending.pop_front()?;
            let buffer = lookup(&state.capture_regions, index)?;
            (handler, buffer)
        };

        let bytes_recorded = buffer.write_capture(0, data);
        let queue = MockQueue {
            state: Arc::clone(&self.state),
        };
        let queue: &dyn CaptureQueue = &queue;
        handler(
            queue,
            Completion {
                buffer: buffer.index(),
                bytes_recorded,
            },
        );
        Some(buffer.index())
    }

    /// Invokes the completion handler with an arbitrary completion.
    pub fn deliver(&self, completion: Completion) -> bool {
        let Some(handler) = lock(&self.state).handler.clone() else {
            return false;
        };
        let queue = MockQueue {
            state: Arc::clone(&self.state),
        };
        let queue: &dyn CaptureQueue = &queue;
        handler(queue, completion);
        true
    }
}

impl AudioBackend for MockAudioBackend {
    type Capture = MockCapture;
    type Playback = MockPlayback;

    fn open_capture(
        &mut self,
        device: &DeviceDescriptor,
        _format: AudioFormat,
        handler: CaptureHandler,
    ) -> Result<MockCapture, DeviceError> {
        let mut state = lock(&self.state);
        if state.faults.capture_open {
            return Err(injected("capture open"));
        }
        state.calls.push(AudioCall::OpenCapture(device.display_name.clone()));
        state.handler = Some(handler);
        state.open_handles += 1;
        Ok(MockCapture {
            state: Arc::clone(&self.state),
            closed: false,
        })
    }

    fn open_playback(
        &mut self,
        device: &DeviceDescriptor,
        _format: AudioFormat,
    ) -> Result<MockPlayback, DeviceError> {
        let mut state = lock(&self.state);
        if state.faults.playback_open {
            return Err(injected("playback open"));
        }
        state.calls.push(AudioCall::OpenPlayback(device.display_name.clone()));
        state.open_handles += 1;
        Ok(MockPlayback {
            state: Arc::clone(&self.state),
            closed: false,
        })
    }
}

/// Resubmission access handed to the completion handler.
struct MockQueue {
    state: Arc<Mutex<AudioState>>,
}

impl CaptureQueue for MockQueue {
    fn submit(&self, buffer: usize) -> Result<(), DeviceError> {
        lock(&self.state).submit(buffer)
    }
}

pub struct MockCapture {
    state: Arc<Mutex<AudioState>>,
    closed: bool,
}

impl CaptureDevice for MockCapture {
    fn register(&mut self, buffer: &Arc<AudioBuffer>) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        if state.faults.register_capture == Some(buffer.index()) {
            return Err(injected("capture register"));
        }
        store_region(&mut state.capture_regions, buffer);
        state.calls.push(AudioCall::RegisterCapture(buffer.index()));
        Ok(())
    }

    fn submit(&mut self, buffer: usize) -> Result<(), DeviceError> {
        lock(&self.state).submit(buffer)
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        if state.faults.start {
            return Err(injected("start"));
        }
        state.streaming = true;
        state.calls.push(AudioCall::StartCapture);
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = lock(&self.state);
        state.streaming = false;
        state.calls.push(AudioCall::StopCapture);
    }

    fn reset(&mut self) {
        let mut state = lock(&self.state);
        state.pending.clear();
        state.calls.push(AudioCall::ResetCapture);
    }

    fn unregister(&mut self, buffer: usize) {
        let mut state = lock(&self.state);
        if let Some(slot) = state.capture_regions.get_mut(buffer) {
            *slot = None;
        }
        state.calls.push(AudioCall::UnregisterCapture(buffer));
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = lock(&self.state);
        state.handler = None;
        state.streaming = false;
        state.pending.clear();
        state.capture_regions.clear();
        state.open_handles -= 1;
        state.calls.push(AudioCall::CloseCapture);
    }
}

impl Drop for MockCapture {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct MockPlayback {
    state: Arc<Mutex<AudioState>>,
    closed: bool,
}

impl PlaybackDevice for MockPlayback {
    fn register(&mut self, buffer: &Arc<AudioBuffer>) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        if state.faults.register_playback == Some(buffer.index()) {
            return Err(injected("playback register"));
        }
        store_region(&mut state.playback_regions, buffer);
        state.calls.push(AudioCall::RegisterPlayback(buffer.index()));
        Ok(())
    }

    fn writer(&self) -> Arc<dyn PlaybackWriter> {
        Arc::new(MockWriter {
            state: Arc::clone(&self.state),
        })
    }

    fn reset(&mut self) {
        lock(&self.state).calls.push(AudioCall::ResetPlayback);
    }

    fn unregister(&mut self, buffer: usize) {
        let mut state = lock(&self.state);
        if let Some(slot) = state.playback_regions.get_mut(buffer) {
            *slot = None;
        }
        state.calls.push(AudioCall::UnregisterPlayback(buffer));
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = lock(&self.state);
        state.playback_regions.clear();
        state.open_handles -= 1;
        state.calls.push(AudioCall::ClosePlayback);
    }
}

impl Drop for MockPlayback {
    fn drop(&mut self) {
        self.close();
    }
}

struct MockWriter {
    state: Arc<Mutex<AudioState>>,
}

impl PlaybackWriter for MockWriter {
    fn write(&self, buffer: usize, len: usize) -> Result<(), DeviceError> {
        let hook = lock(&self.state).write_hook.clone();
        if let Some(hook) = hook {
            hook();
        }

        let mut state = lock(&self.state);
        state.calls.push(AudioCall::Write { buffer, len });
        if state.faults.write {
            return Err(injected("write"));
        }
        let region =
            lookup(&state.playback_regions, buffer).ok_or(DeviceError::NotRegistered(buffer))?;
        let bytes = region
            .with_playback(len, |bytes| bytes.to_vec())
            .ok_or_else(|| DeviceError::Backend("playback region poisoned".to_string()))?;
        state.written.push(bytes);
        Ok(())
    }
}

/// A call made against the mock MIDI backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiCall {
    OpenInput(String),
    OpenOutput(String),
    StartInput,
    StopInput,
    CloseInput,
    CloseOutput,
    Send(u32),
}

/// Steps the mock MIDI backend should fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct MidiFaults {
    pub input_open: bool,
    pub output_open: bool,
    pub start: bool,
    pub send: bool,
}

#[derive(Default)]
struct MidiState {
    calls: Vec<MidiCall>,
    faults: MidiFaults,
    handler: Option<MidiHandler>,
    started: bool,
    open_handles: usize,
    sent: Vec<ShortMessage>,
}

/// MIDI backend that records calls and lets tests inject input.
#[derive(Clone, Default)]
pub struct MockMidiBackend {
    state: Arc<Mutex<MidiState>>,
}

impl MockMidiBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: MidiFaults) -> Self {
        let backend = Self::new();
        lock(&backend.state).faults = faults;
        backend
    }

    pub fn calls(&self) -> Vec<MidiCall> {
        lock(&self.state).calls.clone()
    }

    /// Devices opened and not yet closed.
    pub fn open_handles(&self) -> usize {
        lock(&self.state).open_handles
    }

    /// Messages the output device accepted, in order.
    pub fn sent(&self) -> Vec<ShortMessage> {
        lock(&self.state).sent.clone()
    }

    /// Plays the OS: delivers a message to the input handler on the calling
    /// thread. Returns false if the input is not open and started.
    pub fn inject(&self, message: ShortMessage) -> bool {
        let handler = {
            let state = lock(&self.state);
            if !state.started {
                return false;
            }
            match state.handler.clone() {
                Some(handler) => handler,
                None => return false,
            }
        };
        handler(message);
        true
    }
}

impl MidiBackend for MockMidiBackend {
    type Input = MockMidiInput;
    type Output = MockMidiOutput;

    fn open_input(
        &mut self,
        device: &DeviceDescriptor,
        handler: MidiHandler,
    ) -> Result<MockMidiInput, DeviceError> {
        let mut state = lock(&self.state);
        if state.faults.input_open {
            return Err(injected("input open"));
        }
        state.calls.push(MidiCall::OpenInput(device.display_name.clone()));
        state.handler = Some(handler);
        state.open_handles += 1;
        Ok(MockMidiInput {
            state: Arc::clone(&self.state),
            closed: false,
        })
    }

    fn open_output(&mut self, device: &DeviceDescriptor) -> Result<Arc<MockMidiOutput>, DeviceError> {
        let mut state = lock(&self.state);
        if state.faults.output_open {
            return Err(injected("output open"));
        }
        state.calls.push(MidiCall::OpenOutput(device.display_name.clone()));
        state.open_handles += 1;
        Ok(Arc::new(MockMidiOutput {
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct MockMidiInput {
    state: Arc<Mutex<MidiState>>,
    closed: bool,
}

impl MidiInputDevice for MockMidiInput {
    fn start(&mut self) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        if state.faults.start {
            return Err(injected("start"));
        }
        state.started = true;
        state.calls.push(MidiCall::StartInput);
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = lock(&self.state);
        state.started = false;
        state.calls.push(MidiCall::StopInput);
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = lock(&self.state);
        state.started = false;
        state.handler = None;
        state.open_handles -= 1;
        state.calls.push(MidiCall::CloseInput);
    }
}

impl Drop for MockMidiInput {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct MockMidiOutput {
    state: Arc<Mutex<MidiState>>,
    closed: AtomicBool,
}

impl MidiOutputDevice for MockMidiOutput {
    fn send(&self, message: ShortMessage) -> Result<(), DeviceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DeviceError::Closed);
        }
        let mut state = lock(&self.state);
        state.calls.push(MidiCall::Send(message.packed()));
        if state.faults.send {
            return Err(injected("send"));
        }
        state.sent.push(message);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = lock(&self.state);
        state.open_handles -= 1;
        state.calls.push(MidiCall::CloseOutput);
    }
}

/// A catalog with fixed device names.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    audio_inputs: Vec<String>,
    audio_outputs: Vec<String>,
    midi_inputs: Vec<String>,
    midi_outputs: Vec<String>,
}

impl StaticCatalog {
    pub fn new(
        audio_inputs: &[&str],
        audio_outputs: &[&str],
        midi_inputs: &[&str],
        midi_outputs: &[&str],
    ) -> Self {
        let owned = |names: &[&str]| -> Vec<String> { names.iter().map(|n| n.to_string()).collect() };
        Self {
            audio_inputs: owned(audio_inputs),
            audio_outputs: owned(audio_outputs),
            midi_inputs: owned(midi_inputs),
            midi_outputs: owned(midi_outputs),
        }
    }
}

impl DeviceCatalog for StaticCatalog {
    fn audio_inputs(&self) -> Vec<DeviceDescriptor> {
        with_sentinel(Direction::Input, DeviceKind::Audio, self.audio_inputs.clone())
    }

    fn audio_outputs(&self) -> Vec<DeviceDescriptor> {
        with_sentinel(Direction::Output, DeviceKind::Audio, self.audio_outputs.clone())
    }

    fn midi_inputs(&self) -> Vec<DeviceDescriptor> {
        with_sentinel(Direction::Input, DeviceKind::Midi, self.midi_inputs.clone())
    }

    fn midi_outputs(&self) -> Vec<DeviceDescriptor> {
        with_sentinel(Direction::Output, DeviceKind::Midi, self.midi_outputs.clone())
    }
}
