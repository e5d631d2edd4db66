//! Audio Route
//!
//! Connects one capture device to one playback device through a fixed pool
//! of buffers. The capture device hands each filled buffer to a completion
//! callback on its own thread; the callback copies the captured bytes into
//! the buffer's playback region, submits them for playback, and puts the
//! buffer back on the capture queue.
//!
//! Disconnect is the delicate part. A completion may be running at any
//! moment, so teardown raises the shutdown flag, stops streaming, and waits
//! for every buffer to go idle before any region is withdrawn from the
//! devices.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use super::buffer_pool::{BufferPool, BUFFER_SIZE};
use super::error::{DeviceRole, RouteError};
use crate::backend::{
    AudioBackend, AudioFormat, CaptureDevice, CaptureHandler, CaptureQueue, Completion,
    PlaybackDevice, PlaybackWriter,
};
use crate::device::DeviceDescriptor;

/// Bounds on the shutdown drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainSettings {
    /// Give up waiting for in-flight buffers after this long.
    pub timeout: Duration,
    /// Delay between checks of the buffer states.
    pub poll_interval: Duration,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(1),
        }
    }
}

/// Lifecycle of an audio route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Counters accumulated over every connection a route has made.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteStats {
    /// Completion callbacks handled, including shutdown pass-throughs.
    pub completions: u64,
    /// Buffers successfully submitted for playback.
    pub frames_forwarded: u64,
    /// Buffers whose playback submission failed.
    pub frames_dropped: u64,
    /// Buffers that could not be put back on the capture queue.
    pub resubmit_failures: u64,
}

#[derive(Debug, Default)]
struct AudioCounters {
    completions: AtomicU64,
    frames_forwarded: AtomicU64,
    frames_dropped: AtomicU64,
    resubmit_failures: AtomicU64,
}

impl AudioCounters {
    fn snapshot(&self) -> RouteStats {
        RouteStats {
            completions: self.completions.load(Ordering::Relaxed),
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            resubmit_failures: self.resubmit_failures.load(Ordering::Relaxed),
        }
    }
}

/// Per-connection state shared with the completion callback.
struct AudioSession {
    pool: BufferPool,
    shutting_down: AtomicBool,
    /// Set once the playback device is open.
    playback: OnceLock<Arc<dyn PlaybackWriter>>,
    counters: Arc<AudioCounters>,
}

impl AudioSession {
    fn new(counters: Arc<AudioCounters>) -> Self {
        Self {
            pool: BufferPool::allocate(),
            shutting_down: AtomicBool::new(false),
            playback: OnceLock::new(),
            counters,
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Completion callback body. Runs on the capture device's thread.
    ///
    /// REAL-TIME PATH: never waits on another buffer or on the control thread.
    fn on_capture_complete(&self, queue: &dyn CaptureQueue, completion: Completion) {
        let Some(buffer) = self.pool.get(completion.buffer) else {
            log::warn!("Audio: completion for unknown buffer {}", completion.buffer);
            return;
        };

        // InFlight must be visible before the flag is read
        buffer.mark_in_flight();
        self.counters.completions.fetch_add(1, Ordering::Relaxed);

        if self.is_shutting_down() {
            log::trace!("Audio: buffer {} drained during shutdown", buffer.index());
            buffer.mark_idle();
            return;
        }

        let len = completion.bytes_recorded.min(BUFFER_SIZE);
        match self.playback.get() {
            Some(writer) if len > 0 => {
                let copied = buffer.copy_capture_to_playback(len);
                match writer.write(buffer.index(), copied) {
                    Ok(()) => {
                        self.counters.frames_forwarded.fetch_add(1, Ordering::Relaxed);
                        log::trace!("Audio: buffer {} forwarded {} bytes", buffer.index(), copied);
                    }
                    Err(source) => {
                        self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        let err = RouteError::TransientWrite {
                            index: buffer.index(),
                            source,
                        };
                        log::warn!("Audio: {}", err);
                    }
                }
            }
            Some(_) => log::trace!("Audio: buffer {} completed empty", buffer.index()),
            None => log::trace!("Audio: no playback device for buffer {}", buffer.index()),
        }

        if !self.is_shutting_down() {
            if let Err(e) = queue.submit(buffer.index()) {
                self.counters.resubmit_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("Audio: failed to requeue buffer {}: {}", buffer.index(), e);
            }
        }

        buffer.mark_idle();
    }
}

/// Devices and buffers of a live connection.
struct ActiveAudio<B: AudioBackend> {
    capture: B::Capture,
    playback: Option<B::Playback>,
    session: Arc<AudioSession>,
    /// Buffers `0..n` have their capture region registered.
    capture_registered: usize,
    /// Buffers `0..n` have their playback region registered.
    playback_registered: usize,
    input: DeviceDescriptor,
    output: DeviceDescriptor,
}

impl<B: AudioBackend> ActiveAudio<B> {
    /// Zero, register and queue every buffer, in pool order.
    fn prepare_buffers(&mut self) -> Result<(), RouteError> {
        let Some(playback) = self.playback.as_mut() else {
            return Err(RouteError::BufferSetup {
                index: 0,
                source: crate::backend::DeviceError::Closed,
            });
        };

        for buffer in self.session.pool.iter() {
            let index = buffer.index();
            let setup = |source| RouteError::BufferSetup { index, source };
            log::debug!("Audio: initializing buffer {}", index);

            buffer.zero();
            self.capture.register(buffer).map_err(setup)?;
            self.capture_registered += 1;
            playback.register(buffer).map_err(setup)?;
            self.playback_registered += 1;
            self.capture.submit(index).map_err(setup)?;
        }

        Ok(())
    }
}

/// One capture → playback audio connection.
pub struct AudioRoute<B: AudioBackend> {
    backend: B,
    drain: DrainSettings,
    state: RouteState,
    active: Option<ActiveAudio<B>>,
    counters: Arc<AudioCounters>,
}

impl<B: AudioBackend> AudioRoute<B> {
    /// Create a disconnected route.
    pub fn new(backend: B, drain: DrainSettings) -> Self {
        Self {
            backend,
            drain,
            state: RouteState::Disconnected,
            active: None,
            counters: Arc::new(AudioCounters::default()),
        }
    }

    /// Connect `input` to `output`.
    ///
    /// An existing connection is torn down first. On failure every device
    /// opened along the way has been closed and the route is disconnected.
    pub fn connect(
        &mut self,
        input: &DeviceDescriptor,
        output: &DeviceDescriptor,
    ) -> Result<(), RouteError> {
        for device in [input, output] {
            if device.is_sentinel() {
                log::warn!("Audio: rejected '{}' as an endpoint", device.display_name);
                return Err(RouteError::InvalidDevice(device.display_name.clone()));
            }
        }

        if self.active.is_some() {
            log::info!("Audio: disconnecting existing route first");
            self.disconnect();
        }

        log::info!(
            "Audio: connecting '{}' -> '{}'",
            input.display_name,
            output.display_name
        );
        self.state = RouteState::Connecting;

        match self.establish(input, output) {
            Ok(active) => {
                self.active = Some(active);
                self.state = RouteState::Connected;
                log::info!("Audio: connected");
                Ok(())
            }
            Err(e) => {
                self.state = RouteState::Disconnected;
                log::warn!("Audio: connect failed: {}", e);
                Err(e)
            }
        }
    }

    fn establish(
        &mut self,
        input: &DeviceDescriptor,
        output: &DeviceDescriptor,
    ) -> Result<ActiveAudio<B>, RouteError> {
        let session = Arc::new(AudioSession::new(Arc::clone(&self.counters)));

        let handler_session = Arc::clone(&session);
        let handler: CaptureHandler =
            Arc::new(move |queue: &dyn CaptureQueue, completion: Completion| {
                handler_session.on_capture_complete(queue, completion)
            });

        log::debug!("Audio: opening capture device");
        let capture = self
            .backend
            .open_capture(input, AudioFormat::SESSION, handler)
            .map_err(|source| RouteError::DeviceOpen {
                role: DeviceRole::Capture,
                source,
            })?;

        let mut active: ActiveAudio<B> = ActiveAudio {
            capture,
            playback: None,
            session,
            capture_registered: 0,
            playback_registered: 0,
            input: input.clone(),
            output: output.clone(),
        };

        log::debug!("Audio: opening playback device");
        match self.backend.open_playback(output, AudioFormat::SESSION) {
            Ok(playback) => {
                let _ = active.session.playback.set(playback.writer());
                active.playback = Some(playback);
            }
            Err(source) => {
                active.capture.close();
                return Err(RouteError::DeviceOpen {
                    role: DeviceRole::Playback,
                    source,
                });
            }
        }

        if let Err(e) = active.prepare_buffers() {
            self.teardown(active);
            return Err(e);
        }

        log::debug!("Audio: starting capture");
        if let Err(source) = active.capture.start() {
            self.teardown(active);
            return Err(RouteError::StreamStart {
                role: DeviceRole::Capture,
                source,
            });
        }

        Ok(active)
    }

    /// Tear down the current connection. Does nothing when disconnected.
    pub fn disconnect(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        log::info!("Audio: disconnecting");
        self.state = RouteState::Disconnecting;
        self.teardown(active);
        self.state = RouteState::Disconnected;
        log::info!("Audio: disconnected");
    }

    /// Release everything an [`ActiveAudio`] holds, in the order that keeps
    /// regions registered until no callback can touch them.
    fn teardown(&self, mut active: ActiveAudio<B>) {
        let session = Arc::clone(&active.session);

        session.shutting_down.store(true, Ordering::SeqCst);
        active.capture.stop();

        if !self.wait_for_idle(&session.pool) {
            log::error!(
                "Audio: {} buffer(s) still in flight after {:?}, closing anyway",
                session.pool.in_flight_count(),
                self.drain.timeout
            );
        }

        log::debug!("Audio: resetting devices");
        active.capture.reset();
        if let Some(playback) = active.playback.as_mut() {
            playback.reset();
        }

        log::debug!("Audio: unregistering buffers");
        for index in 0..active.capture_registered {
            active.capture.unregister(index);
        }
        if let Some(playback) = active.playback.as_mut() {
            for index in 0..active.playback_registered {
                playback.unregister(index);
            }
        }

        log::debug!("Audio: closing devices");
        active.capture.close();
        if let Some(playback) = active.playback.as_mut() {
            playback.close();
        }
    }

    /// Poll until every buffer is idle. Returns false on timeout.
    fn wait_for_idle(&self, pool: &BufferPool) -> bool {
        let deadline = Instant::now() + self.drain.timeout;
        while !pool.all_idle() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(self.drain.poll_interval);
        }
        true
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RouteState {
        self.state
    }

    /// Returns true while audio is being routed.
    pub fn is_connected(&self) -> bool {
        self.state == RouteState::Connected
    }

    /// Number of buffers in the live pool; zero when disconnected.
    pub fn pool_len(&self) -> usize {
        self.active
            .as_ref()
            .map(|a| a.session.pool.len())
            .unwrap_or(0)
    }

    /// The connected input and output.
    pub fn endpoints(&self) -> Option<(&DeviceDescriptor, &DeviceDescriptor)> {
        self.active.as_ref().map(|a| (&a.input, &a.output))
    }

    /// Counters accumulated since the route was created.
    pub fn stats(&self) -> RouteStats {
        self.counters.snapshot()
    }
}

impl<B: AudioBackend> Drop for AudioRoute<B> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{AudioCall, AudioFaults, MockAudioBackend};
    use crate::backend::DeviceError;
    use crate::device::{DeviceKind, Direction};
    use crate::engine::buffer_pool::NUM_BUFFERS;
    use std::sync::mpsc;
    use std::sync::Mutex;

    fn input() -> DeviceDescriptor {
        DeviceDescriptor::new(0, "Line In", Direction::Input, DeviceKind::Audio)
    }

    fn output() -> DeviceDescriptor {
        DeviceDescriptor::new(0, "Speakers", Direction::Output, DeviceKind::Audio)
    }

    fn route(backend: &MockAudioBackend) -> AudioRoute<MockAudioBackend> {
        AudioRoute::new(backend.clone(), DrainSettings::default())
    }

    fn position(calls: &[AudioCall], call: &AudioCall) -> usize {
        calls
            .iter()
            .position(|c| c == call)
            .unwrap_or_else(|| panic!("{:?} not recorded", call))
    }

    #[test]
    fn test_connect_registers_and_queues_each_buffer_once() {
        let backend = MockAudioBackend::new();
        let mut route = route(&backend);

        route.connect(&input(), &output()).unwrap();

        let calls = backend.calls();
        let start = position(&calls, &AudioCall::StartCapture);
        for i in 0..NUM_BUFFERS {
            assert_eq!(backend.count(|c| *c == AudioCall::RegisterCapture(i)), 1);
            assert_eq!(backend.count(|c| *c == AudioCall::RegisterPlayback(i)), 1);
            assert_eq!(backend.count(|c| *c == AudioCall::SubmitCapture(i)), 1);
            assert!(position(&calls, &AudioCall::SubmitCapture(i)) < start);
        }
        assert_eq!(backend.pending(), vec![0, 1, 2, 3]);
        assert!(backend.is_streaming());
        assert_eq!(route.pool_len(), NUM_BUFFERS);
        assert_eq!(route.state(), RouteState::Connected);
    }

    #[test]
    fn test_connect_then_disconnect() {
        let backend = MockAudioBackend::new();
        let mut route = route(&backend);

        route.connect(&input(), &output()).unwrap();
        assert!(route.is_connected());
        assert_eq!(backend.open_handles(), 2);

        route.disconnect();

        assert_eq!(route.pool_len(), 0);
        assert!(!route.is_connected());
        assert_eq!(route.state(), RouteState::Disconnected);
        assert!(route.endpoints().is_none());
        assert_eq!(backend.open_handles(), 0);
    }

    #[test]
    fn test_disconnect_order() {
        let backend = MockAudioBackend::new();
        let mut route = route(&backend);
        route.connect(&input(), &output()).unwrap();
        backend.clear_calls();

        route.disconnect();

        let calls = backend.calls();
        let stop = position(&calls, &AudioCall::StopCapture);
        let reset = position(&calls, &AudioCall::ResetCapture);
        let unregister = position(&calls, &AudioCall::UnregisterCapture(0));
        let close = position(&calls, &AudioCall::CloseCapture);
        assert!(stop < reset && reset < unregister && unregister < close);
        for i in 0..NUM_BUFFERS {
            assert_eq!(backend.count(|c| *c == AudioCall::UnregisterCapture(i)), 1);
            assert_eq!(backend.count(|c| *c == AudioCall::UnregisterPlayback(i)), 1);
        }
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let backend = MockAudioBackend::new();
        let mut route = route(&backend);
        route.connect(&input(), &output()).unwrap();

        route.disconnect();
        let after_first = backend.calls();
        route.disconnect();

        assert_eq!(backend.calls(), after_first);
        assert_eq!(route.pool_len(), 0);
        assert!(!route.is_connected());
    }

    #[test]
    fn test_disconnect_when_never_connected() {
        let backend = MockAudioBackend::new();
        let mut route = route(&backend);
        route.disconnect();
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_sentinel_rejected_before_any_device_call() {
        let backend = MockAudioBackend::new();
        let mut route = route(&backend);
        let sentinel = DeviceDescriptor::sentinel(Direction::Input, DeviceKind::Audio);

        let result = route.connect(&sentinel, &output());

        assert!(matches!(result, Err(RouteError::InvalidDevice(_))));
        assert!(backend.calls().is_empty());
        assert_eq!(backend.open_handles(), 0);

        let sentinel_out = DeviceDescriptor::sentinel(Direction::Output, DeviceKind::Audio);
        assert!(route.connect(&input(), &sentinel_out).is_err());
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_sentinel_leaves_existing_connection_alone() {
        let backend = MockAudioBackend::new();
        let mut route = route(&backend);
        route.connect(&input(), &output()).unwrap();

        let sentinel = DeviceDescriptor::sentinel(Direction::Input, DeviceKind::Audio);
        assert!(route.connect(&sentinel, &output()).is_err());
        assert!(route.is_connected());
    }

    #[test]
    fn test_playback_open_failure_closes_capture() {
        let backend = MockAudioBackend::with_faults(AudioFaults {
            playback_open: true,
            ..Default::default()
        });
        let mut route = route(&backend);

        let result = route.connect(&input(), &output());

        assert!(matches!(
            result,
            Err(RouteError::DeviceOpen {
                role: DeviceRole::Playback,
                ..
            })
        ));
        assert_eq!(
            backend.calls(),
            vec![
                AudioCall::OpenCapture("Line In".to_string()),
                AudioCall::CloseCapture
            ]
        );
        assert_eq!(backend.open_handles(), 0);
        assert_eq!(route.state(), RouteState::Disconnected);
    }

    #[test]
    fn test_capture_open_failure() {
        let backend = MockAudioBackend::with_faults(AudioFaults {
            capture_open: true,
            ..Default::default()
        });
        let mut route = route(&backend);

        let result = route.connect(&input(), &output());

        assert!(matches!(
            result,
            Err(RouteError::DeviceOpen {
                role: DeviceRole::Capture,
                ..
            })
        ));
        assert!(backend.calls().is_empty());
        assert_eq!(backend.open_handles(), 0);
    }

    #[test]
    fn test_buffer_setup_failure_rolls_back() {
        let backend = MockAudioBackend::with_faults(AudioFaults {
            register_playback: Some(2),
            ..Default::default()
        });
        let mut route = route(&backend);

        let result = route.connect(&input(), &output());

        assert!(matches!(
            result,
            Err(RouteError::BufferSetup { index: 2, .. })
        ));
        assert_eq!(backend.open_handles(), 0);
        assert_eq!(route.pool_len(), 0);
        assert!(!route.is_connected());
        assert_eq!(backend.count(|c| *c == AudioCall::StartCapture), 0);

        // Exactly what was registered gets unregistered
        for i in 0..3 {
            assert_eq!(backend.count(|c| *c == AudioCall::UnregisterCapture(i)), 1);
        }
        for i in 0..2 {
            assert_eq!(backend.count(|c| *c == AudioCall::UnregisterPlayback(i)), 1);
        }
        assert_eq!(backend.count(|c| *c == AudioCall::UnregisterCapture(3)), 0);
        assert_eq!(backend.count(|c| *c == AudioCall::UnregisterPlayback(2)), 0);
    }

    #[test]
    fn test_submit_failure_rolls_back() {
        let backend = MockAudioBackend::with_faults(AudioFaults {
            submit: Some(3),
            ..Default::default()
        });
        let mut route = route(&backend);

        let result = route.connect(&input(), &output());

        assert!(matches!(
            result,
            Err(RouteError::BufferSetup { index: 3, .. })
        ));
        assert_eq!(backend.open_handles(), 0);
        assert!(backend.pending().is_empty());
        for i in 0..NUM_BUFFERS {
            assert_eq!(backend.count(|c| *c == AudioCall::UnregisterCapture(i)), 1);
            assert_eq!(backend.count(|c| *c == AudioCall::UnregisterPlayback(i)), 1);
        }
    }

    #[test]
    fn test_first_capture_register_failure_unregisters_nothing() {
        let backend = MockAudioBackend::with_faults(AudioFaults {
            register_capture: Some(0),
            ..Default::default()
        });
        let mut route = route(&backend);

        let result = route.connect(&input(), &output());

        assert!(matches!(
            result,
            Err(RouteError::BufferSetup { index: 0, .. })
        ));
        assert_eq!(backend.open_handles(), 0);
        assert_eq!(backend.count(|c| *c == AudioCall::CloseCapture), 1);
        assert_eq!(backend.count(|c| *c == AudioCall::ClosePlayback), 1);
        assert_eq!(
            backend.count(|c| matches!(
                c,
                AudioCall::UnregisterCapture(_) | AudioCall::UnregisterPlayback(_)
            )),
            0
        );
        assert_eq!(backend.count(|c| *c == AudioCall::StartCapture), 0);
        assert!(!route.is_connected());
    }

    #[test]
    fn test_start_failure_rolls_back() {
        let backend = MockAudioBackend::with_faults(AudioFaults {
            start: true,
            ..Default::default()
        });
        let mut route = route(&backend);

        let result = route.connect(&input(), &output());

        assert!(matches!(
            result,
            Err(RouteError::StreamStart {
                role: DeviceRole::Capture,
                ..
            })
        ));
        assert_eq!(backend.open_handles(), 0);
        assert_eq!(route.state(), RouteState::Disconnected);
    }

    #[test]
    fn test_completion_forwards_exact_bytes_and_requeues() {
        let backend = MockAudioBackend::new();
        let mut route = route(&backend);
        route.connect(&input(), &output()).unwrap();

        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        assert_eq!(backend.complete_next(&data), Some(0));

        assert_eq!(backend.written(), vec![data]);
        assert_eq!(backend.pending(), vec![1, 2, 3, 0]);
        assert_eq!(route.stats().frames_forwarded, 1);
        assert_eq!(route.stats().completions, 1);
    }

    #[test]
    fn test_small_capture_after_large_has_no_residue() {
        let backend = MockAudioBackend::new();
        let mut route = route(&backend);
        route.connect(&input(), &output()).unwrap();

        // Cycle through all four buffers so buffer 0 comes round again
        for _ in 0..NUM_BUFFERS {
            backend.complete_next(&[0xFF; BUFFER_SIZE]);
        }
        backend.complete_next(&[0x01; 16]);

        let written = backend.written();
        assert_eq!(written.len(), NUM_BUFFERS + 1);
        assert_eq!(written[NUM_BUFFERS], vec![0x01; 16]);
        assert_eq!(
            backend.count(|c| *c == AudioCall::Write { buffer: 0, len: 16 }),
            1
        );
    }

    #[test]
    fn test_empty_completion_requeues_without_playback() {
        let backend = MockAudioBackend::new();
        let mut route = route(&backend);
        route.connect(&input(), &output()).unwrap();

        backend.complete_next(&[]);

        assert!(backend.written().is_empty());
        assert_eq!(backend.count(|c| matches!(c, AudioCall::Write { .. })), 0);
        assert_eq!(backend.pending(), vec![1, 2, 3, 0]);
    }

    #[test]
    fn test_write_failure_drops_frame_and_stays_connected() {
        let backend = MockAudioBackend::new();
        let mut route = route(&backend);
        route.connect(&input(), &output()).unwrap();
        backend.set_faults(AudioFaults {
            write: true,
            ..Default::default()
        });

        backend.complete_next(&[1; 64]);

        assert!(route.is_connected());
        assert_eq!(route.stats().frames_dropped, 1);
        assert_eq!(route.stats().frames_forwarded, 0);
        assert_eq!(backend.pending(), vec![1, 2, 3, 0]);
    }

    #[test]
    fn test_requeue_failure_is_counted_and_stays_connected() {
        let backend = MockAudioBackend::new();
        let mut route = route(&backend);
        route.connect(&input(), &output()).unwrap();
        backend.set_faults(AudioFaults {
            submit: Some(0),
            ..Default::default()
        });

        assert_eq!(backend.complete_next(&[5; 32]), Some(0));

        assert!(route.is_connected());
        assert_eq!(route.stats().resubmit_failures, 1);
        assert_eq!(route.stats().frames_forwarded, 1);
        // Buffer 0 dropped out of the rotation; the rest keep cycling
        assert_eq!(backend.pending(), vec![1, 2, 3]);
        assert_eq!(backend.complete_next(&[6; 32]), Some(1));
        assert_eq!(backend.pending(), vec![2, 3, 1]);
        assert_eq!(route.stats().resubmit_failures, 1);
    }

    #[test]
    fn test_unknown_buffer_completion_is_ignored() {
        let backend = MockAudioBackend::new();
        let mut route = route(&backend);
        route.connect(&input(), &output()).unwrap();

        assert!(backend.deliver(Completion {
            buffer: 99,
            bytes_recorded: 10,
        }));

        assert!(backend.written().is_empty());
        assert!(route.is_connected());
        assert_eq!(route.stats().completions, 0);
    }

    #[test]
    fn test_reconnect_tears_down_first() {
        let backend = MockAudioBackend::new();
        let mut route = route(&backend);
        route.connect(&input(), &output()).unwrap();

        route.connect(&input(), &output()).unwrap();

        let calls = backend.calls();
        let first_close = position(&calls, &AudioCall::CloseCapture);
        let second_open = calls
            .iter()
            .rposition(|c| matches!(c, AudioCall::OpenCapture(_)))
            .unwrap();
        assert!(first_close < second_open);
        assert_eq!(backend.open_handles(), 2);
        assert_eq!(route.pool_len(), NUM_BUFFERS);
    }

    #[test]
    fn test_repeated_cycles_leave_nothing_behind() {
        let backend = MockAudioBackend::new();
        let mut route = route(&backend);

        for _ in 0..100 {
            route.connect(&input(), &output()).unwrap();
            backend.complete_next(&[0; 128]);
            route.disconnect();
        }

        assert_eq!(route.pool_len(), 0);
        assert!(!route.is_connected());
        assert_eq!(backend.open_handles(), 0);
        assert!(backend.pending().is_empty());
        assert_eq!(backend.count(|c| matches!(c, AudioCall::OpenCapture(_))), 100);
        assert_eq!(
            backend.count(|c| matches!(c, AudioCall::RegisterCapture(_))),
            100 * NUM_BUFFERS
        );
    }

    #[test]
    fn test_drop_disconnects() {
        let backend = MockAudioBackend::new();
        {
            let mut route = route(&backend);
            route.connect(&input(), &output()).unwrap();
        }
        assert_eq!(backend.open_handles(), 0);
    }

    /// Holds every playback write until the test releases it.
    fn gate_writes(backend: &MockAudioBackend) -> (mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let entered_tx = Mutex::new(entered_tx);
        let release_rx = Mutex::new(release_rx);
        backend.set_write_hook(move || {
            let _ = entered_tx.lock().unwrap().send(());
            let _ = release_rx.lock().unwrap().recv();
        });
        (entered_rx, release_tx)
    }

    #[test]
    fn test_disconnect_waits_for_in_flight_callback() {
        let backend = MockAudioBackend::new();
        let mut route = AudioRoute::new(
            backend.clone(),
            DrainSettings {
                timeout: Duration::from_secs(10),
                poll_interval: Duration::from_millis(1),
            },
        );
        route.connect(&input(), &output()).unwrap();
        let (entered, release) = gate_writes(&backend);

        let os = {
            let backend = backend.clone();
            thread::spawn(move || backend.complete_next(&[9; 256]))
        };
        entered.recv().unwrap();

        let control = thread::spawn(move || {
            route.disconnect();
            route
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!control.is_finished(), "disconnect returned while a buffer was in flight");
        assert_eq!(backend.count(|c| *c == AudioCall::ResetCapture), 0);

        release.send(()).unwrap();
        assert_eq!(os.join().unwrap(), Some(0));
        let route = control.join().unwrap();

        let calls = backend.calls();
        let stop = position(&calls, &AudioCall::StopCapture);
        let write = position(&calls, &AudioCall::Write { buffer: 0, len: 256 });
        let reset = position(&calls, &AudioCall::ResetCapture);
        assert!(stop < write && write < reset);

        // The in-flight callback saw the shutdown and did not requeue
        assert!(!calls[stop..]
            .iter()
            .any(|c| matches!(c, AudioCall::SubmitCapture(_))));
        assert_eq!(route.pool_len(), 0);
        assert_eq!(backend.open_handles(), 0);
    }

    #[test]
    fn test_drain_timeout_forces_close() {
        let backend = MockAudioBackend::new();
        let mut route = AudioRoute::new(
            backend.clone(),
            DrainSettings {
                timeout: Duration::from_millis(30),
                poll_interval: Duration::from_millis(1),
            },
        );
        route.connect(&input(), &output()).unwrap();
        let (entered, release) = gate_writes(&backend);

        let os = {
            let backend = backend.clone();
            thread::spawn(move || backend.complete_next(&[9; 256]))
        };
        entered.recv().unwrap();

        route.disconnect();
        assert!(!route.is_connected());
        assert_eq!(backend.open_handles(), 0);

        // The stuck callback finishes against closed devices without harm
        release.send(()).unwrap();
        os.join().unwrap();
        assert_eq!(route.stats().frames_dropped, 1);
        assert!(backend.pending().is_empty());
    }

    #[test]
    fn test_concurrent_completions_during_disconnect() {
        let backend = MockAudioBackend::new();
        let mut route = route(&backend);
        route.connect(&input(), &output()).unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let backend = backend.clone();
                let running = Arc::clone(&running);
                thread::spawn(move || {
                    while running.load(Ordering::Relaxed) {
                        backend.complete_next(&[3; 512]);
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        route.disconnect();
        running.store(false, Ordering::Relaxed);
        for worker in workers {
            worker.join().unwrap();
        }

        let calls = backend.calls();
        let reset = position(&calls, &AudioCall::ResetCapture);
        assert!(!calls[reset..]
            .iter()
            .any(|c| matches!(c, AudioCall::SubmitCapture(_) | AudioCall::Write { .. })));
        assert_eq!(backend.open_handles(), 0);
        assert!(backend.pending().is_empty());
    }

    #[test]
    fn test_transient_write_error_message() {
        let err = RouteError::TransientWrite {
            index: 1,
            source: DeviceError::QueueFull,
        };
        assert!(err.to_string().contains("frame dropped"));
    }
}
