//! MIDI Route
//!
//! Forwards every short message arriving at one MIDI input straight to one
//! MIDI output. Messages are sent from the input's callback thread with no
//! queueing in between.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use super::error::{DeviceRole, RouteError};
use crate::backend::{MidiBackend, MidiHandler, MidiInputDevice, MidiOutputDevice, ShortMessage};
use crate::device::DeviceDescriptor;

/// Counters accumulated over every connection a MIDI route has made.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MidiStats {
    pub messages_forwarded: u64,
    pub send_failures: u64,
}

#[derive(Debug, Default)]
struct MidiCounters {
    messages_forwarded: AtomicU64,
    send_failures: AtomicU64,
}

/// Per-connection state shared with the input handler.
struct MidiSession {
    /// Set once the output port is open.
    output: OnceLock<Arc<dyn MidiOutputDevice>>,
    counters: Arc<MidiCounters>,
}

impl MidiSession {
    fn on_message(&self, message: ShortMessage) {
        let Some(output) = self.output.get() else {
            return;
        };

        match output.send(message) {
            Ok(()) => {
                self.counters
                    .messages_forwarded
                    .fetch_add(1, Ordering::Relaxed);
                log::trace!("MIDI: forwarded {:?}", message);
            }
            Err(e) => {
                self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("MIDI: failed to forward {:?}: {}", message, e);
            }
        }
    }
}

struct ActiveMidi<B: MidiBackend> {
    input: B::Input,
    output: Arc<B::Output>,
    input_device: DeviceDescriptor,
    output_device: DeviceDescriptor,
}

/// One MIDI input → output connection.
pub struct MidiRoute<B: MidiBackend> {
    backend: B,
    active: Option<ActiveMidi<B>>,
    counters: Arc<MidiCounters>,
}

impl<B: MidiBackend> MidiRoute<B> {
    /// Create a disconnected route.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            active: None,
            counters: Arc::new(MidiCounters::default()),
        }
    }

    /// Connect `input` to `output`, replacing any existing connection.
    pub fn connect(
        &mut self,
        input: &DeviceDescriptor,
        output: &DeviceDescriptor,
    ) -> Result<(), RouteError> {
        for device in [input, output] {
            if device.is_sentinel() {
                log::warn!("MIDI: rejected '{}' as an endpoint", device.display_name);
                return Err(RouteError::InvalidDevice(device.display_name.clone()));
            }
        }

        if self.active.is_some() {
            log::info!("MIDI: disconnecting existing route first");
            self.disconnect();
        }

        log::info!(
            "MIDI: connecting '{}' -> '{}'",
            input.display_name,
            output.display_name
        );

        let session = Arc::new(MidiSession {
            output: OnceLock::new(),
            counters: Arc::clone(&self.counters),
        });
        let handler_session = Arc::clone(&session);
        let handler: MidiHandler =
            Arc::new(move |message: ShortMessage| handler_session.on_message(message));

        let mut midi_in = self
            .backend
            .open_input(input, handler)
            .map_err(|source| {
                log::warn!("MIDI: failed to open input: {}", source);
                RouteError::DeviceOpen {
                    role: DeviceRole::MidiInput,
                    source,
                }
            })?;

        let midi_out = match self.backend.open_output(output) {
            Ok(midi_out) => midi_out,
            Err(source) => {
                log::warn!("MIDI: failed to open output: {}", source);
                midi_in.close();
                return Err(RouteError::DeviceOpen {
                    role: DeviceRole::MidiOutput,
                    source,
                });
            }
        };

        let shared: Arc<dyn MidiOutputDevice> = midi_out.clone();
        let _ = session.output.set(shared);

        if let Err(source) = midi_in.start() {
            log::warn!("MIDI: failed to start input: {}", source);
            midi_in.close();
            midi_out.close();
            return Err(RouteError::StreamStart {
                role: DeviceRole::MidiInput,
                source,
            });
        }

        self.active = Some(ActiveMidi {
            input: midi_in,
            output: midi_out,
            input_device: input.clone(),
            output_device: output.clone(),
        });
        log::info!("MIDI: connected");
        Ok(())
    }

    /// Stop and close the input, then close the output. Does nothing when
    /// disconnected.
    pub fn disconnect(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };

        log::info!("MIDI: disconnecting");
        active.input.stop();
        active.input.close();
        active.output.close();
        log::info!("MIDI: disconnected");
    }

    /// Returns true while input and output are open.
    pub fn is_connected(&self) -> bool {
        self.active.is_some()
    }

    /// The connected input and output.
    pub fn endpoints(&self) -> Option<(&DeviceDescriptor, &DeviceDescriptor)> {
        self.active
            .as_ref()
            .map(|a| (&a.input_device, &a.output_device))
    }

    /// Counters accumulated since the route was created.
    pub fn stats(&self) -> MidiStats {
        MidiStats {
            messages_forwarded: self.counters.messages_forwarded.load(Ordering::Relaxed),
            send_failures: self.counters.send_failures.load(Ordering::Relaxed),
        }
    }
}

impl<B: MidiBackend> Drop for MidiRoute<B> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MidiCall, MidiFaults, MockMidiBackend};
    use crate::device::{DeviceKind, Direction};

    fn input() -> DeviceDescriptor {
        DeviceDescriptor::new(0, "Keystation", Direction::Input, DeviceKind::Midi)
    }

    fn output() -> DeviceDescriptor {
        DeviceDescriptor::new(1, "Synth Module", Direction::Output, DeviceKind::Midi)
    }

    #[test]
    fn test_note_on_forwarded_unchanged() {
        let backend = MockMidiBackend::new();
        let mut route = MidiRoute::new(backend.clone());
        route.connect(&input(), &output()).unwrap();

        let note_on = ShortMessage::new(0x90, 60, 100, 1234);
        assert!(backend.inject(note_on));

        let sent = backend.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].packed(), note_on.packed());
        assert_eq!(route.stats().messages_forwarded, 1);
    }

    #[test]
    fn test_messages_forwarded_in_order() {
        let backend = MockMidiBackend::new();
        let mut route = MidiRoute::new(backend.clone());
        route.connect(&input(), &output()).unwrap();

        let messages = [
            ShortMessage::new(0x90, 60, 100, 0),
            ShortMessage::from_bytes(&[0xC3, 7], 10).unwrap(),
            ShortMessage::from_bytes(&[0xF8], 20).unwrap(),
            ShortMessage::new(0x80, 60, 0, 30),
        ];
        for message in messages {
            backend.inject(message);
        }

        let packed: Vec<u32> = backend.sent().iter().map(|m| m.packed()).collect();
        let expected: Vec<u32> = messages.iter().map(|m| m.packed()).collect();
        assert_eq!(packed, expected);
    }

    #[test]
    fn test_connect_opens_and_starts() {
        let backend = MockMidiBackend::new();
        let mut route = MidiRoute::new(backend.clone());
        route.connect(&input(), &output()).unwrap();

        assert_eq!(
            backend.calls(),
            vec![
                MidiCall::OpenInput("Keystation".to_string()),
                MidiCall::OpenOutput("Synth Module".to_string()),
                MidiCall::StartInput,
            ]
        );
        assert!(route.is_connected());
        assert_eq!(backend.open_handles(), 2);
        let (i, o) = route.endpoints().unwrap();
        assert_eq!(i.display_name, "Keystation");
        assert_eq!(o.display_name, "Synth Module");
    }

    #[test]
    fn test_sentinel_rejected() {
        let backend = MockMidiBackend::new();
        let mut route = MidiRoute::new(backend.clone());

        let sentinel = DeviceDescriptor::sentinel(Direction::Output, DeviceKind::Midi);
        let result = route.connect(&input(), &sentinel);

        assert!(matches!(result, Err(RouteError::InvalidDevice(_))));
        assert!(backend.calls().is_empty());
        assert!(!route.is_connected());
    }

    #[test]
    fn test_input_open_failure_opens_nothing() {
        let backend = MockMidiBackend::with_faults(MidiFaults {
            input_open: true,
            ..Default::default()
        });
        let mut route = MidiRoute::new(backend.clone());

        let result = route.connect(&input(), &output());

        assert!(matches!(
            result,
            Err(RouteError::DeviceOpen {
                role: DeviceRole::MidiInput,
                ..
            })
        ));
        assert!(!backend
            .calls()
            .iter()
            .any(|c| matches!(c, MidiCall::OpenOutput(_))));
        assert_eq!(backend.open_handles(), 0);
        assert!(!route.is_connected());
    }

    #[test]
    fn test_output_open_failure_closes_input() {
        let backend = MockMidiBackend::with_faults(MidiFaults {
            output_open: true,
            ..Default::default()
        });
        let mut route = MidiRoute::new(backend.clone());

        let result = route.connect(&input(), &output());

        assert!(matches!(
            result,
            Err(RouteError::DeviceOpen {
                role: DeviceRole::MidiOutput,
                ..
            })
        ));
        assert_eq!(
            backend.calls(),
            vec![
                MidiCall::OpenInput("Keystation".to_string()),
                MidiCall::CloseInput
            ]
        );
        assert_eq!(backend.open_handles(), 0);
    }

    #[test]
    fn test_start_failure_closes_both() {
        let backend = MockMidiBackend::with_faults(MidiFaults {
            start: true,
            ..Default::default()
        });
        let mut route = MidiRoute::new(backend.clone());

        let result = route.connect(&input(), &output());

        assert!(matches!(result, Err(RouteError::StreamStart { .. })));
        assert_eq!(backend.open_handles(), 0);
        assert!(!route.is_connected());
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let backend = MockMidiBackend::new();
        let mut route = MidiRoute::new(backend.clone());
        route.connect(&input(), &output()).unwrap();

        route.disconnect();
        route.disconnect();

        let calls = backend.calls();
        assert_eq!(
            &calls[3..],
            &[MidiCall::StopInput, MidiCall::CloseInput, MidiCall::CloseOutput]
        );
        assert_eq!(backend.open_handles(), 0);
        assert!(!route.is_connected());
    }

    #[test]
    fn test_nothing_forwarded_after_disconnect() {
        let backend = MockMidiBackend::new();
        let mut route = MidiRoute::new(backend.clone());
        route.connect(&input(), &output()).unwrap();
        route.disconnect();

        assert!(!backend.inject(ShortMessage::new(0x90, 64, 90, 0)));
        assert!(backend.sent().is_empty());
    }

    #[test]
    fn test_send_failure_is_counted() {
        let backend = MockMidiBackend::with_faults(MidiFaults {
            send: true,
            ..Default::default()
        });
        let mut route = MidiRoute::new(backend.clone());
        route.connect(&input(), &output()).unwrap();

        backend.inject(ShortMessage::new(0xB0, 7, 127, 0));

        assert!(route.is_connected());
        assert_eq!(route.stats().send_failures, 1);
        assert_eq!(route.stats().messages_forwarded, 0);
    }

    #[test]
    fn test_reconnect_replaces_connection() {
        let backend = MockMidiBackend::new();
        let mut route = MidiRoute::new(backend.clone());
        route.connect(&input(), &output()).unwrap();
        route.connect(&input(), &output()).unwrap();

        assert_eq!(backend.open_handles(), 2);
        assert_eq!(
            backend
                .calls()
                .iter()
                .filter(|c| **c == MidiCall::CloseOutput)
                .count(),
            1
        );
    }

    #[test]
    fn test_drop_disconnects() {
        let backend = MockMidiBackend::new();
        {
            let mut route = MidiRoute::new(backend.clone());
            route.connect(&input(), &output()).unwrap();
        }
        assert_eq!(backend.open_handles(), 0);
    }
}
