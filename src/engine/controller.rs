//! Connection Controller
//!
//! The surface a settings dialog talks to. Owns the audio route, the MIDI
//! route and the device catalog; toggles report success as a bool so the
//! caller can put a checkbox back when a connect fails.

use super::audio_route::{AudioRoute, DrainSettings};
use super::midi_route::MidiRoute;
use crate::backend::{AudioBackend, CpalAudioBackend, MidiBackend, MidirBackend};
use crate::config::RouterConfig;
use crate::device::{DeviceCatalog, DeviceDescriptor, DeviceLists, SystemCatalog};

/// Owns both routes and the device lists a selection refers to.
pub struct ConnectionController<A: AudioBackend, M: MidiBackend> {
    audio: AudioRoute<A>,
    midi: MidiRoute<M>,
    catalog: Box<dyn DeviceCatalog>,
    /// Lists from the most recent refresh; indices refer to these.
    devices: DeviceLists,
}

impl ConnectionController<CpalAudioBackend, MidirBackend> {
    /// A controller on the platform's audio and MIDI subsystems.
    pub fn with_system(config: &RouterConfig) -> Self {
        Self::new(
            CpalAudioBackend::new(config.playback_queue_buffers),
            MidirBackend::new(config.client_name.clone()),
            Box::new(SystemCatalog::new(config.client_name.clone())),
            config.drain_settings(),
        )
    }
}

impl<A: AudioBackend, M: MidiBackend> ConnectionController<A, M> {
    /// Create a controller and take an initial device snapshot.
    pub fn new(
        audio_backend: A,
        midi_backend: M,
        catalog: Box<dyn DeviceCatalog>,
        drain: DrainSettings,
    ) -> Self {
        let devices = DeviceLists::snapshot(catalog.as_ref());
        Self {
            audio: AudioRoute::new(audio_backend, drain),
            midi: MidiRoute::new(midi_backend),
            catalog,
            devices,
        }
    }

    /// Re-enumerate every device list.
    pub fn refresh_devices(&mut self) -> &DeviceLists {
        self.devices = DeviceLists::snapshot(self.catalog.as_ref());
        log::debug!(
            "Devices refreshed: {} audio in, {} audio out, {} MIDI in, {} MIDI out",
            self.devices.audio_inputs.len(),
            self.devices.audio_outputs.len(),
            self.devices.midi_inputs.len(),
            self.devices.midi_outputs.len()
        );
        &self.devices
    }

    /// Lists from the most recent refresh.
    pub fn devices(&self) -> &DeviceLists {
        &self.devices
    }

    /// Connect or disconnect the audio route. Returns false if connecting
    /// failed.
    pub fn set_audio_test_enabled(
        &mut self,
        enable: bool,
        input: &DeviceDescriptor,
        output: &DeviceDescriptor,
    ) -> bool {
        if enable {
            self.audio.connect(input, output).is_ok()
        } else {
            self.audio.disconnect();
            true
        }
    }

    /// Connect or disconnect the MIDI route. Returns false if connecting
    /// failed.
    pub fn set_midi_test_enabled(
        &mut self,
        enable: bool,
        input: &DeviceDescriptor,
        output: &DeviceDescriptor,
    ) -> bool {
        if enable {
            self.midi.connect(input, output).is_ok()
        } else {
            self.midi.disconnect();
            true
        }
    }

    /// Audio toggle by position in the current device lists.
    ///
    /// An index past the end of either list leaves everything untouched and
    /// reports success. A device that disappeared since the last refresh
    /// reports failure.
    pub fn set_audio_test_enabled_by_index(
        &mut self,
        enable: bool,
        input: usize,
        output: usize,
    ) -> bool {
        if !enable {
            self.audio.disconnect();
            return true;
        }
        let Some((input, output)) = self.select(
            input,
            output,
            |d| &d.audio_inputs,
            |d| &d.audio_outputs,
        ) else {
            return true;
        };
        if !self.still_available(&input, &output) {
            return false;
        }
        self.set_audio_test_enabled(true, &input, &output)
    }

    /// MIDI toggle by position in the current device lists.
    pub fn set_midi_test_enabled_by_index(
        &mut self,
        enable: bool,
        input: usize,
        output: usize,
    ) -> bool {
        if !enable {
            self.midi.disconnect();
            return true;
        }
        let Some((input, output)) =
            self.select(input, output, |d| &d.midi_inputs, |d| &d.midi_outputs)
        else {
            return true;
        };
        if !self.still_available(&input, &output) {
            return false;
        }
        self.set_midi_test_enabled(true, &input, &output)
    }

    fn select(
        &self,
        input: usize,
        output: usize,
        inputs: impl Fn(&DeviceLists) -> &Vec<DeviceDescriptor>,
        outputs: impl Fn(&DeviceLists) -> &Vec<DeviceDescriptor>,
    ) -> Option<(DeviceDescriptor, DeviceDescriptor)> {
        let selected = inputs(&self.devices)
            .get(input)
            .cloned()
            .zip(outputs(&self.devices).get(output).cloned());
        if selected.is_none() {
            log::debug!("Selection ({}, {}) out of range, ignored", input, output);
        }
        selected
    }

    fn still_available(&self, input: &DeviceDescriptor, output: &DeviceDescriptor) -> bool {
        for device in [input, output] {
            if !self.catalog.is_available(device) {
                log::warn!("'{}' is no longer available", device.display_name);
                return false;
            }
        }
        true
    }

    /// Disconnect both routes.
    pub fn end_session(&mut self) {
        self.audio.disconnect();
        self.midi.disconnect();
    }

    /// The audio route, for status queries.
    pub fn audio(&self) -> &AudioRoute<A> {
        &self.audio
    }

    /// The MIDI route, for status queries.
    pub fn midi(&self) -> &MidiRoute<M> {
        &self.midi
    }
}

impl<A: AudioBackend, M: MidiBackend> Drop for ConnectionController<A, M> {
    fn drop(&mut self) {
        self.end_session();
    }
}
