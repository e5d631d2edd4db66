//! Device Catalog
//!
//! Point-in-time enumeration of audio and MIDI endpoints. Every list starts
//! with the "No Device" sentinel so a UI can offer an empty selection.

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::Host;
use midir::{MidiInput, MidiOutput};

use super::descriptor::{
    with_sentinel, DeviceDescriptor, DeviceKind, Direction, UNKNOWN_DEVICE_NAME,
};

/// Source of device lists for the four kind × direction combinations.
pub trait DeviceCatalog {
    /// Audio capture devices, sentinel first.
    fn audio_inputs(&self) -> Vec<DeviceDescriptor>;
    /// Audio playback devices, sentinel first.
    fn audio_outputs(&self) -> Vec<DeviceDescriptor>;
    /// MIDI input ports, sentinel first.
    fn midi_inputs(&self) -> Vec<DeviceDescriptor>;
    /// MIDI output ports, sentinel first.
    fn midi_outputs(&self) -> Vec<DeviceDescriptor>;

    /// The list matching a kind and direction.
    fn list(&self, kind: DeviceKind, direction: Direction) -> Vec<DeviceDescriptor> {
        match (kind, direction) {
            (DeviceKind::Audio, Direction::Input) => self.audio_inputs(),
            (DeviceKind::Audio, Direction::Output) => self.audio_outputs(),
            (DeviceKind::Midi, Direction::Input) => self.midi_inputs(),
            (DeviceKind::Midi, Direction::Output) => self.midi_outputs(),
        }
    }

    /// Check whether a previously enumerated device still exists.
    ///
    /// The sentinel is always available. A real device is available when a
    /// fresh enumeration lists the same id under the same name.
    fn is_available(&self, device: &DeviceDescriptor) -> bool {
        if device.is_sentinel() {
            return true;
        }
        self.list(device.kind, device.direction)
            .iter()
            .any(|d| d.id == device.id && d.display_name == device.display_name)
    }
}

/// Snapshot of all four device lists.
#[derive(Debug, Clone, Default)]
pub struct DeviceLists {
    pub audio_inputs: Vec<DeviceDescriptor>,
    pub audio_outputs: Vec<DeviceDescriptor>,
    pub midi_inputs: Vec<DeviceDescriptor>,
    pub midi_outputs: Vec<DeviceDescriptor>,
}

impl DeviceLists {
    /// Query every list from a catalog.
    pub fn snapshot(catalog: &dyn DeviceCatalog) -> Self {
        Self {
            audio_inputs: catalog.audio_inputs(),
            audio_outputs: catalog.audio_outputs(),
            midi_inputs: catalog.midi_inputs(),
            midi_outputs: catalog.midi_outputs(),
        }
    }
}

/// Catalog backed by the default cpal host and midir.
pub struct SystemCatalog {
    host: Host,
    client_name: String,
}

impl SystemCatalog {
    /// Create a catalog using the default audio host.
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            host: cpal::default_host(),
            client_name: client_name.into(),
        }
    }

    fn audio_names(&self, direction: Direction) -> Vec<String> {
        let devices = match direction {
            Direction::Input => self.host.input_devices().map(|d| d.collect::<Vec<_>>()),
            Direction::Output => self.host.output_devices().map(|d| d.collect::<Vec<_>>()),
        };

        match devices {
            Ok(devices) => devices
                .iter()
                .map(|d| d.name().unwrap_or_else(|_| UNKNOWN_DEVICE_NAME.to_string()))
                .collect(),
            Err(e) => {
                log::warn!("Audio: failed to enumerate {:?} devices: {}", direction, e);
                Vec::new()
            }
        }
    }

    fn midi_names(&self, direction: Direction) -> Vec<String> {
        let client = format!("{}-list", self.client_name);
        match direction {
            Direction::Input => match MidiInput::new(&client) {
                Ok(midi_in) => midi_in
                    .ports()
                    .iter()
                    .map(|p| {
                        midi_in
                            .port_name(p)
                            .unwrap_or_else(|_| UNKNOWN_DEVICE_NAME.to_string())
                    })
                    .collect(),
                Err(e) => {
                    log::warn!("MIDI: failed to initialize input for listing: {}", e);
                    Vec::new()
                }
            },
            Direction::Output => match MidiOutput::new(&client) {
                Ok(midi_out) => midi_out
                    .ports()
                    .iter()
                    .map(|p| {
                        midi_out
                            .port_name(p)
                            .unwrap_or_else(|_| UNKNOWN_DEVICE_NAME.to_string())
                    })
                    .collect(),
                Err(e) => {
                    log::warn!("MIDI: failed to initialize output for listing: {}", e);
                    Vec::new()
                }
            },
        }
    }
}

impl DeviceCatalog for SystemCatalog {
    fn audio_inputs(&self) -> Vec<DeviceDescriptor> {
        with_sentinel(
            Direction::Input,
            DeviceKind::Audio,
            self.audio_names(Direction::Input),
        )
    }

    fn audio_outputs(&self) -> Vec<DeviceDescriptor> {
        with_sentinel(
            Direction::Output,
            DeviceKind::Audio,
            self.audio_names(Direction::Output),
        )
    }

    fn midi_inputs(&self) -> Vec<DeviceDescriptor> {
        with_sentinel(
            Direction::Input,
            DeviceKind::Midi,
            self.midi_names(Direction::Input),
        )
    }

    fn midi_outputs(&self) -> Vec<DeviceDescriptor> {
        with_sentinel(
            Direction::Output,
            DeviceKind::Midi,
            self.midi_names(Direction::Output),
        )
    }
}
