//! midir MIDI backend
//!
//! Uses midir for cross-platform MIDI I/O (ALSA on Linux, CoreMIDI on macOS,
//! WinMM on Windows). midir starts delivering as soon as a port is connected,
//! so the input keeps a start gate that drops messages until `start`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use midir::{MidiIO, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};

use super::midi::{MidiBackend, MidiHandler, MidiInputDevice, MidiOutputDevice, ShortMessage};
use super::DeviceError;
use crate::device::{DeviceDescriptor, UNKNOWN_DEVICE_NAME};

/// Find the port a descriptor refers to, checking it has not been swapped.
fn resolve_port<T: MidiIO>(io: &T, device: &DeviceDescriptor) -> Result<T::Port, DeviceError> {
    let index = device
        .port_index()
        .ok_or_else(|| DeviceError::NotFound(device.display_name.clone()))?;

    let port = io
        .ports()
        .into_iter()
        .nth(index)
        .ok_or_else(|| DeviceError::NotFound(device.display_name.clone()))?;

    let name = io
        .port_name(&port)
        .unwrap_or_else(|_| UNKNOWN_DEVICE_NAME.to_string());
    if name != device.display_name {
        return Err(DeviceError::Stale {
            expected: device.display_name.clone(),
            found: name,
        });
    }

    Ok(port)
}

/// MIDI backend on the platform's native MIDI API.
pub struct MidirBackend {
    client_name: String,
}

impl MidirBackend {
    /// Create a backend registering ports under `client_name`.
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
        }
    }
}

impl MidiBackend for MidirBackend {
    type Input = MidirInput;
    type Output = MidirOutput;

    fn open_input(
        &mut self,
        device: &DeviceDescriptor,
        handler: MidiHandler,
    ) -> Result<MidirInput, DeviceError> {
        let midi_in = MidiInput::new(&format!("{}-in", self.client_name))
            .map_err(|e| DeviceError::Backend(e.to_string()))?;
        let port = resolve_port(&midi_in, device)?;

        let started = Arc::new(AtomicBool::new(false));
        let gate = Arc::clone(&started);

        let connection = midi_in
            .connect(
                &port,
                &format!("{}-input", self.client_name),
                move |timestamp_us, data, _| {
                    if !gate.load(Ordering::Acquire) {
                        return;
                    }
                    match ShortMessage::from_bytes(data, timestamp_us) {
                        Some(message) => handler(message),
                        None => log::trace!("MIDI: dropping {}-byte message", data.len()),
                    }
                },
                (),
            )
            .map_err(|e| DeviceError::Backend(e.to_string()))?;

        log::debug!("MIDI: opened input '{}'", device.display_name);

        Ok(MidirInput {
            connection: Some(connection),
            started,
        })
    }

    fn open_output(&mut self, device: &DeviceDescriptor) -> Result<Arc<MidirOutput>, DeviceError> {
        let midi_out = MidiOutput::new(&format!("{}-out", self.client_name))
            .map_err(|e| DeviceError::Backend(e.to_string()))?;
        let port = resolve_port(&midi_out, device)?;

        let connection = midi_out
            .connect(&port, &format!("{}-output", self.client_name))
            .map_err(|e| DeviceError::Backend(e.to_string()))?;

        log::debug!("MIDI: opened output '{}'", device.display_name);

        Ok(Arc::new(MidirOutput {
            connection: Mutex::new(Some(connection)),
        }))
    }
}

/// An open midir input connection.
pub struct MidirInput {
    connection: Option<MidiInputConnection<()>>,
    started: Arc<AtomicBool>,
}

impl MidiInputDevice for MidirInput {
    fn start(&mut self) -> Result<(), DeviceError> {
        if self.connection.is_none() {
            return Err(DeviceError::Closed);
        }
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) {
        self.started.store(false, Ordering::Release);
    }

    fn close(&mut self) {
        self.started.store(false, Ordering::Release);
        if let Some(connection) = self.connection.take() {
            // Closing drops the handler along with the connection
            let _ = connection.close();
        }
    }
}

impl Drop for MidirInput {
    fn drop(&mut self) {
        self.close();
    }
}

/// An open midir output connection.
pub struct MidirOutput {
    connection: Mutex<Option<MidiOutputConnection>>,
}

impl MidiOutputDevice for MidirOutput {
    fn send(&self, message: ShortMessage) -> Result<(), DeviceError> {
        let mut guard = self
            .connection
            .lock()
            .map_err(|_| DeviceError::Backend("output connection poisoned".to_string()))?;
        let connection = guard.as_mut().ok_or(DeviceError::Closed)?;
        connection
            .send(&message.as_array()[..message.len()])
            .map_err(|e| DeviceError::Backend(e.to_string()))
    }

    fn close(&self) {
        if let Ok(mut guard) = self.connection.lock() {
            if let Some(connection) = guard.take() {
                let _ = connection.close();
            }
        }
    }
}
