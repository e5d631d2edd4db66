//! Device descriptors
//!
//! Immutable values describing one endpoint found during enumeration.
//! A descriptor is only a name and a position in the backend's port list;
//! backends re-resolve it every time a route connects.

use std::fmt;

/// Display name of the synthetic "no selection" entry.
pub const NO_DEVICE_NAME: &str = "No Device";

/// Display name used when the backend cannot report a device name.
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

/// Whether a device produces or consumes data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Capture / MIDI in.
    Input,
    /// Playback / MIDI out.
    Output,
}

/// The kind of data a device carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// PCM audio.
    Audio,
    /// MIDI short messages.
    Midi,
}

/// Identifier of a device within its kind/direction list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceId {
    /// The "No Device" placeholder. Never a valid connection endpoint.
    Sentinel,
    /// Position of the device in the backend's enumeration order.
    Port(usize),
}

/// A point-in-time description of an audio or MIDI endpoint.
///
/// Descriptors may go stale if hardware is removed after enumeration;
/// use [`DeviceCatalog::is_available`](super::DeviceCatalog::is_available)
/// to revalidate one before connecting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceDescriptor {
    /// Position in the backend's port list, or the sentinel.
    pub id: DeviceId,
    /// Human-readable device name.
    pub display_name: String,
    /// Input or output.
    pub direction: Direction,
    /// Audio or MIDI.
    pub kind: DeviceKind,
}

impl DeviceDescriptor {
    /// Create a descriptor for a real port.
    pub fn new(
        index: usize,
        display_name: impl Into<String>,
        direction: Direction,
        kind: DeviceKind,
    ) -> Self {
        Self {
            id: DeviceId::Port(index),
            display_name: display_name.into(),
            direction,
            kind,
        }
    }

    /// Create the "No Device" entry for a list.
    pub fn sentinel(direction: Direction, kind: DeviceKind) -> Self {
        Self {
            id: DeviceId::Sentinel,
            display_name: NO_DEVICE_NAME.to_string(),
            direction,
            kind,
        }
    }

    /// Returns true for the "No Device" entry.
    pub fn is_sentinel(&self) -> bool {
        self.id == DeviceId::Sentinel
    }

    /// Port index, or `None` for the sentinel.
    pub fn port_index(&self) -> Option<usize> {
        match self.id {
            DeviceId::Sentinel => None,
            DeviceId::Port(index) => Some(index),
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            DeviceId::Sentinel => write!(f, "{}", self.display_name),
            DeviceId::Port(index) => write!(f, "{} (#{})", self.display_name, index),
        }
    }
}

/// Build a catalog list: the sentinel followed by `names` in order.
pub fn with_sentinel<I, S>(direction: Direction, kind: DeviceKind, names: I) -> Vec<DeviceDescriptor>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    std::iter::once(DeviceDescriptor::sentinel(direction, kind))
        .chain(
            names
                .into_iter()
                .enumerate()
                .map(|(index, name)| DeviceDescriptor::new(index, name, direction, kind)),
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel() {
        let device = DeviceDescriptor::sentinel(Direction::Input, DeviceKind::Audio);
        assert!(device.is_sentinel());
        assert_eq!(device.display_name, "No Device");
        assert_eq!(device.port_index(), None);
    }

    #[test]
    fn test_with_sentinel_prepends() {
        let list = with_sentinel(Direction::Output, DeviceKind::Midi, ["Synth", "Drum Machine"]);
        assert_eq!(list.len(), 3);
        assert!(list[0].is_sentinel());
        assert_eq!(list[1].port_index(), Some(0));
        assert_eq!(list[2].display_name, "Drum Machine");
        assert!(list.iter().all(|d| d.direction == Direction::Output));
        assert!(list.iter().all(|d| d.kind == DeviceKind::Midi));
    }

    #[test]
    fn test_empty_list_still_has_sentinel() {
        let list = with_sentinel::<_, String>(Direction::Input, DeviceKind::Audio, Vec::new());
        assert_eq!(list.len(), 1);
        assert!(list[0].is_sentinel());
    }

    #[test]
    fn test_display() {
        let device = DeviceDescriptor::new(3, "Line In", Direction::Input, DeviceKind::Audio);
        assert_eq!(device.to_string(), "Line In (#3)");
    }
}
