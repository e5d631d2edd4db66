//! Router configuration.
//!
//! Read-only JSON settings. Every field is optional; a missing file section
//! falls back to the defaults below.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::backend::cpal_audio::DEFAULT_PLAYBACK_QUEUE_BUFFERS;
use crate::engine::DrainSettings;

/// Default MIDI client name.
pub const DEFAULT_CLIENT_NAME: &str = "device-router";

/// Settings for a router session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Name MIDI ports are registered under.
    pub client_name: String,
    /// Upper bound on the shutdown drain, in milliseconds.
    pub drain_timeout_ms: u64,
    /// Delay between drain checks, in milliseconds.
    pub drain_poll_interval_ms: u64,
    /// Frames the cpal playback queue holds before writes are dropped.
    pub playback_queue_buffers: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            drain_timeout_ms: 2000,
            drain_poll_interval_ms: 1,
            playback_queue_buffers: DEFAULT_PLAYBACK_QUEUE_BUFFERS,
        }
    }
}

impl RouterConfig {
    /// Parse a configuration from JSON text.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a configuration from a JSON file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json(&json)?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Drain bounds for the audio route.
    pub fn drain_settings(&self) -> DrainSettings {
        DrainSettings {
            timeout: Duration::from_millis(self.drain_timeout_ms),
            // A zero interval would spin the control thread
            poll_interval: Duration::from_millis(self.drain_poll_interval_ms.max(1)),
        }
    }
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("File error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}
