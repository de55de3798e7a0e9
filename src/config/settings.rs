use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::serial::{BaudRate, Result, SerialError, TransferConfig};

/// Tunables for a [`SerialMonitor`](crate::SerialMonitor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Per-session transfer behaviour.
    pub transfer: TransferConfig,
    /// How often the hot-plug monitor re-enumerates ports.
    pub monitor_interval_ms: u64,
    /// Baud rate offered when the caller does not pick one.
    pub default_baud_rate: BaudRate,
    /// Byte that terminates a line for line-oriented reads.
    pub line_delimiter: u8,
    /// Longest line a line-oriented read will return.
    pub max_line_length: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            transfer: TransferConfig::default(),
            monitor_interval_ms: 1000,
            default_baud_rate: BaudRate::B115200,
            line_delimiter: b'\n',
            max_line_length: 4096,
        }
    }
}

impl Settings {
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Settings =
            serde_json::from_str(json).map_err(|e| SerialError::InvalidConfiguration(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| SerialError::InvalidConfiguration(format!("{}: {}", path.display(), e)))?;
        log::debug!("Loading settings from {}", path.display());
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| SerialError::InvalidConfiguration(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.transfer.queue_capacity == 0 {
            return Err(SerialError::InvalidConfiguration("transfer.queue_capacity must be at least 1".into()));
        }
        if self.transfer.read_chunk_size == 0 {
            return Err(SerialError::InvalidConfiguration("transfer.read_chunk_size must be at least 1".into()));
        }
        if self.monitor_interval_ms == 0 {
            return Err(SerialError::InvalidConfiguration("monitor_interval_ms must be at least 1".into()));
        }
        if self.max_line_length == 0 {
            return Err(SerialError::InvalidConfiguration("max_line_length must be at least 1".into()));
        }
        Ok(())
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}
