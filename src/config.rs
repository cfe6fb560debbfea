//! Send configuration.
//!
//! Values come from defaults, an optional TOML file, then CLI flags.

use crate::error::{Result, SendError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Buffered bytes above which the producer hands data to the consumer and waits.
pub const DEFAULT_HIGH_WATER: usize = 1024 * 1024;

/// Largest data payload carried by a single write command.
pub const DEFAULT_MAX_WRITE: usize = 0xC000;

/// Upper bound on the high-water mark.
pub const MAX_HIGH_WATER: usize = 1 << 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SendConfig {
    pub high_water: usize,
    pub max_write: usize,
    /// Send a subvolume that is not flagged read-only.
    pub allow_writable: bool,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            high_water: DEFAULT_HIGH_WATER,
            max_write: DEFAULT_MAX_WRITE,
            allow_writable: false,
        }
    }
}

impl SendConfig {
    /// Load from a TOML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SendError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
            .map_err(|e| SendError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: SendConfig =
            toml::from_str(content).map_err(|e| SendError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_write == 0 || self.max_write > u16::MAX as usize {
            return Err(SendError::Config(format!(
                "max_write must be between 1 and {}, got {}",
                u16::MAX,
                self.max_write
            )));
        }
        if self.high_water > MAX_HIGH_WATER {
            return Err(SendError::Config(format!(
                "high_water must be at most {}, got {}",
                MAX_HIGH_WATER, self.high_water
            )));
        }
        if self.high_water < self.max_write {
            return Err(SendError::Config(format!(
                "high_water ({}) must be at least max_write ({})",
                self.high_water, self.max_write
            )));
        }
        Ok(())
    }

    /// Initial output buffer size: high-water mark plus two chunks of slack.
    pub fn buffer_capacity(&self) -> Result<usize> {
        self.max_write
            .checked_mul(2)
            .and_then(|slack| slack.checked_add(self.high_water))
            .ok_or_else(|| {
                SendError::Config(format!(
                    "buffer of {} + 2 * {} bytes overflows",
                    self.high_water, self.max_write
                ))
            })
    }
}
