//! Engine settings
//!
//! Defines all tunable options for a run. Every field has a default, so a
//! settings file only needs to name what it changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigurationError;
use crate::stealth::StealthConfig;

/// Main settings structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Drive loop timing and matching defaults
    pub engine: EngineSettings,
    /// Where reference patterns come from
    pub patterns: PatternSettings,
    /// Input humanization
    pub stealth: StealthConfig,
}

impl Settings {
    /// Settings with humanization switched off, for reproducible runs
    pub fn precise() -> Self {
        Self {
            stealth: StealthConfig::disabled(),
            ..Default::default()
        }
    }

    /// Parse settings from JSON
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.engine.check()?;
        Ok(settings)
    }

    /// Read settings from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }
}

/// Drive loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Delay between attempts of a step that did not match (ms)
    pub poll_interval_ms: u64,
    /// Threshold for steps that do not declare their own
    pub default_threshold: f32,
    /// Granularity of cancellable waits (ms)
    pub cancel_check_ms: u64,
    /// Log progress every this many attempts of one step (0 = never)
    pub progress_log_every: u32,
    /// How long a pushed-frame source waits for a fresh frame (ms)
    pub capture_timeout_ms: u64,
    /// How long a queued gesture waits for the platform to confirm it,
    /// on top of the gesture's own duration (ms)
    pub gesture_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            default_threshold: 0.7,
            cancel_check_ms: 50,
            progress_log_every: 10,
            capture_timeout_ms: 2000,
            gesture_timeout_ms: 2000,
        }
    }
}

impl EngineSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn gesture_timeout(&self) -> Duration {
        Duration::from_millis(self.gesture_timeout_ms)
    }

    /// Never zero, so waits always make progress
    pub fn cancel_check(&self) -> Duration {
        Duration::from_millis(self.cancel_check_ms.max(1))
    }

    pub(crate) fn check(&self) -> Result<(), ConfigurationError> {
        if !(0.0..1.0).contains(&self.default_threshold) {
            return Err(ConfigurationError::InvalidThreshold {
                step: "<default>".to_string(),
                threshold: self.default_threshold,
            });
        }
        Ok(())
    }
}

/// Pattern source settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternSettings {
    /// Directory scanned for reference images
    pub directory: PathBuf,
    /// File extensions to load
    pub extensions: Vec<String>,
}

impl Default for PatternSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("templates"),
            extensions: vec!["png".to_string()],
        }
    }
}

impl PatternSettings {
    pub fn extension_refs(&self) -> Vec<&str> {
        self.extensions.iter().map(String::as_str).collect()
    }
}
