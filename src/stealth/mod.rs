//! Stealth and anti-detection module
//!
//! Wraps an `ActionPort` so injected input looks less mechanical:
//! - Humanized tap positions with slight offsets
//! - Humanized press durations

pub mod humanize;

pub use humanize::*;

use serde::{Deserialize, Serialize};

/// Configuration for stealth behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StealthConfig {
    /// Enable humanized tap positions
    pub humanize_position: bool,
    /// Maximum tap position offset in pixels
    pub position_offset_max: i32,
    /// Enable humanized press durations
    pub humanize_duration: bool,
    /// Press duration variance percentage (0-100)
    pub duration_variance_percent: u32,
    /// Fixed RNG seed for reproducible jitter
    pub seed: Option<u64>,
}

impl Default for StealthConfig {
    fn default() -> Self {
        Self {
            humanize_position: true,
            position_offset_max: 6,
            humanize_duration: true,
            duration_variance_percent: 30,
            seed: None,
        }
    }
}

impl StealthConfig {
    /// Create a config with no stealth (for testing)
    pub fn disabled() -> Self {
        Self {
            humanize_position: false,
            position_offset_max: 0,
            humanize_duration: false,
            duration_variance_percent: 0,
            seed: None,
        }
    }

    /// Whether the config changes anything at all
    pub fn is_active(&self) -> bool {
        (self.humanize_position && self.position_offset_max > 0)
            || (self.humanize_duration && self.duration_variance_percent > 0)
    }
}
