//! Configuration module
//!
//! Engine settings and the errors raised while validating configuration
//! (settings, pattern sets, and step graphs) before a run starts.

pub mod settings;

pub use settings::{EngineSettings, PatternSettings, Settings};

use crate::vision::VisionError;

/// Problems that make a run impossible to start
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Missing patterns: {}", .0.join(", "))]
    MissingPatterns(Vec<String>),
    #[error("Step graph declares no steps")]
    EmptyGraph,
    #[error("Entry step '{0}' is not declared")]
    UnknownEntry(String),
    #[error("Step '{step}' references unknown step '{target}'")]
    UnknownStep { step: String, target: String },
    #[error("Duplicate step id '{0}'")]
    DuplicateStep(String),
    #[error("Step '{0}' declares no candidate patterns")]
    EmptyCandidates(String),
    #[error("Step '{step}' threshold {threshold} is outside [0, 1)")]
    InvalidThreshold { step: String, threshold: f32 },
    #[error("Step '{step}' branches on '{pattern}', which is not one of its candidates")]
    UnknownBranch { step: String, pattern: String },
    #[error("Step '{step}' swipe path needs at least two points")]
    ShortSwipe { step: String },
    #[error("Pattern '{0}' has no intensity variance")]
    FlatPattern(String),
    #[error("Malformed definition: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Vision(#[from] VisionError),
}
