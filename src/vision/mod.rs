//! Vision module
//!
//! Frames, the reference pattern library, and template matching.

pub mod frame;
pub mod matcher;
pub mod patterns;

pub use frame::{Frame, Region};
pub use matcher::{best_of, MatchResult, Matcher};
pub use patterns::{Pattern, PatternLibrary};

/// Vision system errors
#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("Invalid frame data")]
    InvalidFrameData,
    #[error("Unknown pattern: {0}")]
    UnknownPattern(String),
    #[error("Failed to read pattern directory {path}: {source}")]
    PatternDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to read frame directory {path}: {source}")]
    FrameDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to load pattern '{name}': {source}")]
    PatternLoad {
        name: String,
        #[source]
        source: image::ImageError,
    },
    #[error("Pattern '{name}' ({}x{}) is larger than the frame ({}x{})", .pattern.0, .pattern.1, .frame.0, .frame.1)]
    PatternLargerThanFrame {
        name: String,
        pattern: (u32, u32),
        frame: (u32, u32),
    },
    #[error("Pattern '{0}' has no intensity variance and cannot be correlated")]
    FlatPattern(String),
}
