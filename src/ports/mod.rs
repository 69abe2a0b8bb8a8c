//! Collaborator interfaces
//!
//! The engine never touches a device directly. Frames come in through a
//! `FrameSource` and input goes out through an `ActionPort`; platform
//! adapters (JNI on Android, replay on desktop) implement both.

pub mod replay;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::vision::Frame;

pub use replay::{DryRunPort, ReplaySource};

/// Screen coordinate in frame pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Translate by an offset
    pub fn offset(self, dx: i32, dy: i32) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }
}

impl std::fmt::Display for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Transient capture failures. Retry policy belongs to the sequencer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureError {
    #[error("Screen capture unavailable")]
    Unavailable,
    #[error("Screen capture timed out")]
    TimedOut,
}

/// Produces fresh frames on demand
pub trait FrameSource: Send + Sync {
    fn capture_frame(&self) -> Result<Frame, CaptureError>;
}

/// Injects synthetic input. `false` means the injection did not happen.
pub trait ActionPort: Send + Sync {
    fn tap(&self, point: Point, duration: Duration) -> bool;

    fn swipe(&self, path: &[Point], duration: Duration) -> bool;
}

impl<T: FrameSource + ?Sized> FrameSource for std::sync::Arc<T> {
    fn capture_frame(&self) -> Result<Frame, CaptureError> {
        (**self).capture_frame()
    }
}

impl<T: ActionPort + ?Sized> ActionPort for std::sync::Arc<T> {
    fn tap(&self, point: Point, duration: Duration) -> bool {
        (**self).tap(point, duration)
    }

    fn swipe(&self, path: &[Point], duration: Duration) -> bool {
        (**self).swipe(path, duration)
    }
}
