//! Desktop adapters
//!
//! `ReplaySource` serves recorded screenshots in file-name order and
//! `DryRunPort` logs the input it would have injected. Together they let a
//! step graph be exercised without a device.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{ActionPort, CaptureError, FrameSource, Point};
use crate::vision::{Frame, VisionError};

/// Replays a directory of screenshots, one per capture
pub struct ReplaySource {
    paths: Vec<PathBuf>,
    cursor: AtomicUsize,
    cycle: bool,
}

impl ReplaySource {
    /// Collect every image file in `dir`, sorted by name
    pub fn from_dir(dir: impl AsRef<Path>, extensions: &[&str]) -> Result<Self, VisionError> {
        let dir = dir.as_ref();
        let io_err = |source| VisionError::FrameDirectory {
            path: dir.display().to_string(),
            source,
        };

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            let wanted = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)));
            if path.is_file() && wanted {
                paths.push(path);
            }
        }
        paths.sort();

        log::info!("Replaying {} frames from {}", paths.len(), dir.display());
        Ok(Self::from_paths(paths))
    }

    pub fn from_paths(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            cursor: AtomicUsize::new(0),
            cycle: false,
        }
    }

    /// Start over from the first frame after the last one
    pub fn cycling(mut self) -> Self {
        self.cycle = true;
        self
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for ReplaySource {
    fn capture_frame(&self) -> Result<Frame, CaptureError> {
        if self.paths.is_empty() {
            return Err(CaptureError::Unavailable);
        }

        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        let index = if self.cycle {
            index % self.paths.len()
        } else {
            index.min(self.paths.len() - 1)
        };
        let path = &self.paths[index];

        match image::open(path) {
            Ok(img) => Ok(Frame::new(img.to_rgb8())),
            Err(e) => {
                log::warn!("Failed to decode frame {}: {}", path.display(), e);
                Err(CaptureError::Unavailable)
            }
        }
    }
}

/// Logs every injection instead of performing it
#[derive(Debug, Default)]
pub struct DryRunPort {
    taps: AtomicUsize,
    swipes: AtomicUsize,
}

impl DryRunPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tap_count(&self) -> usize {
        self.taps.load(Ordering::SeqCst)
    }

    pub fn swipe_count(&self) -> usize {
        self.swipes.load(Ordering::SeqCst)
    }
}

impl ActionPort for DryRunPort {
    fn tap(&self, point: Point, duration: Duration) -> bool {
        self.taps.fetch_add(1, Ordering::SeqCst);
        log::info!("[dry-run] tap at {} for {:?}", point, duration);
        true
    }

    fn swipe(&self, path: &[Point], duration: Duration) -> bool {
        self.swipes.fetch_add(1, Ordering::SeqCst);
        log::info!("[dry-run] swipe through {} points over {:?}", path.len(), duration);
        true
    }
}
