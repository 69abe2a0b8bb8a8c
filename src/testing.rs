//! Test fixtures: synthetic images and scripted collaborators

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::engine::Clock;
use crate::ports::{ActionPort, CaptureError, FrameSource, Point};
use crate::vision::Frame;

/// Reproducible random texture; distinct seeds give uncorrelated patterns
pub fn noise(width: u32, height: u32, seed: u64) -> RgbImage {
    let mut rng = StdRng::seed_from_u64(seed);
    RgbImage::from_fn(width, height, |_, _| Rgb([rng.gen(), rng.gen(), rng.gen()]))
}

/// A frame on a flat gray background with `patches` pasted at their offsets
pub fn scene(width: u32, height: u32, patches: &[(&RgbImage, u32, u32)]) -> Frame {
    let mut canvas = RgbImage::from_pixel(width, height, Rgb([128, 128, 128]));
    for (patch, x, y) in patches {
        image::imageops::replace(&mut canvas, *patch, i64::from(*x), i64::from(*y));
    }
    Frame::new(canvas)
}

/// Serves a fixed script of capture results, repeating the last one
pub struct ScriptedSource {
    script: Vec<Result<Frame, CaptureError>>,
    captures: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(script: Vec<Result<Frame, CaptureError>>) -> Self {
        Self {
            script,
            captures: AtomicUsize::new(0),
        }
    }

    /// Number of captures requested so far
    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

impl FrameSource for ScriptedSource {
    fn capture_frame(&self) -> Result<Frame, CaptureError> {
        let index = self.captures.fetch_add(1, Ordering::SeqCst);
        match self.script.len() {
            0 => Err(CaptureError::Unavailable),
            len => self.script[index.min(len - 1)].clone(),
        }
    }
}

/// Records every gesture it is asked to perform
#[derive(Default)]
pub struct RecordingPort {
    presses: Mutex<Vec<(Point, Duration)>>,
    swipes: Mutex<Vec<Vec<Point>>>,
    fail: bool,
}

impl RecordingPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records gestures but reports every one as undelivered
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn taps(&self) -> Vec<Point> {
        self.presses().into_iter().map(|(point, _)| point).collect()
    }

    pub fn presses(&self) -> Vec<(Point, Duration)> {
        self.presses.lock().unwrap().clone()
    }

    pub fn swipes(&self) -> Vec<Vec<Point>> {
        self.swipes.lock().unwrap().clone()
    }
}

impl ActionPort for RecordingPort {
    fn tap(&self, point: Point, duration: Duration) -> bool {
        self.presses.lock().unwrap().push((point, duration));
        !self.fail
    }

    fn swipe(&self, path: &[Point], _duration: Duration) -> bool {
        self.swipes.lock().unwrap().push(path.to_vec());
        !self.fail
    }
}

/// Virtual clock: `sleep` advances time instantly. Clones share the time.
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elapsed(&self) -> Duration {
        *self.now.lock().unwrap()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        *self.now.lock().unwrap() += duration;
    }
}
