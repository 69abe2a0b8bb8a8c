//! Human behavior simulation for injected input
//!
//! Adds realistic variance to tap positions and press durations before they
//! reach the underlying action port.

use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::StealthConfig;
use crate::ports::{ActionPort, Point};

/// Shortest press the humanizer will produce
const MIN_PRESS_MS: u64 = 30;

/// Humanizer for generating realistic timing and positions
pub struct Humanizer {
    rng: StdRng,
}

impl Default for Humanizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Humanizer {
    /// Create a humanizer seeded from the OS
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Create a reproducible humanizer
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Humanize a duration with variance
    pub fn humanize_duration(&mut self, base: Duration, variance_percent: u32) -> Duration {
        let base_ms = base.as_millis() as u64;
        if variance_percent == 0 || base_ms == 0 {
            return base;
        }

        let variance = (base_ms as f64 * variance_percent.min(100) as f64 / 100.0) as i64;
        let offset = self.rng.gen_range(-variance..=variance);

        Duration::from_millis((base_ms as i64 + offset).max(MIN_PRESS_MS as i64) as u64)
    }

    /// Humanize tap position with slight offset
    /// Returns (offset_x, offset_y) to add to the target position
    pub fn humanize_position(&mut self, max_offset: i32) -> (i32, i32) {
        if max_offset <= 0 {
            return (0, 0);
        }

        (self.gaussian_offset(max_offset), self.gaussian_offset(max_offset))
    }

    /// Generate gaussian-distributed offset
    fn gaussian_offset(&mut self, max_offset: i32) -> i32 {
        // Sum of uniforms approximates a normal distribution
        let sum: f32 = (0..3).map(|_| self.rng.gen::<f32>() - 0.5).sum();

        ((sum * max_offset as f32 * 0.67) as i32).clamp(-max_offset, max_offset)
    }
}

/// Action port decorator that jitters taps before forwarding them
pub struct HumanizedPort<P> {
    inner: P,
    config: StealthConfig,
    humanizer: Mutex<Humanizer>,
}

impl<P: ActionPort> HumanizedPort<P> {
    pub fn new(inner: P, config: StealthConfig) -> Self {
        let humanizer = match config.seed {
            Some(seed) => Humanizer::with_seed(seed),
            None => Humanizer::new(),
        };

        Self {
            inner,
            config,
            humanizer: Mutex::new(humanizer),
        }
    }

    /// The wrapped port
    pub fn inner(&self) -> &P {
        &self.inner
    }

    fn adjust(&self, point: Point, duration: Duration) -> (Point, Duration) {
        let mut humanizer = match self.humanizer.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };

        let point = if self.config.humanize_position {
            let (dx, dy) = humanizer.humanize_position(self.config.position_offset_max);
            point.offset(dx, dy)
        } else {
            point
        };

        let duration = if self.config.humanize_duration {
            humanizer.humanize_duration(duration, self.config.duration_variance_percent)
        } else {
            duration
        };

        (point, duration)
    }
}

impl<P: ActionPort> ActionPort for HumanizedPort<P> {
    fn tap(&self, point: Point, duration: Duration) -> bool {
        let (adjusted, duration) = self.adjust(point, duration);
        log::debug!("Humanized tap {} -> {}", point, adjusted);
        self.inner.tap(adjusted, duration)
    }

    fn swipe(&self, path: &[Point], duration: Duration) -> bool {
        let Some((&first, rest)) = path.split_first() else {
            return self.inner.swipe(path, duration);
        };

        // Only the touch-down point moves; the rest of the gesture keeps its shape
        let (start, duration) = self.adjust(first, duration);
        let (dx, dy) = (start.x - first.x, start.y - first.y);
        let shifted: Vec<Point> = std::iter::once(start)
            .chain(rest.iter().map(|p| p.offset(dx, dy)))
            .collect();

        self.inner.swipe(&shifted, duration)
    }
}
