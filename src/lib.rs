//! Frame Pilot - perception-action automation for touch-screen apps
//!
//! This library drives an app by looking at its screen: each step of a
//! declarative step graph captures a frame, matches reference patterns
//! against it, and injects taps or swipes on whatever it found.
//!
//! ## Layout
//!
//! - `vision`: frames, the pattern library and template matching
//! - `engine`: steps, step graphs, the drive loop and the run controller
//! - `ports`: capture and input interfaces plus desktop replay adapters
//! - `stealth`: humanized input decorator
//! - `android`: JNI exports for the Android accessibility service

pub mod android;
pub mod config;
pub mod engine;
pub mod ports;
pub mod stealth;
pub mod vision;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::android::{FrameSlot, GestureQueue, GESTURE_QUEUE_CAPACITY};
use crate::config::{ConfigurationError, Settings};
use crate::engine::RunController;
use crate::stealth::HumanizedPort;
use crate::vision::PatternLibrary;

/// Engine wired to the push/poll device adapters
pub struct Pilot {
    pub controller: RunController,
    pub frames: Arc<FrameSlot>,
    pub gestures: Arc<GestureQueue>,
    pub settings: Settings,
}

impl Pilot {
    /// Build a pilot around an already loaded pattern library
    pub fn new(settings: Settings, library: PatternLibrary) -> Self {
        let frames = Arc::new(FrameSlot::new(settings.engine.capture_timeout()));
        let gestures = Arc::new(
            GestureQueue::new(GESTURE_QUEUE_CAPACITY, settings.engine.gesture_timeout())
                .with_frames(Arc::clone(&frames)),
        );
        let port = HumanizedPort::new(Arc::clone(&gestures), settings.stealth.clone());

        let controller = RunController::new(
            Arc::new(library),
            frames.clone(),
            Arc::new(port),
            settings.engine.clone(),
        );

        Self {
            controller,
            frames,
            gestures,
            settings,
        }
    }

    /// Load patterns from the configured directory and build a pilot
    pub fn load(settings: Settings) -> Result<Self, ConfigurationError> {
        let library = PatternLibrary::load_with_extensions(
            &settings.patterns.directory,
            &settings.patterns.extension_refs(),
        )?;
        Ok(Self::new(settings, library))
    }
}

/// Global pilot instance for JNI access
static PILOT_INSTANCE: OnceCell<Pilot> = OnceCell::new();

/// Initialize the global pilot. Later calls keep the first instance.
pub fn init_pilot(pilot: Pilot) -> &'static Pilot {
    PILOT_INSTANCE.get_or_init(|| pilot)
}

/// Get a reference to the global pilot instance
pub fn get_pilot() -> Option<&'static Pilot> {
    PILOT_INSTANCE.get()
}
