//! Reference pattern loading
//!
//! Patterns are named reference images loaded once at startup. The library is
//! immutable afterwards and is shared read-only by every match call.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use image::{GrayImage, RgbImage};

use super::matcher::{downsample, reduction_for};
use super::VisionError;
use crate::config::ConfigurationError;

/// File extensions picked up when scanning a pattern directory
pub const DEFAULT_EXTENSIONS: &[&str] = &["png"];

/// A named reference image
#[derive(Debug, Clone)]
pub struct Pattern {
    name: String,
    image: RgbImage,
    gray: GrayImage,
    /// Downscale factor and downscaled luminance for the coarse search
    reduced: Option<(u32, GrayImage)>,
}

impl Pattern {
    /// Create a pattern from an RGB image
    pub fn new(name: impl Into<String>, image: RgbImage) -> Self {
        let gray = image::imageops::grayscale(&image);
        let reduced = match reduction_for(gray.width(), gray.height()) {
            1 => None,
            factor => Some((factor, downsample(&gray, factor))),
        };
        Self {
            name: name.into(),
            image,
            gray,
            reduced,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Luminance plane used for correlation
    pub fn gray(&self) -> &GrayImage {
        &self.gray
    }

    /// Coarse-search factor and the luminance plane at that scale, if the
    /// pattern is large enough to be searched at reduced resolution
    pub(crate) fn reduced(&self) -> Option<(u32, &GrayImage)> {
        self.reduced.as_ref().map(|(factor, gray)| (*factor, gray))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// A single-intensity pattern carries no structure to correlate against
    pub fn is_flat(&self) -> bool {
        let mut pixels = self.gray.pixels();
        match pixels.next() {
            Some(first) => pixels.all(|p| p == first),
            None => true,
        }
    }
}

/// Immutable set of named patterns
#[derive(Debug, Clone, Default)]
pub struct PatternLibrary {
    patterns: BTreeMap<String, Pattern>,
}

impl PatternLibrary {
    /// Create an empty library
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a library from in-memory images
    pub fn from_images<I, S>(images: I) -> Self
    where
        I: IntoIterator<Item = (S, RgbImage)>,
        S: Into<String>,
    {
        let mut library = Self::new();
        for (name, image) in images {
            library.insert(Pattern::new(name, image));
        }
        library
    }

    /// Load every `.png` in a directory, keyed by file stem
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, VisionError> {
        Self::load_with_extensions(dir, DEFAULT_EXTENSIONS)
    }

    /// Load every file with one of `extensions` in a directory
    pub fn load_with_extensions(
        dir: impl AsRef<Path>,
        extensions: &[&str],
    ) -> Result<Self, VisionError> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir).map_err(|source| VisionError::PatternDirectory {
            path: dir.display().to_string(),
            source,
        })?;

        let mut library = Self::new();
        for entry in entries {
            let entry = entry.map_err(|source| VisionError::PatternDirectory {
                path: dir.display().to_string(),
                source,
            })?;
            let path = entry.path();

            let matches_ext = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)));
            if !path.is_file() || !matches_ext {
                continue;
            }

            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                log::warn!("Skipping pattern with non UTF-8 name: {}", path.display());
                continue;
            };

            let image = image::open(&path).map_err(|source| VisionError::PatternLoad {
                name: name.to_string(),
                source,
            })?;

            log::info!(
                "Loaded pattern '{}' ({}x{})",
                name,
                image.width(),
                image.height()
            );
            library.insert(Pattern::new(name, image.to_rgb8()));
        }

        log::info!("Loaded {} patterns from {}", library.len(), dir.display());
        Ok(library)
    }

    /// Load a directory and fail if any of `required` is absent
    pub fn load_required<S: AsRef<str>>(
        dir: impl AsRef<Path>,
        required: &[S],
    ) -> Result<Self, ConfigurationError> {
        let library = Self::load(dir)?;
        library.ensure_present(required)?;
        Ok(library)
    }

    /// Add or replace a pattern
    pub fn insert(&mut self, pattern: Pattern) {
        self.patterns.insert(pattern.name.clone(), pattern);
    }

    /// Look up a pattern by name
    pub fn get(&self, name: &str) -> Result<&Pattern, VisionError> {
        self.patterns
            .get(name)
            .ok_or_else(|| VisionError::UnknownPattern(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.patterns.contains_key(name)
    }

    /// Pattern names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.patterns.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Report every name in `required` that is not loaded
    pub fn ensure_present<S: AsRef<str>>(&self, required: &[S]) -> Result<(), ConfigurationError> {
        let mut missing: Vec<String> = required
            .iter()
            .map(AsRef::as_ref)
            .filter(|name| !self.contains(name))
            .map(str::to_string)
            .collect();

        if missing.is_empty() {
            return Ok(());
        }

        missing.sort();
        missing.dedup();
        log::error!("Missing required patterns: {}", missing.join(", "));
        Err(ConfigurationError::MissingPatterns(missing))
    }
}
