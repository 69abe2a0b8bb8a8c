//! Template matching
//!
//! Scores reference patterns against a frame with zero-mean normalized
//! cross-correlation, so confidences of different patterns taken against the
//! same frame are directly comparable.
//!
//! Large searches run coarse-to-fine: frame and pattern are box-downsampled,
//! the strongest coarse peaks are located, and each peak is rescored with
//! exact NCC at native resolution in a small window around it. Reported
//! confidences always come from the native-resolution pass.

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::definitions::Image;
use imageproc::integral_image::{integral_image, integral_squared_image};
use imageproc::template_matching::{match_template, MatchTemplateMethod};
use serde::{Deserialize, Serialize};

use super::frame::{Frame, Region};
use super::patterns::{Pattern, PatternLibrary};
use super::VisionError;
use crate::ports::Point;

/// Largest downscale factor used for the coarse search
const MAX_REDUCTION: u32 = 4;

/// Smallest pattern side still searched at a reduced scale
const MIN_REDUCED_SIDE: u32 = 8;

/// Placements times pattern pixels below which the search stays exact
const EXACT_SEARCH_BUDGET: u64 = 1 << 24;

/// Coarse peaks rescored at native resolution
const COARSE_PEAKS: usize = 5;

/// Best location of one pattern in one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub pattern_name: String,
    /// Similarity in [0, 1]
    pub confidence: f32,
    pub center: Point,
    pub top_left: Point,
    /// Exclusive corner
    pub bottom_right: Point,
}

impl MatchResult {
    /// Bounding region of the match
    pub fn region(&self) -> Region {
        Region::new(
            self.top_left.x.max(0) as u32,
            self.top_left.y.max(0) as u32,
            (self.bottom_right.x - self.top_left.x).max(0) as u32,
            (self.bottom_right.y - self.top_left.y).max(0) as u32,
        )
    }
}

/// Pick the highest confidence strictly above `min_confidence`.
///
/// Equal scores keep the earliest result, so declaration order decides ties.
pub fn best_of<I>(results: I, min_confidence: f32) -> Option<MatchResult>
where
    I: IntoIterator<Item = MatchResult>,
{
    let mut best: Option<MatchResult> = None;

    for result in results {
        if result.confidence <= min_confidence {
            continue;
        }
        match &best {
            None => best = Some(result),
            Some(current) if result.confidence > current.confidence => best = Some(result),
            Some(current) if result.confidence == current.confidence => {
                log::warn!(
                    "Tie at confidence {:.3} between '{}' and '{}', keeping '{}'",
                    result.confidence,
                    current.pattern_name,
                    result.pattern_name,
                    current.pattern_name
                );
            }
            Some(_) => {}
        }
    }

    best
}

/// Matches library patterns against frames
pub struct Matcher<'a> {
    library: &'a PatternLibrary,
}

impl<'a> Matcher<'a> {
    pub fn new(library: &'a PatternLibrary) -> Self {
        Self { library }
    }

    /// Best location of `name` anywhere in the frame, regardless of threshold
    pub fn score(&self, frame: &Frame, name: &str) -> Result<MatchResult, VisionError> {
        self.score_planes(&mut Planes::new(luminance(frame)), name)
    }

    /// `match(frame, pattern, min_confidence)`: `None` unless the best score
    /// is strictly above the threshold
    pub fn match_pattern(
        &self,
        frame: &Frame,
        name: &str,
        min_confidence: f32,
    ) -> Result<Option<MatchResult>, VisionError> {
        let result = self.score(frame, name)?;
        log::debug!("Pattern '{}' scored {:.3}", name, result.confidence);
        Ok((result.confidence > min_confidence).then_some(result))
    }

    /// Evaluate every candidate on the same frame and return the winner
    pub fn match_best_of<S: AsRef<str>>(
        &self,
        frame: &Frame,
        candidates: &[S],
        min_confidence: f32,
    ) -> Result<Option<MatchResult>, VisionError> {
        let mut planes = Planes::new(luminance(frame));
        let mut scored = Vec::with_capacity(candidates.len());

        for name in candidates {
            let result = self.score_planes(&mut planes, name.as_ref())?;
            log::debug!(
                "Candidate '{}' scored {:.3}",
                result.pattern_name,
                result.confidence
            );
            scored.push(result);
        }

        Ok(best_of(scored, min_confidence))
    }

    /// First candidate in declaration order that clears the threshold
    pub fn match_first<S: AsRef<str>>(
        &self,
        frame: &Frame,
        candidates: &[S],
        min_confidence: f32,
    ) -> Result<Option<MatchResult>, VisionError> {
        let mut planes = Planes::new(luminance(frame));

        for name in candidates {
            let result = self.score_planes(&mut planes, name.as_ref())?;
            if result.confidence > min_confidence {
                return Ok(Some(result));
            }
            log::debug!(
                "Candidate '{}' below threshold ({:.3})",
                result.pattern_name,
                result.confidence
            );
        }

        Ok(None)
    }

    /// Every candidate must match in the same frame.
    ///
    /// With `nested`, candidates after the first are searched only inside the
    /// region matched by the first one.
    pub fn match_all<S: AsRef<str>>(
        &self,
        frame: &Frame,
        candidates: &[S],
        min_confidence: f32,
        nested: bool,
    ) -> Result<Option<Vec<MatchResult>>, VisionError> {
        let mut planes = Planes::new(luminance(frame));
        let mut matches: Vec<MatchResult> = Vec::with_capacity(candidates.len());

        for name in candidates {
            let name = name.as_ref();
            let result = match matches.first() {
                Some(container) if nested => {
                    self.score_gray_in(&planes.full, name, container.region())?
                }
                _ => Some(self.score_planes(&mut planes, name)?),
            };

            match result {
                Some(result) if result.confidence > min_confidence => matches.push(result),
                _ => {
                    log::debug!("Required candidate '{}' not present", name);
                    return Ok(None);
                }
            }
        }

        Ok(Some(matches))
    }

    /// Best location of `name` inside `region`, or `None` when the region
    /// cannot hold the pattern
    pub fn score_in(
        &self,
        frame: &Frame,
        name: &str,
        region: Region,
    ) -> Result<Option<MatchResult>, VisionError> {
        self.score_gray_in(&luminance(frame), name, region)
    }

    fn score_planes(&self, planes: &mut Planes, name: &str) -> Result<MatchResult, VisionError> {
        let pattern = self.library.get(name)?;
        check_fits(pattern, &planes.full)?;
        locate(planes, pattern, (0, 0)).ok_or_else(|| VisionError::FlatPattern(name.to_string()))
    }

    fn score_gray_in(
        &self,
        gray: &GrayImage,
        name: &str,
        region: Region,
    ) -> Result<Option<MatchResult>, VisionError> {
        let pattern = self.library.get(name)?;
        if !region.fits_within(gray.width(), gray.height())
            || pattern.width() > region.width
            || pattern.height() > region.height
        {
            return Ok(None);
        }

        let sub = image::imageops::crop_imm(gray, region.x, region.y, region.width, region.height)
            .to_image();
        locate(&mut Planes::new(sub), pattern, (region.x, region.y))
            .map(Some)
            .ok_or_else(|| VisionError::FlatPattern(name.to_string()))
    }
}

/// Luminance of one frame plus the downsampled copies built for it so far
struct Planes {
    full: GrayImage,
    reduced: Vec<(u32, GrayImage)>,
}

impl Planes {
    fn new(full: GrayImage) -> Self {
        Self {
            full,
            reduced: Vec::new(),
        }
    }

    fn prepare(&mut self, factor: u32) {
        if self.reduced(factor).is_none() {
            let plane = downsample(&self.full, factor);
            self.reduced.push((factor, plane));
        }
    }

    fn reduced(&self, factor: u32) -> Option<&GrayImage> {
        self.reduced
            .iter()
            .find(|(f, _)| *f == factor)
            .map(|(_, plane)| plane)
    }
}

fn luminance(frame: &Frame) -> GrayImage {
    image::imageops::grayscale(frame.image())
}

fn check_fits(pattern: &Pattern, gray: &GrayImage) -> Result<(), VisionError> {
    if pattern.width() > gray.width() || pattern.height() > gray.height() {
        return Err(VisionError::PatternLargerThanFrame {
            name: pattern.name().to_string(),
            pattern: (pattern.width(), pattern.height()),
            frame: gray.dimensions(),
        });
    }
    Ok(())
}

/// Downscale factor for the coarse search of a `width` x `height` pattern
pub(crate) fn reduction_for(width: u32, height: u32) -> u32 {
    let side = width.min(height);
    let mut factor = MAX_REDUCTION;
    while factor > 1 && side / factor < MIN_REDUCED_SIDE {
        factor /= 2;
    }
    factor
}

/// Area-average `gray` by an integer `factor`.
///
/// The right and bottom remainders are dropped so that coarse pixel `(x, y)`
/// covers exactly native pixels `[x * factor, (x + 1) * factor)`.
pub(crate) fn downsample(gray: &GrayImage, factor: u32) -> GrayImage {
    let width = (gray.width() / factor).max(1);
    let height = (gray.height() / factor).max(1);
    let trimmed = image::imageops::crop_imm(
        gray,
        0,
        0,
        (width * factor).min(gray.width()),
        (height * factor).min(gray.height()),
    )
    .to_image();
    image::imageops::thumbnail(&trimmed, width, height)
}

/// Best placement of `pattern` in `planes`, offset into frame coordinates.
///
/// Returns `None` for a pattern with no intensity variance.
fn locate(planes: &mut Planes, pattern: &Pattern, offset: (u32, u32)) -> Option<MatchResult> {
    let template = pattern.gray();
    let (tw, th) = template.dimensions();
    let (fw, fh) = planes.full.dimensions();
    let cost = u64::from(fw - tw + 1) * u64::from(fh - th + 1) * u64::from(tw * th);

    let (score, x, y) = match pattern.reduced() {
        Some((factor, coarse)) if cost > EXACT_SEARCH_BUDGET => {
            coarse_to_fine(planes, template, factor, coarse)?
        }
        _ => exact(&planes.full, template)?,
    };

    let left = (x + offset.0) as i32;
    let top = (y + offset.1) as i32;
    Some(MatchResult {
        pattern_name: pattern.name().to_string(),
        confidence: score,
        center: Point::new(left + (tw / 2) as i32, top + (th / 2) as i32),
        top_left: Point::new(left, top),
        bottom_right: Point::new(left + tw as i32, top + th as i32),
    })
}

/// Exhaustive native-resolution search
fn exact(gray: &GrayImage, template: &GrayImage) -> Option<(f32, u32, u32)> {
    ncc_scores(gray, template).map(|scores| peak(&scores))
}

/// Search the reduced planes, then rescore the strongest coarse peaks with
/// exact NCC in a window of `2 * factor` pixels around each.
fn coarse_to_fine(
    planes: &mut Planes,
    template: &GrayImage,
    factor: u32,
    coarse_template: &GrayImage,
) -> Option<(f32, u32, u32)> {
    planes.prepare(factor);
    let coarse_scores = planes
        .reduced(factor)
        .filter(|frame| {
            coarse_template.width() <= frame.width() && coarse_template.height() <= frame.height()
        })
        .and_then(|frame| ncc_scores(frame, coarse_template));
    let Some(coarse_scores) = coarse_scores else {
        return exact(&planes.full, template);
    };

    let full = &planes.full;
    let (tw, th) = template.dimensions();
    let radius = factor * 2;
    let spacing = (coarse_template.width() / 2, coarse_template.height() / 2);
    let mut best: Option<(f32, u32, u32)> = None;

    for (cx, cy) in peaks(&coarse_scores, COARSE_PEAKS, spacing) {
        let left = (cx * factor).saturating_sub(radius);
        let top = (cy * factor).saturating_sub(radius);
        let right = (cx * factor + radius + tw).min(full.width());
        let bottom = (cy * factor + radius + th).min(full.height());
        if right - left < tw || bottom - top < th {
            continue;
        }

        let window =
            image::imageops::crop_imm(full, left, top, right - left, bottom - top).to_image();
        let (score, x, y) = exact(&window, template)?;
        let candidate = (score, x + left, y + top);

        best = match best {
            Some(current) if !outranks(candidate, current) => Some(current),
            _ => Some(candidate),
        };
    }

    best
}

/// Higher score wins; equal scores go to the earlier position in raster order
fn outranks(a: (f32, u32, u32), b: (f32, u32, u32)) -> bool {
    a.0 > b.0 || (a.0 == b.0 && (a.2, a.1) < (b.2, b.1))
}

/// Zero-mean normalized cross-correlation of every placement of `template`
/// over `gray`.
///
/// Returns `None` for a template with no intensity variance. Windows with no
/// variance score zero. Scores are clamped to [0, 1].
fn ncc_scores(gray: &GrayImage, template: &GrayImage) -> Option<Image<Luma<f32>>> {
    let (tw, th) = template.dimensions();
    let (fw, fh) = gray.dimensions();
    let n = f64::from(tw * th);

    let t_mean = template.pixels().map(|p| f64::from(p.0[0])).sum::<f64>() / n;
    let t_var: f64 = template
        .pixels()
        .map(|p| {
            let d = f64::from(p.0[0]) - t_mean;
            d * d
        })
        .sum();
    if t_var <= f64::EPSILON {
        return None;
    }

    let cross = match_template(gray, template, MatchTemplateMethod::CrossCorrelation);
    let sums: Image<Luma<u64>> = integral_image::<_, u64>(gray);
    let squares: Image<Luma<u64>> = integral_squared_image::<_, u64>(gray);

    Some(ImageBuffer::from_fn(fw - tw + 1, fh - th + 1, |x, y| {
        let s1 = window_sum(&sums, x, y, tw, th) as f64;
        let s2 = window_sum(&squares, x, y, tw, th) as f64;
        let w_var = s2 - s1 * s1 / n;

        let score = if w_var <= f64::EPSILON {
            0.0
        } else {
            let numerator = f64::from(cross.get_pixel(x, y).0[0]) - s1 * t_mean;
            (numerator / (w_var * t_var).sqrt()).clamp(0.0, 1.0)
        };
        Luma([score as f32])
    }))
}

/// Highest score, first in raster order among equals
fn peak(scores: &Image<Luma<f32>>) -> (f32, u32, u32) {
    let mut best = (f32::MIN, 0, 0);
    for (x, y, p) in scores.enumerate_pixels() {
        if p.0[0] > best.0 {
            best = (p.0[0], x, y);
        }
    }
    best
}

/// Up to `count` strongest positions, each at least `spacing` away from the
/// stronger ones already taken
fn peaks(scores: &Image<Luma<f32>>, count: usize, spacing: (u32, u32)) -> Vec<(u32, u32)> {
    let mut ranked: Vec<(u32, u32, f32)> = scores
        .enumerate_pixels()
        .map(|(x, y, p)| (x, y, p.0[0]))
        .collect();
    ranked.sort_by(|a, b| b.2.total_cmp(&a.2));

    let mut picked: Vec<(u32, u32)> = Vec::with_capacity(count);
    for (x, y, _) in ranked {
        if picked.len() == count {
            break;
        }
        let isolated = picked
            .iter()
            .all(|&(px, py)| px.abs_diff(x) > spacing.0 || py.abs_diff(y) > spacing.1);
        if isolated {
            picked.push((x, y));
        }
    }
    picked
}

/// Sum of a `w` x `h` window from a zero-padded integral image
fn window_sum(integral: &Image<Luma<u64>>, x: u32, y: u32, w: u32, h: u32) -> u64 {
    let at = |px: u32, py: u32| integral.get_pixel(px, py).0[0];
    (at(x + w, y + h) + at(x, y)) - (at(x, y + h) + at(x + w, y))
}
