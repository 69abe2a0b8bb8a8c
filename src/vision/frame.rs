//! Captured frames
//!
//! A `Frame` is one immutable snapshot of the target's screen. Frames are
//! produced by a capture collaborator and consumed by a single step attempt.

use std::time::Instant;

use image::{ImageBuffer, RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};

use super::VisionError;
use crate::ports::Point;

/// A single captured screen image
#[derive(Debug, Clone)]
pub struct Frame {
    image: RgbImage,
    captured_at: Instant,
}

impl Frame {
    /// Wrap an already decoded RGB image
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            captured_at: Instant::now(),
        }
    }

    /// Build a frame from raw RGBA bytes (the Android capture format)
    pub fn from_rgba(data: &[u8], width: u32, height: u32) -> Result<Self, VisionError> {
        check_len(data, width, height, 4)?;

        let rgba: RgbaImage = ImageBuffer::from_raw(width, height, data.to_vec())
            .ok_or(VisionError::InvalidFrameData)?;

        Ok(Self::new(image::DynamicImage::ImageRgba8(rgba).to_rgb8()))
    }

    /// Build a frame from raw RGB bytes
    pub fn from_rgb(data: &[u8], width: u32, height: u32) -> Result<Self, VisionError> {
        check_len(data, width, height, 3)?;

        let rgb: RgbImage = ImageBuffer::from_raw(width, height, data.to_vec())
            .ok_or(VisionError::InvalidFrameData)?;

        Ok(Self::new(rgb))
    }

    /// Build a frame from raw BGR bytes (desktop capture backends)
    pub fn from_bgr(data: &[u8], width: u32, height: u32) -> Result<Self, VisionError> {
        check_len(data, width, height, 3)?;

        let swapped: Vec<u8> = data
            .chunks_exact(3)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect();

        Self::from_rgb(&swapped, width, height)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Pixel data
    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// When the frame was produced
    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Copy out a rectangular region, or `None` if it leaves the frame
    pub fn region(&self, region: Region) -> Option<RgbImage> {
        if !region.fits_within(self.width(), self.height()) {
            return None;
        }

        let sub = image::imageops::crop_imm(
            &self.image,
            region.x,
            region.y,
            region.width,
            region.height,
        );
        Some(sub.to_image())
    }
}

fn check_len(data: &[u8], width: u32, height: u32, channels: usize) -> Result<(), VisionError> {
    let expected = width as usize * height as usize * channels;
    if width == 0 || height == 0 || data.len() != expected {
        return Err(VisionError::InvalidFrameData);
    }
    Ok(())
}

/// Axis-aligned rectangle in frame coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Center point (integer division, like the matched-center convention)
    pub fn center(&self) -> Point {
        Point::new(
            (self.x + self.width / 2) as i32,
            (self.y + self.height / 2) as i32,
        )
    }

    /// Whether a point lies inside the region
    pub fn contains(&self, point: Point) -> bool {
        let (x, y) = (point.x as i64, point.y as i64);
        x >= self.x as i64
            && y >= self.y as i64
            && x < (self.x + self.width) as i64
            && y < (self.y + self.height) as i64
    }

    /// Whether the region lies entirely inside a `width` x `height` surface
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.x.saturating_add(self.width) <= width
            && self.y.saturating_add(self.height) <= height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_from_rgba() {
        let width = 10u32;
        let height = 10u32;
        let data = vec![255u8; (width * height * 4) as usize];

        let frame = Frame::from_rgba(&data, width, height).unwrap();
        assert_eq!(frame.dimensions(), (width, height));
        assert_eq!(frame.image().get_pixel(3, 3).0, [255, 255, 255]);
    }

    #[test]
    fn test_invalid_frame_data() {
        let data = vec![255u8; 100];
        assert!(matches!(
            Frame::from_rgba(&data, 10, 10),
            Err(VisionError::InvalidFrameData)
        ));
        assert!(Frame::from_rgb(&[], 0, 0).is_err());
    }

    #[test]
    fn test_bgr_channels_swapped() {
        let data = [1u8, 2, 3, 4, 5, 6];
        let frame = Frame::from_bgr(&data, 2, 1).unwrap();
        assert_eq!(frame.image().get_pixel(0, 0).0, [3, 2, 1]);
        assert_eq!(frame.image().get_pixel(1, 0).0, [6, 5, 4]);
    }

    #[test]
    fn test_region_extraction_bounds() {
        let frame = Frame::new(RgbImage::new(20, 10));
        assert!(frame.region(Region::new(5, 5, 10, 5)).is_some());
        assert!(frame.region(Region::new(15, 0, 10, 5)).is_none());
        assert!(frame.region(Region::new(0, 0, 0, 5)).is_none());
    }

    #[test]
    fn test_region_contains_and_center() {
        let region = Region::new(10, 20, 30, 40);
        assert_eq!(region.center(), Point::new(25, 40));
        assert!(region.contains(Point::new(10, 20)));
        assert!(region.contains(Point::new(39, 59)));
        assert!(!region.contains(Point::new(40, 20)));
        assert!(!region.contains(Point::new(-1, 25)));
    }
}
