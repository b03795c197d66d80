// Core geometry and error types for screen capture and matching

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A point in screen pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// An axis-aligned rectangle in screen pixels
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

    /// Geometric centre, rounded towards the top-left
    pub fn center(&self) -> Point {
        Point::new(
            (self.x + self.width / 2) as i32,
            (self.y + self.height / 2) as i32,
        )
    }

    /// Clip this region to a frame of the given size. Returns `None` if nothing is left.
    pub fn clip_to(&self, frame_width: u32, frame_height: u32) -> Option<Region> {
        if self.x >= frame_width || self.y >= frame_height {
            return None;
        }
        let width = self.width.min(frame_width - self.x);
        let height = self.height.min(frame_height - self.y);
        if width == 0 || height == 0 {
            return None;
        }
        Some(Region::new(self.x, self.y, width, height))
    }
}

/// Outcome of a successful template match
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Matched area, in full-frame coordinates
    pub region: Region,

    /// Correlation score in `[0, 1]`
    pub confidence: f64,

    /// Centre of `region`
    pub center: Point,
}

/// Result type for screen operations
pub type ScreenResult<T> = Result<T, ScreenError>;

/// Error types for screen operations
#[derive(Debug, Error)]
pub enum ScreenError {
    /// The screen surface could not be captured
    #[error("Capture error: {0}")]
    Capture(String),

    /// Requested buffer dimensions do not fit in memory
    #[error("Framebuffer {width}x{height} is too large")]
    TooLarge { width: u32, height: u32 },

    /// Image data could not be decoded or encoded
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_center() {
        assert_eq!(Region::new(10, 20, 30, 40).center(), Point::new(25, 40));
        assert_eq!(Region::new(0, 0, 5, 5).center(), Point::new(2, 2));
    }

    #[test]
    fn test_region_clip() {
        let region = Region::new(90, 90, 50, 50);
        assert_eq!(region.clip_to(100, 100), Some(Region::new(90, 90, 10, 10)));
        assert_eq!(Region::new(100, 0, 5, 5).clip_to(100, 100), None);
        assert_eq!(Region::new(0, 0, 0, 5).clip_to(100, 100), None);
    }
}
