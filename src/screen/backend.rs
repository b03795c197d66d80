//! Screen source abstraction for the surface a macro is replayed against.
//!
//! This module provides a unified interface for different capture methods:
//! - MockFramebuffer (tests and generated fixtures)
//! - ImageFileScreen (headless runs against a screenshot on disk)
//! - LiveScreen (primary monitor, `live-screen` feature)

use font8x8::{BASIC_FONTS, UnicodeFonts};
use image::{ImageBuffer, RgbImage};
use std::io::Cursor;
use std::path::{Path, PathBuf};

use super::types::{ScreenError, ScreenResult};

/// Result of a capture operation
#[derive(Debug, Clone)]
pub struct CaptureResult {
    /// Captured frame
    pub image: RgbImage,
    /// Optional metadata about the capture
    pub metadata: Option<serde_json::Value>,
}

impl CaptureResult {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Encode the frame as PNG bytes
    pub fn to_png(&self) -> ScreenResult<Vec<u8>> {
        encode_png(&self.image)
    }
}

/// Trait for screen sources
///
/// Implementations provide different methods of obtaining the current frame:
/// - `MockFramebuffer` for testing with programmatic drawing
/// - `ImageFileScreen` for a screenshot file that may be rewritten between captures
/// - `LiveScreen` for the real primary monitor
pub trait ScreenSource {
    /// Capture the current frame
    fn capture(&mut self) -> ScreenResult<CaptureResult>;

    /// Get the source type identifier (e.g., "mock", "file", "monitor")
    fn source_type(&self) -> &str;

    /// Get the current width in pixels
    fn width(&self) -> u32;

    /// Get the current height in pixels
    fn height(&self) -> u32;
}

/// A virtual framebuffer for testing and programmatic drawing
///
/// Provides a drawing API for creating screens and templates:
/// - `fill()` - Fill entire buffer with a color
/// - `draw_rect()` - Draw a filled rectangle
/// - `draw_text()` - Draw text using font8x8 glyphs
/// - `get_pixel()` / `set_pixel()` - Direct pixel access
/// - `crop()` - Cut a region out as a new framebuffer (handy for templates)
#[derive(Debug, Clone)]
pub struct MockFramebuffer {
    /// Width in pixels
    width: u32,
    /// Height in pixels
    height: u32,
    /// RGB pixel buffer (row-major, 3 bytes per pixel)
    buffer: Vec<u8>,
}

/// Bytes in a `width` x `height` RGB buffer, if it fits in `usize`
fn buffer_len(width: u32, height: u32) -> Option<usize> {
    usize::try_from(width)
        .ok()?
        .checked_mul(usize::try_from(height).ok()?)?
        .checked_mul(3)
}

impl MockFramebuffer {
    /// Create a new framebuffer with the given dimensions, initialized to black
    ///
    /// # Panics
    ///
    /// If the buffer size overflows `usize`. Use [`try_with_color`](Self::try_with_color)
    /// for sizes from user input.
    pub fn new(width: u32, height: u32) -> Self {
        let len = buffer_len(width, height)
            .unwrap_or_else(|| panic!("{}x{} framebuffer size overflows usize", width, height));
        Self {
            width,
            height,
            buffer: vec![0u8; len],
        }
    }

    /// Create a framebuffer initialized to a specific color
    pub fn with_color(width: u32, height: u32, color: [u8; 3]) -> Self {
        let mut fb = Self::new(width, height);
        fb.fill(color);
        fb
    }

    /// Like [`with_color`](Self::with_color), failing instead of panicking on oversized dimensions
    pub fn try_with_color(width: u32, height: u32, color: [u8; 3]) -> ScreenResult<Self> {
        let len = buffer_len(width, height).ok_or(ScreenError::TooLarge { width, height })?;
        let mut fb = Self {
            width,
            height,
            buffer: vec![0u8; len],
        };
        fb.fill(color);
        Ok(fb)
    }

    /// Load a framebuffer from PNG image bytes
    pub fn from_png_bytes(data: &[u8]) -> ScreenResult<Self> {
        let rgb = image::load_from_memory(data)?.to_rgb8();
        Ok(Self::from_image(&rgb))
    }

    /// Wrap an existing RGB image
    pub fn from_image(image: &RgbImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            buffer: image.as_raw().clone(),
        }
    }

    /// Fill the entire framebuffer with a color
    pub fn fill(&mut self, color: [u8; 3]) {
        for chunk in self.buffer.chunks_exact_mut(3) {
            chunk.copy_from_slice(&color);
        }
    }

    /// Draw a filled rectangle
    pub fn draw_rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: [u8; 3]) {
        for py in y..(y + h).min(self.height) {
            for px in x..(x + w).min(self.width) {
                self.set_pixel(px, py, color);
            }
        }
    }

    /// Draw text using font8x8 glyphs
    ///
    /// Each character is 8x8 pixels. Text does not wrap.
    pub fn draw_text(&mut self, x: u32, y: u32, text: &str, fg: [u8; 3], bg: [u8; 3]) {
        let mut cursor_x = x;
        for ch in text.chars() {
            self.draw_char(cursor_x, y, ch, fg, bg);
            cursor_x += 8;
            if cursor_x >= self.width {
                break;
            }
        }
    }

    fn draw_char(&mut self, x: u32, y: u32, ch: char, fg: [u8; 3], bg: [u8; 3]) {
        let glyph = BASIC_FONTS.get(ch).unwrap_or([0u8; 8]);
        for (row_idx, row) in glyph.iter().enumerate() {
            let py = y + row_idx as u32;
            if py >= self.height {
                break;
            }
            for bit in 0..8 {
                let px = x + bit;
                if px >= self.width {
                    break;
                }
                // font8x8 stores LSB as leftmost pixel
                let color = if (row >> bit) & 1 == 1 { fg } else { bg };
                self.set_pixel(px, py, color);
            }
        }
    }

    /// Get the color of a pixel
    pub fn get_pixel(&self, x: u32, y: u32) -> [u8; 3] {
        if x >= self.width || y >= self.height {
            return [0, 0, 0];
        }
        let idx = ((y * self.width + x) * 3) as usize;
        [self.buffer[idx], self.buffer[idx + 1], self.buffer[idx + 2]]
    }

    /// Set the color of a pixel
    pub fn set_pixel(&mut self, x: u32, y: u32, color: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = ((y * self.width + x) * 3) as usize;
        self.buffer[idx..idx + 3].copy_from_slice(&color);
    }

    /// Copy a rectangle out of this framebuffer. Pixels outside the buffer read as black.
    pub fn crop(&self, x: u32, y: u32, w: u32, h: u32) -> MockFramebuffer {
        let mut out = MockFramebuffer::new(w, h);
        for py in 0..h {
            for px in 0..w {
                out.set_pixel(px, py, self.get_pixel(x + px, y + py));
            }
        }
        out
    }

    /// Convert to an image buffer
    pub fn to_image(&self) -> RgbImage {
        // Buffer length is fixed at width * height * 3 by every constructor.
        ImageBuffer::from_raw(self.width, self.height, self.buffer.clone())
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }

    /// Encode the framebuffer as PNG bytes
    pub fn to_png(&self) -> ScreenResult<Vec<u8>> {
        encode_png(&self.to_image())
    }

    /// Write the framebuffer as a PNG file
    pub fn save_png(&self, path: impl AsRef<Path>) -> ScreenResult<()> {
        std::fs::write(path, self.to_png()?)?;
        Ok(())
    }
}

impl ScreenSource for MockFramebuffer {
    fn capture(&mut self) -> ScreenResult<CaptureResult> {
        Ok(CaptureResult {
            image: self.to_image(),
            metadata: Some(serde_json::json!({
                "mock": true
            })),
        })
    }

    fn source_type(&self) -> &str {
        "mock"
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }
}

/// Screen backed by an image file, re-read on every capture
///
/// Lets a headless run observe a surface that another process keeps
/// rewriting (e.g. a periodic screenshot dump).
#[derive(Debug, Clone)]
pub struct ImageFileScreen {
    path: PathBuf,
    last_size: (u32, u32),
}

impl ImageFileScreen {
    /// Open a screenshot file; fails if it cannot be decoded now
    pub fn open(path: impl Into<PathBuf>) -> ScreenResult<Self> {
        let path = path.into();
        let image = image::open(&path)?;
        Ok(Self {
            last_size: (image.width(), image.height()),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScreenSource for ImageFileScreen {
    fn capture(&mut self) -> ScreenResult<CaptureResult> {
        let image = image::open(&self.path)
            .map_err(|e| {
                ScreenError::Capture(format!("Failed to read screen {}: {}", self.path.display(), e))
            })?
            .to_rgb8();
        self.last_size = (image.width(), image.height());
        Ok(CaptureResult {
            image,
            metadata: Some(serde_json::json!({
                "file": self.path.display().to_string(),
            })),
        })
    }

    fn source_type(&self) -> &str {
        "file"
    }

    fn width(&self) -> u32 {
        self.last_size.0
    }

    fn height(&self) -> u32 {
        self.last_size.1
    }
}

/// Primary monitor capture
#[cfg(feature = "live-screen")]
pub struct LiveScreen {
    monitor: xcap::Monitor,
    size: (u32, u32),
}

#[cfg(feature = "live-screen")]
impl LiveScreen {
    /// Attach to the primary monitor (or the first one reported)
    pub fn primary() -> ScreenResult<Self> {
        let mut monitors = xcap::Monitor::all()
            .map_err(|e| ScreenError::Capture(format!("Failed to enumerate monitors: {e}")))?;
        if monitors.is_empty() {
            return Err(ScreenError::Capture("No monitor found".to_string()));
        }
        let index = monitors
            .iter()
            .position(|m| m.is_primary().unwrap_or(false))
            .unwrap_or(0);
        let monitor = monitors.swap_remove(index);
        let width = monitor
            .width()
            .map_err(|e| ScreenError::Capture(format!("Failed to get monitor width: {e}")))?;
        let height = monitor
            .height()
            .map_err(|e| ScreenError::Capture(format!("Failed to get monitor height: {e}")))?;
        Ok(Self {
            monitor,
            size: (width, height),
        })
    }
}

#[cfg(feature = "live-screen")]
impl ScreenSource for LiveScreen {
    fn capture(&mut self) -> ScreenResult<CaptureResult> {
        let rgba = self
            .monitor
            .capture_image()
            .map_err(|e| ScreenError::Capture(format!("Failed to capture monitor: {e}")))?;
        let image = image::DynamicImage::ImageRgba8(rgba).to_rgb8();
        self.size = (image.width(), image.height());
        Ok(CaptureResult {
            image,
            metadata: Some(serde_json::json!({ "monitor": true })),
        })
    }

    fn source_type(&self) -> &str {
        "monitor"
    }

    fn width(&self) -> u32 {
        self.size.0
    }

    fn height(&self) -> u32 {
        self.size.1
    }
}

fn encode_png(image: &RgbImage) -> ScreenResult<Vec<u8>> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}
