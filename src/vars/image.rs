//! Image buffers held in image-valued variable slots.

use std::io::Cursor;
use std::sync::Arc;

use image::imageops::FilterType;
use image::{ImageFormat, RgbaImage};

/// Largest width or height a resize may target.
pub const MAX_DIMENSION: u32 = 16_384;

/// An immutable RGBA8 image. Clones share the pixel buffer; every mutation
/// produces a new image, so a copy between slots behaves as a duplicate.
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    width: u32,
    height: u32,
    pixels: Arc<[u8]>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl Image {
    /// Wrap raw RGBA8 pixels. Returns `None` when the buffer length does not
    /// match the dimensions.
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        if width == 0 || height == 0 || pixels.len() != (width as usize) * (height as usize) * 4 {
            return None;
        }
        Some(Self {
            width,
            height,
            pixels: pixels.into(),
        })
    }

    /// A single-colour image.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        let pixels: Vec<u8> = rgba
            .iter()
            .copied()
            .cycle()
            .take((width as usize) * (height as usize) * 4)
            .collect();
        Self {
            width,
            height,
            pixels: pixels.into(),
        }
    }

    /// Decode a PNG (or any format the `image` crate sniffs).
    pub fn decode(bytes: &[u8]) -> Result<Self, image::ImageError> {
        let decoded = image::load_from_memory(bytes)?.to_rgba8();
        let (width, height) = decoded.dimensions();
        Ok(Self {
            width,
            height,
            pixels: decoded.into_raw().into(),
        })
    }

    /// Encode as PNG.
    pub fn encode_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut out = Cursor::new(Vec::new());
        self.to_rgba_image().write_to(&mut out, ImageFormat::Png)?;
        Ok(out.into_inner())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// True when every pixel has zero alpha.
    pub fn is_fully_transparent(&self) -> bool {
        self.pixels.chunks_exact(4).all(|px| px[3] == 0)
    }

    /// Resize to `width` x `height`. With `aspect_correct`, the result fits
    /// inside the box while keeping the source aspect ratio.
    pub fn resized(&self, width: u32, height: u32, aspect_correct: bool) -> Self {
        let (target_w, target_h) = if aspect_correct {
            fit_within(self.width, self.height, width, height)
        } else {
            (width.max(1), height.max(1))
        };

        if target_w == self.width && target_h == self.height {
            return self.clone();
        }

        let resized = image::imageops::resize(
            &self.to_rgba_image(),
            target_w,
            target_h,
            FilterType::Lanczos3,
        );
        Self {
            width: target_w,
            height: target_h,
            pixels: resized.into_raw().into(),
        }
    }

    /// Whether the image exceeds the box in either dimension.
    pub fn is_larger_than(&self, width: u32, height: u32) -> bool {
        self.width > width || self.height > height
    }

    fn to_rgba_image(&self) -> RgbaImage {
        // Dimensions are validated at construction, so this cannot fail.
        RgbaImage::from_raw(self.width, self.height, self.pixels.to_vec())
            .unwrap_or_else(|| RgbaImage::new(self.width, self.height))
    }
}

/// Largest size with the source aspect ratio that fits inside `max_w` x `max_h`.
fn fit_within(src_w: u32, src_h: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    let scale = f64::min(max_w as f64 / src_w as f64, max_h as f64 / src_h as f64);
    let w = ((src_w as f64) * scale).round().max(1.0) as u32;
    let h = ((src_h as f64) * scale).round().max(1.0) as u32;
    (w, h)
}
