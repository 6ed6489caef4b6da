//! Input Normalizer
//!
//! Turns a raw pixel buffer into the row-major `[0, 1]` vector the input layer
//! expects. Multi-channel pixels collapse to Rec.601 luma; alpha is ignored.
//! With the default [`Polarity::Direct`], white maps to 1.0 and black to 0.0.

use crate::error::{NetworkError, Result};
use crate::topology::INPUT_SIZE;

/// Memory layout of one pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Gray8,
    /// 16-bit little-endian gray.
    Gray16,
    Bgr24,
    Rgb24,
    Bgra32,
    Rgba32,
}

impl PixelFormat {
    /// Default format for a pixel stride: 1 → Gray8, 2 → Gray16, 3 → Bgr24, 4 → Bgra32.
    pub fn from_stride(bytes_per_pixel: usize) -> Result<Self> {
        match bytes_per_pixel {
            1 => Ok(PixelFormat::Gray8),
            2 => Ok(PixelFormat::Gray16),
            3 => Ok(PixelFormat::Bgr24),
            4 => Ok(PixelFormat::Bgra32),
            other => Err(NetworkError::UnsupportedFormat(format!(
                "{} bytes per pixel",
                other
            ))),
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Gray16 => 2,
            PixelFormat::Bgr24 | PixelFormat::Rgb24 => 3,
            PixelFormat::Bgra32 | PixelFormat::Rgba32 => 4,
        }
    }

    /// Intensity of one pixel in [0, 1].
    fn intensity(self, px: &[u8]) -> f32 {
        match self {
            PixelFormat::Gray8 => px[0] as f32 / 255.0,
            PixelFormat::Gray16 => u16::from_le_bytes([px[0], px[1]]) as f32 / 65535.0,
            PixelFormat::Bgr24 | PixelFormat::Bgra32 => luma(px[2], px[1], px[0]),
            PixelFormat::Rgb24 | PixelFormat::Rgba32 => luma(px[0], px[1], px[2]),
        }
    }
}

// Integer weights keep pure white at exactly 1.0.
fn luma(r: u8, g: u8, b: u8) -> f32 {
    let weighted = 299 * r as u32 + 587 * g as u32 + 114 * b as u32;
    weighted as f32 / 255_000.0
}

/// Which end of the intensity scale counts as ink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Polarity {
    /// White → 1.0, black → 0.0 (light ink on a dark canvas, as in MNIST).
    #[default]
    Direct,
    /// White → 0.0, black → 1.0 (dark ink on a light canvas).
    Inverted,
}

/// Geometry of a raw image buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    pub format: PixelFormat,
    pub width: usize,
    pub height: usize,
    /// Bytes from the start of one row to the next.
    pub row_stride: usize,
}

impl ImageLayout {
    /// Rows without padding.
    pub fn packed(format: PixelFormat, width: usize, height: usize) -> Result<Self> {
        let row_stride = width
            .checked_mul(format.bytes_per_pixel())
            .ok_or_else(|| too_large(width, height))?;
        Ok(Self {
            format,
            width,
            height,
            row_stride,
        })
    }

    /// Bytes in one row of pixels, and from the first pixel to the end of the last row.
    fn span(&self) -> Result<(usize, usize)> {
        let overflow = || too_large(self.width, self.height);
        let row_bytes = self
            .width
            .checked_mul(self.format.bytes_per_pixel())
            .ok_or_else(overflow)?;
        let span = self
            .row_stride
            .checked_mul(self.height.saturating_sub(1))
            .and_then(|rows| rows.checked_add(row_bytes))
            .ok_or_else(overflow)?;
        Ok((row_bytes, span))
    }
}

fn too_large(width: usize, height: usize) -> NetworkError {
    NetworkError::UnsupportedFormat(format!("image {}×{} is too large to address", width, height))
}

/// Converts raw images into input vectors of a fixed size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputNormalizer {
    input_size: usize,
    polarity: Polarity,
}

impl Default for InputNormalizer {
    fn default() -> Self {
        Self::new(INPUT_SIZE)
    }
}

impl InputNormalizer {
    pub fn new(input_size: usize) -> Self {
        Self {
            input_size,
            polarity: Polarity::Direct,
        }
    }

    pub fn with_polarity(mut self, polarity: Polarity) -> Self {
        self.polarity = polarity;
        self
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Normalize a tightly packed buffer of `width × height` pixels of
    /// `pixel_stride` bytes each.
    pub fn normalize(
        &self,
        raw: &[u8],
        pixel_stride: usize,
        width: usize,
        height: usize,
    ) -> Result<Vec<f32>> {
        let format = PixelFormat::from_stride(pixel_stride)?;
        let layout = ImageLayout::packed(format, width, height)?;
        let expected = layout
            .row_stride
            .checked_mul(height)
            .ok_or_else(|| too_large(width, height))?;
        if raw.len() != expected {
            return Err(NetworkError::UnsupportedFormat(format!(
                "buffer of {} bytes does not hold {}×{} pixels of {} bytes",
                raw.len(),
                width,
                height,
                pixel_stride
            )));
        }
        self.normalize_with(raw, &layout)
    }

    /// Normalize a buffer with an explicit format and row stride.
    pub fn normalize_with(&self, raw: &[u8], layout: &ImageLayout) -> Result<Vec<f32>> {
        let bpp = layout.format.bytes_per_pixel();
        if layout.width == 0 || layout.height == 0 {
            return Err(NetworkError::UnsupportedFormat(format!(
                "empty image {}×{}",
                layout.width, layout.height
            )));
        }
        let (row_bytes, needed) = layout.span()?;
        if layout.row_stride < row_bytes {
            return Err(NetworkError::UnsupportedFormat(format!(
                "row stride {} is shorter than a row of {} bytes",
                layout.row_stride, row_bytes
            )));
        }
        if raw.len() < needed {
            return Err(NetworkError::UnsupportedFormat(format!(
                "buffer of {} bytes is shorter than the {} bytes the layout needs",
                raw.len(),
                needed
            )));
        }

        let pixels = layout.width * layout.height;
        if pixels != self.input_size {
            return Err(NetworkError::SizeMismatch {
                expected: self.input_size,
                actual: pixels,
            });
        }

        let mut input = Vec::with_capacity(pixels);
        for row in 0..layout.height {
            let start = row * layout.row_stride;
            for px in raw[start..start + row_bytes].chunks_exact(bpp) {
                let value = layout.format.intensity(px);
                input.push(match self.polarity {
                    Polarity::Direct => value,
                    Polarity::Inverted => 1.0 - value,
                });
            }
        }
        Ok(input)
    }
}

/// Normalize a packed 28×28 buffer with the default polarity.
pub fn normalize(raw: &[u8], pixel_stride: usize, width: usize, height: usize) -> Result<Vec<f32>> {
    InputNormalizer::default().normalize(raw, pixel_stride, width, height)
}
