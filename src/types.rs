//! Core pixel and geometry types shared by the pipeline

use crate::error::{EnhanceError, Result};
use image::{DynamicImage, ImageBuffer, Rgb};
use ndarray::{Array3, Array4};
use serde::{Deserialize, Serialize};

/// Sample depth of a decoded image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BitDepth {
    /// 8 bits per channel (JPEG, PNG, standard TIFF)
    Eight,
    /// 16 bits per channel (PNG, TIFF)
    Sixteen,
}

impl BitDepth {
    /// Largest representable sample value, also the tensor normalization divisor
    #[must_use]
    pub fn max_value(self) -> f32 {
        match self {
            Self::Eight => 255.0,
            Self::Sixteen => 65535.0,
        }
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            Self::Eight => 8,
            Self::Sixteen => 16,
        }
    }
}

impl std::fmt::Display for BitDepth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// Owned RGB image in HWC layout
///
/// Samples are stored as `u16` for both depths; 8-bit buffers never hold values above 255.
/// Stages hand buffers to each other by value, so no buffer is shared mutably after handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    pixels: Array3<u16>,
    depth: BitDepth,
}

impl PixelBuffer {
    /// Wrap an `(height, width, 3)` sample array
    ///
    /// # Errors
    /// - Channel count other than 3
    /// - Zero width or height
    /// - 8-bit buffer holding samples above 255
    pub fn new(pixels: Array3<u16>, depth: BitDepth) -> Result<Self> {
        let (height, width, channels) = pixels.dim();
        if channels != 3 {
            return Err(EnhanceError::processing(format!(
                "Expected 3 channels, got {channels}"
            )));
        }
        if height == 0 || width == 0 {
            return Err(EnhanceError::invalid_config(format!(
                "Degenerate image dimensions {width}x{height}"
            )));
        }
        if depth == BitDepth::Eight && pixels.iter().any(|&v| v > 255) {
            return Err(EnhanceError::processing(
                "8-bit buffer contains samples above 255",
            ));
        }
        Ok(Self { pixels, depth })
    }

    /// Build a buffer from a per-sample function `f(y, x, channel)`
    ///
    /// # Errors
    /// Same as [`PixelBuffer::new`].
    pub fn from_fn<F>(width: usize, height: usize, depth: BitDepth, f: F) -> Result<Self>
    where
        F: Fn(usize, usize, usize) -> u16,
    {
        Self::new(
            Array3::from_shape_fn((height, width, 3), |(y, x, c)| f(y, x, c)),
            depth,
        )
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.pixels.dim().1
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.pixels.dim().0
    }

    #[must_use]
    pub fn dimensions(&self) -> (usize, usize) {
        (self.width(), self.height())
    }

    #[must_use]
    pub fn depth(&self) -> BitDepth {
        self.depth
    }

    #[must_use]
    pub fn pixels(&self) -> &Array3<u16> {
        &self.pixels
    }

    /// Decode a `DynamicImage`, keeping 16-bit sources at 16 bits
    ///
    /// # Errors
    /// - Degenerate dimensions
    pub fn from_dynamic(image: &DynamicImage) -> Result<Self> {
        let sixteen = matches!(
            image,
            DynamicImage::ImageLuma16(_)
                | DynamicImage::ImageLumaA16(_)
                | DynamicImage::ImageRgb16(_)
                | DynamicImage::ImageRgba16(_)
                | DynamicImage::ImageRgb32F(_)
                | DynamicImage::ImageRgba32F(_)
        );

        if sixteen {
            let rgb = image.to_rgb16();
            let (width, height) = rgb.dimensions();
            let pixels =
                Array3::from_shape_vec((height as usize, width as usize, 3), rgb.into_raw())
                    .map_err(|e| {
                        EnhanceError::processing(format!("Failed to shape 16-bit pixels: {e}"))
                    })?;
            Self::new(pixels, BitDepth::Sixteen)
        } else {
            let rgb = image.to_rgb8();
            let (width, height) = rgb.dimensions();
            let samples: Vec<u16> = rgb.into_raw().into_iter().map(u16::from).collect();
            let pixels = Array3::from_shape_vec((height as usize, width as usize, 3), samples)
                .map_err(|e| {
                    EnhanceError::processing(format!("Failed to shape 8-bit pixels: {e}"))
                })?;
            Self::new(pixels, BitDepth::Eight)
        }
    }

    /// Encode back into a `DynamicImage` at the buffer's depth
    ///
    /// # Errors
    /// - Image dimensions exceed `u32`
    pub fn to_dynamic(&self) -> Result<DynamicImage> {
        let width = u32::try_from(self.width())
            .map_err(|_| EnhanceError::processing("Image width exceeds u32"))?;
        let height = u32::try_from(self.height())
            .map_err(|_| EnhanceError::processing("Image height exceeds u32"))?;

        match self.depth {
            BitDepth::Eight => {
                let bytes: Vec<u8> = self.pixels.iter().map(|&v| v.min(255) as u8).collect();
                let buffer = image::RgbImage::from_raw(width, height, bytes).ok_or_else(|| {
                    EnhanceError::internal("Pixel count does not match image dimensions")
                })?;
                Ok(DynamicImage::ImageRgb8(buffer))
            },
            BitDepth::Sixteen => {
                let samples: Vec<u16> = self.pixels.iter().copied().collect();
                let buffer: ImageBuffer<Rgb<u16>, Vec<u16>> =
                    ImageBuffer::from_raw(width, height, samples).ok_or_else(|| {
                        EnhanceError::internal("Pixel count does not match image dimensions")
                    })?;
                Ok(DynamicImage::ImageRgb16(buffer))
            },
        }
    }

    /// Convert to a normalized `[1, 3, H, W]` tensor in `0..=1`
    #[must_use]
    pub fn to_tensor(&self) -> Array4<f32> {
        let max = self.depth.max_value();
        let (height, width, _) = self.pixels.dim();
        Array4::from_shape_fn((1, 3, height, width), |(_, c, y, x)| {
            f32::from(self.pixels[[y, x, c]]) / max
        })
    }

    /// Convert a normalized `[1, 3, H, W]` tensor back to samples
    ///
    /// Values are clamped to `[0, max]` and then truncated.
    ///
    /// # Errors
    /// - Tensor is not `[1, 3, H, W]`
    pub fn from_tensor(tensor: &Array4<f32>, depth: BitDepth) -> Result<Self> {
        let (batch, channels, height, width) = tensor.dim();
        if batch != 1 || channels != 3 {
            return Err(EnhanceError::processing(format!(
                "Expected [1, 3, H, W] tensor, got {:?}",
                tensor.dim()
            )));
        }
        let max = depth.max_value();
        let pixels = Array3::from_shape_fn((height, width, 3), |(y, x, c)| {
            (tensor[[0, c, y, x]] * max).clamp(0.0, max) as u16
        });
        Self::new(pixels, depth)
    }

    /// Un-normalized `[1, 3, H, W]` view of the samples, used for blending and resampling
    #[must_use]
    pub fn to_planar(&self) -> Array4<f32> {
        let (height, width, _) = self.pixels.dim();
        Array4::from_shape_fn((1, 3, height, width), |(_, c, y, x)| {
            f32::from(self.pixels[[y, x, c]])
        })
    }

    /// Inverse of [`PixelBuffer::to_planar`], rounding to nearest and saturating
    ///
    /// # Errors
    /// - Tensor is not `[1, 3, H, W]`
    pub fn from_planar(planar: &Array4<f32>, depth: BitDepth) -> Result<Self> {
        let (batch, channels, height, width) = planar.dim();
        if batch != 1 || channels != 3 {
            return Err(EnhanceError::processing(format!(
                "Expected [1, 3, H, W] planar data, got {:?}",
                planar.dim()
            )));
        }
        let max = depth.max_value();
        let pixels = Array3::from_shape_fn((height, width, 3), |(y, x, c)| {
            planar[[0, c, y, x]].round().clamp(0.0, max) as u16
        });
        Self::new(pixels, depth)
    }

    /// Rescale samples to another depth (8-bit values map onto the full 16-bit range)
    #[must_use]
    pub fn with_depth(&self, depth: BitDepth) -> Self {
        let pixels = match (self.depth, depth) {
            (BitDepth::Eight, BitDepth::Sixteen) => self.pixels.mapv(|v| v * 257),
            (BitDepth::Sixteen, BitDepth::Eight) => {
                self.pixels.mapv(|v| (f32::from(v) / 257.0).round() as u16)
            },
            _ => self.pixels.clone(),
        };
        Self { pixels, depth }
    }
}

/// Axis-aligned subject box in pixel coordinates of the input image
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoundingBox {
    #[must_use]
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    #[must_use]
    pub fn width(&self) -> f32 {
        (self.x1 - self.x0).max(0.0)
    }

    #[must_use]
    pub fn height(&self) -> f32 {
        (self.y1 - self.y0).max(0.0)
    }
}
