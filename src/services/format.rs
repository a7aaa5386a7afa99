//! File format selection for loading and saving renders

use crate::error::{EnhanceError, Result};
use image::ImageFormat;
use std::path::Path;

/// Formats renders can be written in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFileFormat {
    Jpeg,
    Png,
    Tiff,
}

impl ImageFileFormat {
    /// Pick the format from a path's extension
    ///
    /// # Errors
    /// - Missing or unsupported extension
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| {
                EnhanceError::unsupported_format(format!("No extension on '{}'", path.display()))
            })?;
        match extension.as_str() {
            "jpg" | "jpeg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            "tif" | "tiff" => Ok(Self::Tiff),
            other => Err(EnhanceError::unsupported_format(format!(
                "Cannot write '.{other}' images (expected jpg, png or tiff)"
            ))),
        }
    }

    #[must_use]
    pub fn image_format(self) -> ImageFormat {
        match self {
            Self::Jpeg => ImageFormat::Jpeg,
            Self::Png => ImageFormat::Png,
            Self::Tiff => ImageFormat::Tiff,
        }
    }

    /// Whether 16-bit samples survive a save in this format
    #[must_use]
    pub fn supports_sixteen_bit(self) -> bool {
        !matches!(self, Self::Jpeg)
    }

    /// Whether source EXIF metadata is carried over on save
    #[must_use]
    pub fn carries_exif(self) -> bool {
        matches!(self, Self::Jpeg)
    }
}

impl std::fmt::Display for ImageFileFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Jpeg => "JPEG",
            Self::Png => "PNG",
            Self::Tiff => "TIFF",
        };
        f.write_str(name)
    }
}
