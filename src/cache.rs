//! On-disk cache of raw model outputs and rendered chains
//!
//! Every file gets a timestamp-qualified name that encodes the chain that produced it, so
//! the directory stays human-browsable and concurrent writers cannot collide.

use crate::{
    config::EnhanceConfig,
    error::{EnhanceError, Result},
    operation::AppliedOperation,
    output_file::BaseFile,
    services::io::ImageIOService,
    types::{BitDepth, PixelBuffer},
};
use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{span, Level};

/// Age after which [`RenderCache::purge_expired`] deletes files by default
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Cache directory manager
#[derive(Debug, Clone)]
pub struct RenderCache {
    cache_dir: PathBuf,
    jpeg_quality: u8,
}

impl RenderCache {
    /// Open (creating if needed) a cache rooted at `cache_dir`
    ///
    /// # Errors
    /// - Failed to create cache directory
    pub fn new<P: Into<PathBuf>>(cache_dir: P) -> Result<Self> {
        let cache_dir = cache_dir.into();
        if !cache_dir.exists() {
            fs::create_dir_all(&cache_dir)
                .map_err(|e| EnhanceError::file_io_error("create cache directory", &cache_dir, &e))?;
        }
        Ok(Self {
            cache_dir,
            jpeg_quality: 100,
        })
    }

    /// # Errors
    /// - Failed to create cache directory
    pub fn from_config(config: &EnhanceConfig) -> Result<Self> {
        let mut cache = Self::new(&config.cache_dir)?;
        cache.jpeg_quality = config.jpeg_quality;
        Ok(cache)
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Store an operation's unblended, unscaled output
    ///
    /// Raw outputs are always written losslessly (PNG for 8-bit, TIFF for 16-bit) so
    /// replays reproduce the exact pixels inference produced.
    ///
    /// # Errors
    /// - Encoding or write failures
    pub fn save_raw(&self, buffer: &PixelBuffer, base: &BaseFile, operation: &AppliedOperation) -> Result<PathBuf> {
        let _span = span!(Level::DEBUG, "cache_save_raw", model = %operation.model).entered();
        let extension = match buffer.depth() {
            BitDepth::Eight => "png",
            BitDepth::Sixteen => "tiff",
        };
        let stem = format!("{}_{}_{}_raw", base.stem(), operation.kind, operation.model);
        let path = self.unique_path(&stem, extension);
        log::info!("💾 Saving raw model output to {}", path.display());
        ImageIOService::save_image(buffer, &path, None, 100)?;
        Ok(path)
    }

    /// Store the render of a whole chain, in the base file's format where possible
    ///
    /// # Errors
    /// - Encoding or write failures
    pub fn save_render(&self, buffer: &PixelBuffer, base: &BaseFile, operations: &[AppliedOperation]) -> Result<PathBuf> {
        let _span = span!(Level::DEBUG, "cache_save_render", operations = operations.len()).entered();
        let extra: String = operations.iter().map(AppliedOperation::path_extra).collect();
        let stem = format!("{}{}", base.stem(), extra);
        let path = self.unique_path(&stem, &Self::render_extension(base, buffer));
        log::info!("💾 Saving {}-bit render to {}", buffer.depth().bits(), path.display());
        ImageIOService::save_image(buffer, &path, Some(base.path()), self.jpeg_quality)?;
        Ok(path)
    }

    /// # Errors
    /// - Missing or undecodable file
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<PixelBuffer> {
        ImageIOService::load_image(path)
    }

    /// Delete cached files last modified more than `max_age` ago
    ///
    /// Returns the number of files deleted. Files that cannot be inspected or removed
    /// are logged and left behind.
    ///
    /// # Errors
    /// - Cache directory cannot be listed
    pub fn purge_expired(&self, max_age: Duration) -> Result<usize> {
        let _span = span!(Level::DEBUG, "cache_purge").entered();
        let entries = fs::read_dir(&self.cache_dir)
            .map_err(|e| EnhanceError::file_io_error("list cache directory", &self.cache_dir, &e))?;
        let now = SystemTime::now();
        let mut deleted = 0;

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if age.is_some_and(|age| age > max_age) {
                match fs::remove_file(&path) {
                    Ok(()) => deleted += 1,
                    Err(e) => log::warn!("Failed to purge {}: {}", path.display(), e),
                }
            }
        }

        if deleted > 0 {
            log::info!("🧹 Purged {deleted} expired cache files");
        }
        Ok(deleted)
    }

    /// Cached files, sorted by name
    ///
    /// # Errors
    /// - Cache directory cannot be listed
    pub fn entries(&self) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.cache_dir)
            .map_err(|e| EnhanceError::file_io_error("list cache directory", &self.cache_dir, &e))?;
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        Ok(files)
    }

    fn render_extension(base: &BaseFile, buffer: &PixelBuffer) -> String {
        let extension = base.extension().unwrap_or_else(|| "png".to_string());
        if ImageIOService::is_supported_format(Path::new("x").with_extension(&extension))
            && !(buffer.depth() == BitDepth::Sixteen && matches!(extension.as_str(), "jpg" | "jpeg"))
        {
            extension
        } else {
            match buffer.depth() {
                BitDepth::Eight => "png".to_string(),
                BitDepth::Sixteen => "tiff".to_string(),
            }
        }
    }

    fn unique_path(&self, stem: &str, extension: &str) -> PathBuf {
        let timestamp = Local::now().format("%Y%m%d-%H%M%S");
        let mut path = self.cache_dir.join(format!("{stem}_{timestamp}.{extension}"));
        let mut counter = 1;
        while path.exists() {
            path = self
                .cache_dir
                .join(format!("{stem}_{timestamp}-{counter}.{extension}"));
            counter += 1;
        }
        path
    }
}

/// Human-readable byte count
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::gradient_image;
    use crate::masks::MaskRef;
    use crate::models::ModelDescriptor;
    use crate::operation::OperationKind;
    use tempfile::TempDir;

    fn fixture(dir: &Path, name: &str, depth: BitDepth) -> BaseFile {
        let path = dir.join(name);
        ImageIOService::save_image(&gradient_image(6, 4, depth).unwrap(), &path, None, 100).unwrap();
        BaseFile::new(path)
    }

    fn operation() -> AppliedOperation {
        AppliedOperation::new(
            OperationKind::Sharpen,
            &ModelDescriptor::new("models", "1x/deblur.onnx"),
            None,
            vec![MaskRef::new("person", false)],
        )
    }

    #[test]
    fn test_raw_output_naming() {
        let dir = TempDir::new().unwrap();
        let cache = RenderCache::new(dir.path().join("cache")).unwrap();
        let base = fixture(dir.path(), "photo.jpg", BitDepth::Eight);
        let raw = gradient_image(6, 4, BitDepth::Eight).unwrap();

        let path = cache.save_raw(&raw, &base, &operation()).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("photo_sharpen_1x_deblur_raw_"), "{name}");
        assert!(name.ends_with(".png"));
        assert_eq!(cache.load(&path).unwrap(), raw);
    }

    #[test]
    fn test_render_naming_encodes_chain() {
        let dir = TempDir::new().unwrap();
        let cache = RenderCache::new(dir.path().join("cache")).unwrap();
        let base = fixture(dir.path(), "photo.png", BitDepth::Eight);
        let render = gradient_image(6, 4, BitDepth::Eight).unwrap();

        let path = cache.save_render(&render, &base, &[operation()]).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("photo_sharpen_1x_deblur_s80_mperson_"), "{name}");
        assert!(name.ends_with(".png"));
    }

    #[test]
    fn test_sixteen_bit_render_of_jpeg_base_uses_tiff() {
        let dir = TempDir::new().unwrap();
        let cache = RenderCache::new(dir.path().join("cache")).unwrap();
        let base = fixture(dir.path(), "photo.jpg", BitDepth::Eight);
        let render = gradient_image(6, 4, BitDepth::Sixteen).unwrap();
        let path = cache.save_render(&render, &base, &[]).unwrap();
        assert_eq!(path.extension().unwrap(), "tiff");
    }

    #[test]
    fn test_same_second_writes_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let cache = RenderCache::new(dir.path().join("cache")).unwrap();
        let base = fixture(dir.path(), "photo.png", BitDepth::Eight);
        let raw = gradient_image(6, 4, BitDepth::Eight).unwrap();
        let a = cache.save_raw(&raw, &base, &operation()).unwrap();
        let b = cache.save_raw(&raw, &base, &operation()).unwrap();
        assert_ne!(a, b);
        assert_eq!(cache.entries().unwrap().len(), 2);
    }

    #[test]
    fn test_purge_expired() {
        let dir = TempDir::new().unwrap();
        let cache = RenderCache::new(dir.path()).unwrap();
        fs::write(dir.path().join("old.png"), b"x").unwrap();
        fs::write(dir.path().join("new.png"), b"y").unwrap();

        assert_eq!(cache.purge_expired(DEFAULT_MAX_AGE).unwrap(), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.purge_expired(Duration::from_millis(1)).unwrap(), 2);
        assert!(cache.entries().unwrap().is_empty());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(1024 * 1024 * 3), "3.0 MB");
    }
}
