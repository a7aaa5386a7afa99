//! Configuration types for enhancement runs

use crate::error::{EnhanceError, Result};
use crate::inference::BackendType;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Tile sizes offered to users
pub const TILE_SIZES: [usize; 5] = [64, 128, 256, 512, 1024];

/// Tile paddings offered to users
pub const TILE_PADDINGS: [usize; 4] = [0, 8, 16, 32];

/// Environment variable overriding the render cache location
pub const CACHE_DIR_ENV: &str = "ENHANCE_CACHE_DIR";

/// Execution provider options for ONNX Runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ExecutionProvider {
    /// Auto-detect best available provider (CUDA > `CoreML` > CPU)
    #[default]
    Auto,
    /// CPU execution (always available)
    Cpu,
    /// NVIDIA CUDA GPU acceleration
    Cuda,
    /// Apple Silicon acceleration
    CoreMl,
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::CoreMl => write!(f, "coreml"),
        }
    }
}

impl std::str::FromStr for ExecutionProvider {
    type Err = EnhanceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda),
            "coreml" => Ok(Self::CoreMl),
            other => Err(EnhanceError::invalid_config(format!(
                "Unknown execution provider '{other}'"
            ))),
        }
    }
}

/// Default render cache directory, honouring [`CACHE_DIR_ENV`]
#[must_use]
pub fn default_cache_dir() -> PathBuf {
    std::env::var_os(CACHE_DIR_ENV).map_or_else(|| PathBuf::from(".cache"), PathBuf::from)
}

/// Configuration for tiled enhancement runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhanceConfig {
    /// Edge length of the square model input
    pub tile_size: usize,

    /// Context pixels on each side of a tile, discarded after inference
    pub tile_padding: usize,

    /// Downscale upscaler output back to the input dimensions
    pub maintain_scale: bool,

    /// Skip inference for tiles with no mask weight
    pub skip_empty_tiles: bool,

    /// Inference backend used for new runs
    pub backend: BackendType,

    /// Execution provider for ONNX Runtime
    pub execution_provider: ExecutionProvider,

    /// Number of intra-op threads for inference (0 = auto)
    pub intra_threads: usize,

    /// Directory holding raw outputs and renders
    pub cache_dir: PathBuf,

    /// Root directory model keys are resolved against
    pub model_root: PathBuf,

    /// JPEG quality for saved renders
    pub jpeg_quality: u8,

    /// Number of finished jobs kept in the history
    pub history_capacity: usize,
}

impl Default for EnhanceConfig {
    fn default() -> Self {
        Self {
            tile_size: 512,
            tile_padding: 32,
            maintain_scale: false,
            skip_empty_tiles: true,
            backend: BackendType::default(),
            execution_provider: ExecutionProvider::default(),
            intra_threads: 0,
            cache_dir: default_cache_dir(),
            model_root: PathBuf::from("models"),
            jpeg_quality: 100,
            history_capacity: 32,
        }
    }
}

impl EnhanceConfig {
    /// Create a new configuration builder
    ///
    /// # Examples
    ///
    /// ```rust
    /// use enhance::EnhanceConfig;
    ///
    /// let config = EnhanceConfig::builder()
    ///     .tile_size(256)
    ///     .tile_padding(16)
    ///     .maintain_scale(true)
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(config.tile_size, 256);
    /// ```
    #[must_use]
    pub fn builder() -> EnhanceConfigBuilder {
        EnhanceConfigBuilder::default()
    }

    /// Validate all configuration parameters
    ///
    /// # Errors
    /// - Zero tile size
    /// - Tile padding of half the tile size or more
    /// - JPEG quality above 100
    /// - Zero history capacity
    pub fn validate(&self) -> Result<()> {
        validate_tiling(self.tile_size, self.tile_padding)?;

        if self.jpeg_quality > 100 {
            return Err(EnhanceError::config_value_error(
                "JPEG quality",
                self.jpeg_quality,
                "0-100",
                Some(100),
            ));
        }

        if self.history_capacity == 0 {
            return Err(EnhanceError::config_value_error(
                "history capacity",
                self.history_capacity,
                "1 or more",
                Some(32),
            ));
        }

        Ok(())
    }
}

/// Check a tile size / padding pair
///
/// # Errors
/// - Zero tile size
/// - `2 * padding >= tile_size`, which would leave no usable tile area
pub fn validate_tiling(tile_size: usize, tile_padding: usize) -> Result<()> {
    if tile_size == 0 {
        return Err(EnhanceError::config_value_error(
            "tile size",
            tile_size,
            "1 or more",
            Some(512),
        ));
    }
    if tile_padding * 2 >= tile_size {
        return Err(EnhanceError::invalid_config(format!(
            "Tile padding {tile_padding} must be less than half the tile size {tile_size}"
        )));
    }
    Ok(())
}

/// Builder for `EnhanceConfig`
#[derive(Debug, Default)]
pub struct EnhanceConfigBuilder {
    config: EnhanceConfig,
}

impl EnhanceConfigBuilder {
    #[must_use]
    pub fn tile_size(mut self, tile_size: usize) -> Self {
        self.config.tile_size = tile_size;
        self
    }

    #[must_use]
    pub fn tile_padding(mut self, tile_padding: usize) -> Self {
        self.config.tile_padding = tile_padding;
        self
    }

    #[must_use]
    pub fn maintain_scale(mut self, maintain_scale: bool) -> Self {
        self.config.maintain_scale = maintain_scale;
        self
    }

    #[must_use]
    pub fn skip_empty_tiles(mut self, skip: bool) -> Self {
        self.config.skip_empty_tiles = skip;
        self
    }

    #[must_use]
    pub fn backend(mut self, backend: BackendType) -> Self {
        self.config.backend = backend;
        self
    }

    /// Set execution provider
    #[must_use]
    pub fn execution_provider(mut self, provider: ExecutionProvider) -> Self {
        self.config.execution_provider = provider;
        self
    }

    /// Set number of intra-op threads (0 = auto)
    #[must_use]
    pub fn intra_threads(mut self, threads: usize) -> Self {
        self.config.intra_threads = threads;
        self
    }

    #[must_use]
    pub fn cache_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.cache_dir = dir.into();
        self
    }

    #[must_use]
    pub fn model_root<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.model_root = dir.into();
        self
    }

    /// Set JPEG quality
    #[must_use]
    pub fn jpeg_quality(mut self, quality: u8) -> Self {
        self.config.jpeg_quality = quality.min(100);
        self
    }

    #[must_use]
    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.config.history_capacity = capacity;
        self
    }

    /// Build the configuration
    ///
    /// # Errors
    /// - Any rule checked by [`EnhanceConfig::validate`]
    pub fn build(self) -> Result<EnhanceConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
