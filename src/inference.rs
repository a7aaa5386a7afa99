//! Inference backend abstraction and factory

use crate::{
    config::EnhanceConfig,
    error::{EnhanceError, Result},
    models::ModelDescriptor,
};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

// Use instant crate for cross-platform time compatibility
use instant::Duration;

/// Edge length of the square probe used to measure a model's spatial scale
pub const SCALE_PROBE_SIZE: usize = 64;

/// Trait for image-to-image inference backends
///
/// Inputs and outputs are `[1, 3, H, W]` tensors normalized to `0..=1`. A model with
/// scale `s` maps an `H x W` tile to `sH x sW`.
pub trait InferenceBackend: Send {
    /// Initialize the backend with the given configuration
    ///
    /// Returns the model load time, or `None` if the backend was already initialized.
    ///
    /// # Errors
    /// - Model loading or validation errors
    /// - Model whose output is not an integer multiple of its input
    fn initialize(&mut self, config: &EnhanceConfig) -> Result<Option<Duration>>;

    /// Run inference on one tile
    ///
    /// # Errors
    /// - Backend not initialized
    /// - Model inference failures
    /// - Output tensor is not 4D
    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>>;

    /// Integer spatial scale of the model output, known after initialization
    fn scale(&self) -> usize;

    /// Check if backend is initialized
    fn is_initialized(&self) -> bool;
}

/// Derive a model's integer scale from a probe inference
///
/// # Errors
/// - Output that is not `[1, 3, sH, sW]` for a single integer `s >= 1`
pub fn scale_from_probe(input: (usize, usize), output: &Array4<f32>) -> Result<usize> {
    let (batch, channels, height, width) = output.dim();
    let (in_height, in_width) = input;
    if batch != 1 || channels != 3 {
        return Err(EnhanceError::model(format!(
            "Expected [1, 3, H, W] model output, got {:?}",
            output.dim()
        )));
    }
    if in_height == 0
        || in_width == 0
        || height % in_height != 0
        || width % in_width != 0
        || height / in_height != width / in_width
        || height < in_height
    {
        return Err(EnhanceError::model(format!(
            "Model output {width}x{height} is not an integer upscale of {in_width}x{in_height}"
        )));
    }
    Ok(height / in_height)
}

/// Inference engine selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// ONNX Runtime backend (GPU acceleration)
    Onnx,
    /// Tract backend (pure Rust)
    Tract,
}

impl Default for BackendType {
    fn default() -> Self {
        if cfg!(feature = "onnx") {
            Self::Onnx
        } else {
            Self::Tract
        }
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Onnx => write!(f, "onnx"),
            Self::Tract => write!(f, "tract"),
        }
    }
}

impl std::str::FromStr for BackendType {
    type Err = EnhanceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "onnx" => Ok(Self::Onnx),
            "tract" => Ok(Self::Tract),
            other => Err(EnhanceError::invalid_config(format!(
                "Unknown backend type '{other}'"
            ))),
        }
    }
}

/// Factory trait for creating backends for a resolved model
pub trait BackendFactory: Send + Sync {
    /// Create a new, uninitialized backend for the model
    ///
    /// # Errors
    /// - Backend type not compiled in
    /// - Backend creation failures
    fn create_backend(
        &self,
        backend_type: BackendType,
        model: &ModelDescriptor,
    ) -> Result<Box<dyn InferenceBackend>>;

    /// Get list of available backend types
    fn available_backends(&self) -> Vec<BackendType>;
}

/// Factory for the backends compiled into this build
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackendFactory;

impl BackendFactory for DefaultBackendFactory {
    fn create_backend(
        &self,
        backend_type: BackendType,
        model: &ModelDescriptor,
    ) -> Result<Box<dyn InferenceBackend>> {
        match backend_type {
            #[cfg(feature = "onnx")]
            BackendType::Onnx => Ok(Box::new(crate::backends::OnnxBackend::new(
                model.path().to_path_buf(),
            ))),
            #[cfg(feature = "tract")]
            BackendType::Tract => Ok(Box::new(crate::backends::TractBackend::new(
                model.path().to_path_buf(),
            ))),
            #[allow(unreachable_patterns)]
            other => Err(EnhanceError::invalid_config(format!(
                "Backend '{other}' is not enabled in this build (model {})",
                model.name()
            ))),
        }
    }

    fn available_backends(&self) -> Vec<BackendType> {
        let mut backends = Vec::new();
        #[cfg(feature = "onnx")]
        backends.push(BackendType::Onnx);
        #[cfg(feature = "tract")]
        backends.push(BackendType::Tract);
        backends
    }
}
