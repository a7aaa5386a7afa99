//! ONNX Runtime backend for enhancement models
//!
//! Loads an image-to-image ONNX model from disk and runs it on tiles with the
//! requested execution provider (CPU, CUDA, `CoreML`), falling back to CPU when the
//! requested accelerator is unavailable.

use crate::config::{EnhanceConfig, ExecutionProvider};
use crate::error::{EnhanceError, Result};
use crate::inference::{scale_from_probe, InferenceBackend, SCALE_PROBE_SIZE};
use ndarray::Array4;
use ort::execution_providers::{
    CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider as OrtExecutionProvider,
};
use ort::session::{builder::GraphOptimizationLevel, builder::SessionBuilder, Session};
use ort::value::Value;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// ONNX Runtime backend for running enhancement models
#[derive(Debug)]
pub struct OnnxBackend {
    model_path: PathBuf,
    session: Option<Session>,
    scale: usize,
    initialized: bool,
}

impl OnnxBackend {
    /// List all ONNX Runtime execution providers with availability status and descriptions
    #[must_use]
    pub fn list_providers() -> Vec<(String, bool, String)> {
        let cuda_available =
            OrtExecutionProvider::is_available(&CUDAExecutionProvider::default()).unwrap_or(false);
        let coreml_available =
            OrtExecutionProvider::is_available(&CoreMLExecutionProvider::default())
                .unwrap_or(false);

        vec![
            (
                "CPU".to_string(),
                true,
                "Always available, uses CPU for inference".to_string(),
            ),
            (
                "CUDA".to_string(),
                cuda_available,
                "NVIDIA GPU acceleration (requires CUDA toolkit and compatible GPU)".to_string(),
            ),
            (
                "CoreML".to_string(),
                coreml_available,
                "Apple Silicon GPU acceleration (macOS only)".to_string(),
            ),
        ]
    }

    /// Create a backend for the model file at `model_path`
    #[must_use]
    pub fn new(model_path: PathBuf) -> Self {
        Self {
            model_path,
            session: None,
            scale: 1,
            initialized: false,
        }
    }

    fn configure_providers(
        session_builder: SessionBuilder,
        provider: ExecutionProvider,
    ) -> Result<SessionBuilder> {
        let mut providers = Vec::new();

        if matches!(provider, ExecutionProvider::Auto | ExecutionProvider::Cuda) {
            let cuda_provider = CUDAExecutionProvider::default();
            if OrtExecutionProvider::is_available(&cuda_provider).unwrap_or(false) {
                log::info!("🚀 Using CUDA execution provider");
                providers.push(cuda_provider.build());
            } else if provider == ExecutionProvider::Cuda {
                log::warn!("CUDA execution provider requested but not available, falling back to CPU");
            }
        }

        if matches!(provider, ExecutionProvider::Auto | ExecutionProvider::CoreMl) {
            let coreml_provider = CoreMLExecutionProvider::default();
            if OrtExecutionProvider::is_available(&coreml_provider).unwrap_or(false) {
                log::info!("🍎 Using CoreML execution provider");
                providers.push(CoreMLExecutionProvider::default().with_subgraphs(true).build());
            } else if provider == ExecutionProvider::CoreMl {
                log::warn!("CoreML execution provider requested but not available, falling back to CPU");
            }
        }

        if providers.is_empty() {
            log::info!("Using CPU execution provider");
            return Ok(session_builder);
        }

        session_builder
            .with_execution_providers(providers)
            .map_err(|e| EnhanceError::inference(format!("Failed to set execution providers: {e}")))
    }

    fn load_model(&mut self, config: &EnhanceConfig) -> Result<Duration> {
        let model_load_start = Instant::now();

        let model_data = std::fs::read(&self.model_path)
            .map_err(|e| EnhanceError::file_io_error("read model", &self.model_path, &e))?;

        let session_builder = Session::builder()
            .map_err(|e| EnhanceError::inference(format!("Failed to create session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| {
                EnhanceError::inference(format!("Failed to set optimization level: {e}"))
            })?;
        let session_builder = Self::configure_providers(session_builder, config.execution_provider)?;

        let intra_threads = if config.intra_threads > 0 {
            config.intra_threads
        } else {
            std::thread::available_parallelism()
                .map(std::num::NonZero::get)
                .unwrap_or(4)
        };

        let session = session_builder
            .with_intra_threads(intra_threads)
            .map_err(|e| EnhanceError::inference(format!("Failed to set intra threads: {e}")))?
            .commit_from_memory(&model_data)
            .map_err(|e| {
                EnhanceError::model(format!(
                    "Failed to create session from '{}': {e}",
                    self.model_path.display()
                ))
            })?;

        log::debug!("✅ ONNX Runtime session created");
        log::debug!("  - Requested provider: {}", config.execution_provider);
        log::debug!("  - Intra-op threads: {intra_threads}");

        self.session = Some(session);
        self.initialized = true;

        let probe = Array4::<f32>::zeros((1, 3, SCALE_PROBE_SIZE, SCALE_PROBE_SIZE));
        let scale = self
            .infer(&probe)
            .and_then(|output| scale_from_probe((SCALE_PROBE_SIZE, SCALE_PROBE_SIZE), &output));
        match scale {
            Ok(scale) => self.scale = scale,
            Err(e) => {
                self.session = None;
                self.initialized = false;
                return Err(e);
            },
        }

        let model_load_time = model_load_start.elapsed();
        log::info!(
            "📊 Model loaded in {:.0}ms (scale x{})",
            model_load_time.as_secs_f64() * 1000.0,
            self.scale
        );
        Ok(model_load_time)
    }
}

impl InferenceBackend for OnnxBackend {
    fn initialize(&mut self, config: &EnhanceConfig) -> Result<Option<Duration>> {
        if self.initialized {
            return Ok(None);
        }
        let model_load_time = self.load_model(config)?;
        Ok(Some(model_load_time))
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        if !self.initialized {
            return Err(EnhanceError::internal("Backend not initialized"));
        }

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| EnhanceError::internal("ONNX session not initialized"))?;

        let inference_start = Instant::now();

        let input_value = Value::from_array(input.clone())
            .map_err(|e| EnhanceError::processing(format!("Failed to convert input tensor: {e}")))?;

        // Positional inputs avoid depending on tensor names
        let outputs = session
            .run(ort::inputs![input_value])
            .map_err(|e| EnhanceError::inference(format!("ONNX inference failed: {e}")))?;

        let keys: Vec<_> = outputs.keys().collect();
        let first_key = keys
            .first()
            .ok_or_else(|| EnhanceError::inference("No output tensors found"))?;
        let output_tensor = outputs
            .get(first_key)
            .ok_or_else(|| EnhanceError::inference("First output tensor not found"))?
            .try_extract_array::<f32>()
            .map_err(|e| EnhanceError::inference(format!("Failed to extract output tensor: {e}")))?;

        let output_shape = output_tensor.shape().to_vec();
        let [batch, channels, height, width] = output_shape[..] else {
            return Err(EnhanceError::inference(format!(
                "Expected 4D output tensor, got {}D",
                output_shape.len()
            )));
        };
        let output_data: Vec<f32> = output_tensor.iter().copied().collect();
        let output = Array4::from_shape_vec((batch, channels, height, width), output_data)
            .map_err(|e| EnhanceError::inference(format!("Failed to reshape output tensor: {e}")))?;

        log::trace!(
            "Tile inference {:?} -> {:?} in {:.2}ms",
            input.dim(),
            output.dim(),
            inference_start.elapsed().as_secs_f64() * 1000.0
        );

        Ok(output)
    }

    fn scale(&self) -> usize {
        self.scale
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}
