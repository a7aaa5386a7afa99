//! Tract backend implementation for enhancement models
//!
//! Pure Rust inference with no native dependencies. Tile shapes are fixed per run, so
//! the model is optimized once for the shape it is fed and runs on the CPU.

use crate::config::EnhanceConfig;
use crate::error::{EnhanceError, Result};
use crate::inference::{scale_from_probe, InferenceBackend, SCALE_PROBE_SIZE};
use ndarray::Array4;
use std::path::PathBuf;
use tract_onnx::prelude::*;

/// Type alias for the complex Tract model type to reduce complexity warnings
type TractModel = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

// Use instant crate for cross-platform time compatibility
use instant::{Duration, Instant};

/// Tract backend for running enhancement models using pure Rust inference
#[derive(Debug)]
pub struct TractBackend {
    model_path: PathBuf,
    model: Option<TractModel>,
    scale: usize,
    initialized: bool,
}

impl TractBackend {
    /// Create a backend for the model file at `model_path`
    #[must_use]
    pub fn new(model_path: PathBuf) -> Self {
        Self {
            model_path,
            model: None,
            scale: 1,
            initialized: false,
        }
    }

    fn load_model(&mut self) -> Result<Duration> {
        let model_load_start = Instant::now();

        let model_data = std::fs::read(&self.model_path)
            .map_err(|e| EnhanceError::file_io_error("read model", &self.model_path, &e))?;

        log::info!("🚀 Initializing Tract backend");
        log::info!("🧠 Model: {}", self.model_path.display());
        #[allow(clippy::cast_precision_loss)]
        let size_mb = model_data.len() as f64 / (1024.0 * 1024.0);
        log::debug!("📏 Model size: {size_mb:.2} MB");

        let model = onnx()
            .model_for_read(&mut std::io::Cursor::new(model_data))
            .map_err(|e| EnhanceError::model(format!("Failed to load ONNX model: {e}")))?
            .into_optimized()
            .map_err(|e| EnhanceError::model(format!("Failed to optimize model: {e}")))?
            .into_runnable()
            .map_err(|e| EnhanceError::model(format!("Failed to create runnable model: {e}")))?;

        self.model = Some(model);
        self.initialized = true;

        let probe = Array4::<f32>::zeros((1, 3, SCALE_PROBE_SIZE, SCALE_PROBE_SIZE));
        let scale = self
            .infer(&probe)
            .and_then(|output| scale_from_probe((SCALE_PROBE_SIZE, SCALE_PROBE_SIZE), &output));
        match scale {
            Ok(scale) => self.scale = scale,
            Err(e) => {
                self.model = None;
                self.initialized = false;
                return Err(e);
            },
        }

        let model_load_time = model_load_start.elapsed();
        log::info!(
            "✅ Tract backend initialized in {}ms (scale x{})",
            model_load_time.as_millis(),
            self.scale
        );
        Ok(model_load_time)
    }
}

impl InferenceBackend for TractBackend {
    fn initialize(&mut self, _config: &EnhanceConfig) -> Result<Option<Duration>> {
        if self.initialized {
            return Ok(None);
        }
        let model_load_time = self.load_model()?;
        Ok(Some(model_load_time))
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| EnhanceError::inference("Tract model not initialized"))?;

        let inference_start = Instant::now();
        let input_tensor = Tensor::from(input.clone());

        let outputs = model
            .run(tvec![input_tensor.into()])
            .map_err(|e| EnhanceError::inference(format!("Tract inference failed: {e}")))?;

        let output_tensor = outputs
            .into_iter()
            .next()
            .ok_or_else(|| EnhanceError::inference("No output tensor found"))?
            .into_arc_tensor();

        let output_data = output_tensor.to_array_view::<f32>().map_err(|e| {
            EnhanceError::inference(format!("Failed to convert output tensor: {e}"))
        })?;

        let output_shape = output_data.shape().to_vec();
        let [batch, channels, height, width] = output_shape[..] else {
            return Err(EnhanceError::inference(format!(
                "Expected 4D output tensor, got {}D",
                output_shape.len()
            )));
        };

        let output_array = Array4::from_shape_vec(
            (batch, channels, height, width),
            output_data.iter().copied().collect(),
        )
        .map_err(|e| EnhanceError::inference(format!("Failed to reshape output tensor: {e}")))?;

        log::trace!(
            "Tract tile inference {:?} -> {:?} in {}ms",
            input.dim(),
            output_array.dim(),
            inference_start.elapsed().as_millis()
        );

        Ok(output_array)
    }

    fn scale(&self) -> usize {
        self.scale
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}
