//! Deterministic in-process backends for tests and benchmarks
//!
//! These implement [`InferenceBackend`] without model files, so tiling, masking and
//! chain replay can be exercised with exactly predictable model output.

use crate::{
    config::EnhanceConfig,
    error::{EnhanceError, Result},
    inference::{BackendFactory, BackendType, InferenceBackend},
    models::ModelDescriptor,
    types::{BitDepth, PixelBuffer},
};
use instant::Duration;
use ndarray::Array4;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// What a [`MockBackend`] does to each tile
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockBehavior {
    /// Return the tile unchanged (scale 1)
    Identity,
    /// Nearest-neighbour upscale by an integer factor
    Upscale(usize),
    /// Add a constant to every normalized sample (scale 1)
    Brighten(f32),
    /// Behave as identity for `after` calls, then fail every call
    FailAfter(usize),
}

/// Mock backend for testing
#[derive(Debug, Clone)]
pub struct MockBackend {
    behavior: MockBehavior,
    initialized: bool,
    should_fail_init: bool,
    inferences: Arc<AtomicUsize>,
    call_history: Arc<Mutex<Vec<String>>>,
}

impl MockBackend {
    #[must_use]
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            initialized: false,
            should_fail_init: false,
            inferences: Arc::new(AtomicUsize::new(0)),
            call_history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn identity() -> Self {
        Self::new(MockBehavior::Identity)
    }

    #[must_use]
    pub fn upscale(scale: usize) -> Self {
        Self::new(MockBehavior::Upscale(scale.max(1)))
    }

    #[must_use]
    pub fn brighten(delta: f32) -> Self {
        Self::new(MockBehavior::Brighten(delta))
    }

    #[must_use]
    pub fn failing_after(calls: usize) -> Self {
        Self::new(MockBehavior::FailAfter(calls))
    }

    /// Create a mock backend that will fail during initialization
    #[must_use]
    pub fn new_failing_init(behavior: MockBehavior) -> Self {
        let mut backend = Self::new(behavior);
        backend.should_fail_init = true;
        backend
    }

    /// Share an inference counter with other backends
    #[must_use]
    pub fn with_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.inferences = counter;
        self
    }

    /// Number of `infer` calls made so far
    #[must_use]
    pub fn inference_count(&self) -> usize {
        self.inferences.load(Ordering::SeqCst)
    }

    /// Get the call history for verification in tests
    #[must_use]
    pub fn get_call_history(&self) -> Vec<String> {
        self.call_history
            .lock()
            .map(|history| history.clone())
            .unwrap_or_default()
    }

    fn record_call(&self, call: String) {
        if let Ok(mut history) = self.call_history.lock() {
            history.push(call);
        }
    }
}

impl InferenceBackend for MockBackend {
    fn initialize(&mut self, _config: &EnhanceConfig) -> Result<Option<Duration>> {
        self.record_call("initialize".to_string());
        if self.should_fail_init {
            return Err(EnhanceError::model("Mock initialization failure"));
        }
        if self.initialized {
            return Ok(None);
        }
        self.initialized = true;
        Ok(Some(Duration::from_millis(1)))
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let call = self.inferences.fetch_add(1, Ordering::SeqCst);
        self.record_call(format!("infer {:?}", input.dim()));

        match self.behavior {
            MockBehavior::Identity => Ok(input.clone()),
            MockBehavior::Brighten(delta) => Ok(input.mapv(|v| v + delta)),
            MockBehavior::Upscale(scale) => {
                let (batch, channels, height, width) = input.dim();
                Ok(Array4::from_shape_fn(
                    (batch, channels, height * scale, width * scale),
                    |(b, c, y, x)| input[[b, c, y / scale, x / scale]],
                ))
            },
            MockBehavior::FailAfter(limit) => {
                if call >= limit {
                    Err(EnhanceError::inference("Mock inference failure"))
                } else {
                    Ok(input.clone())
                }
            },
        }
    }

    fn scale(&self) -> usize {
        match self.behavior {
            MockBehavior::Upscale(scale) => scale,
            _ => 1,
        }
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}

/// Factory handing out [`MockBackend`]s that share one inference counter
#[derive(Debug, Clone)]
pub struct MockBackendFactory {
    behavior: MockBehavior,
    created: Arc<AtomicUsize>,
    inferences: Arc<AtomicUsize>,
    should_fail_creation: bool,
}

impl MockBackendFactory {
    #[must_use]
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            created: Arc::new(AtomicUsize::new(0)),
            inferences: Arc::new(AtomicUsize::new(0)),
            should_fail_creation: false,
        }
    }

    /// Create a factory whose `create_backend` always fails
    #[must_use]
    pub fn new_creation_failing() -> Self {
        let mut factory = Self::new(MockBehavior::Identity);
        factory.should_fail_creation = true;
        factory
    }

    #[must_use]
    pub fn backends_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Total `infer` calls across every backend this factory created
    #[must_use]
    pub fn inference_count(&self) -> usize {
        self.inferences.load(Ordering::SeqCst)
    }
}

impl BackendFactory for MockBackendFactory {
    fn create_backend(
        &self,
        _backend_type: BackendType,
        model: &ModelDescriptor,
    ) -> Result<Box<dyn InferenceBackend>> {
        if self.should_fail_creation {
            return Err(EnhanceError::model(format!(
                "Mock backend creation failure for {}",
                model.name()
            )));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(
            MockBackend::new(self.behavior).with_counter(Arc::clone(&self.inferences)),
        ))
    }

    fn available_backends(&self) -> Vec<BackendType> {
        vec![BackendType::Onnx, BackendType::Tract]
    }
}

/// Deterministic gradient image with distinct values per channel
///
/// # Errors
/// - Zero width or height
pub fn gradient_image(width: usize, height: usize, depth: BitDepth) -> Result<PixelBuffer> {
    let max = match depth {
        BitDepth::Eight => 255,
        BitDepth::Sixteen => 65535,
    };
    PixelBuffer::from_fn(width, height, depth, |y, x, c| {
        ((x * 7 + y * 13 + c * 50) % (max + 1)) as u16
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upscale_mock_replicates_pixels() {
        let mut backend = MockBackend::upscale(2);
        let input = Array4::from_shape_fn((1, 3, 2, 2), |(_, c, y, x)| (c + y * 2 + x) as f32);
        let output = backend.infer(&input).unwrap();
        assert_eq!(output.dim(), (1, 3, 4, 4));
        assert_eq!(output[[0, 1, 3, 3]], input[[0, 1, 1, 1]]);
        assert_eq!(backend.scale(), 2);
    }

    #[test]
    fn test_failing_mock_fails_after_limit() {
        let mut backend = MockBackend::failing_after(1);
        let input = Array4::<f32>::zeros((1, 3, 4, 4));
        assert!(backend.infer(&input).is_ok());
        assert!(backend.infer(&input).is_err());
        assert_eq!(backend.inference_count(), 2);
    }

    #[test]
    fn test_factory_shares_counter() {
        let factory = MockBackendFactory::new(MockBehavior::Identity);
        let model = ModelDescriptor::new("models", "x1/identity.onnx");
        let mut a = factory.create_backend(BackendType::Onnx, &model).unwrap();
        let mut b = factory.create_backend(BackendType::Tract, &model).unwrap();
        let input = Array4::<f32>::zeros((1, 3, 2, 2));
        a.infer(&input).unwrap();
        b.infer(&input).unwrap();
        assert_eq!(factory.backends_created(), 2);
        assert_eq!(factory.inference_count(), 2);
    }

    #[test]
    fn test_failing_init() {
        let mut backend = MockBackend::new_failing_init(MockBehavior::Identity);
        assert!(backend.initialize(&EnhanceConfig::default()).is_err());
        assert!(!backend.is_initialized());
        assert_eq!(backend.get_call_history(), vec!["initialize".to_string()]);
    }
}
