//! Model runner: inference over output files and replay of edited chains
//!
//! Every entry point works on a copy of the [`OutputFile`] and only replaces the caller's
//! value once the new render is on disk. Cancelled or failed runs leave the file exactly
//! as it was and remove any raw outputs they wrote.

use crate::{
    cache::RenderCache,
    config::EnhanceConfig,
    error::Result,
    inference::{BackendFactory, InferenceBackend},
    masks::{combine_masks, MaskRef},
    models::ModelDescriptor,
    operation::{AppliedOperation, OperationKind},
    output_file::{BaseFile, OutputFile, ReplayReport},
    postprocess::finish_step,
    processor::TileProcessor,
    services::progress::Job,
    types::PixelBuffer,
    utils::resample::resize_nearest_2d,
};
use ndarray::Array2;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{span, Level};

/// Change requested for one operation of a chain
///
/// `None` fields are left untouched. `strength: Some(None)` clears the strength, meaning
/// full effect.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationEdit {
    pub strength: Option<Option<f32>>,
    pub masks: Option<Vec<MaskRef>>,
}

impl OperationEdit {
    #[must_use]
    pub fn strength(strength: Option<f32>) -> Self {
        Self {
            strength: Some(strength),
            masks: None,
        }
    }

    #[must_use]
    pub fn masks(masks: Vec<MaskRef>) -> Self {
        Self {
            strength: None,
            masks: Some(masks),
        }
    }

    fn apply(self, operation: &mut AppliedOperation) -> Result<()> {
        if let Some(strength) = self.strength {
            operation.set_strength(strength)?;
        }
        if let Some(masks) = self.masks {
            operation.masks = masks;
        }
        Ok(())
    }
}

/// Runs one model over images, producing and maintaining operation chains
pub struct ModelRunner {
    model: ModelDescriptor,
    config: EnhanceConfig,
    processor: TileProcessor,
    factory: Arc<dyn BackendFactory>,
    cache: RenderCache,
}

impl std::fmt::Debug for ModelRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRunner")
            .field("model", &self.model)
            .field("processor", &self.processor)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl ModelRunner {
    /// Create a runner for the model at `model_key` under the configured model root
    ///
    /// # Errors
    /// - Invalid configuration
    /// - Cache directory cannot be created
    pub fn new(model_key: &str, config: EnhanceConfig, factory: Arc<dyn BackendFactory>) -> Result<Self> {
        config.validate()?;
        let model = ModelDescriptor::new(&config.model_root, model_key);
        let processor = TileProcessor::from_config(&config)?;
        let cache = RenderCache::from_config(&config)?;
        log::debug!("Created runner for {} ({})", model.name(), model.path().display());
        Ok(Self {
            model,
            config,
            processor,
            factory,
            cache,
        })
    }

    #[must_use]
    pub fn model(&self) -> &ModelDescriptor {
        &self.model
    }

    #[must_use]
    pub fn config(&self) -> &EnhanceConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &RenderCache {
        &self.cache
    }

    /// Apply the runner's model to a fresh copy of `base`
    ///
    /// Returns `Ok(None)` if the job was cancelled.
    ///
    /// # Errors
    /// - Unknown mask labels
    /// - Backend creation, initialization or inference failures
    /// - Image read or write failures
    pub fn run(
        &self,
        base: Arc<BaseFile>,
        kind: OperationKind,
        masks: Vec<MaskRef>,
        job: &Job,
    ) -> Result<Option<OutputFile>> {
        let mut file = OutputFile::fork(base);
        Ok(self.run_on_existing(&mut file, kind, masks, job)?.map(|_| file))
    }

    /// Append one operation using the runner's model to `file`'s chain
    ///
    /// The operation runs on the chain rebuilt from cached raw outputs rather than on the
    /// (possibly lossy) render, so a later replay sees the same input. Returns the new
    /// render path, or `Ok(None)` if the job was cancelled, in which case `file` is unchanged.
    ///
    /// # Errors
    /// - Unknown mask labels
    /// - Backend creation, initialization or inference failures
    /// - Image read or write failures
    pub fn run_on_existing(
        &self,
        file: &mut OutputFile,
        kind: OperationKind,
        masks: Vec<MaskRef>,
        job: &Job,
    ) -> Result<Option<PathBuf>> {
        let _span = span!(Level::INFO, "model_run", model = %self.model.name(), operation = %kind).entered();
        log::info!("🚀 Running {} with {} on {}", kind, self.model.name(), file.basename());

        file.base().masks().resolve(&masks)?;
        let mut backend = self.load_backend(&self.model)?;
        let (input, report) = file.input_at(file.operations().len(), &self.cache)?;
        if !report.is_complete() {
            log::warn!("Appending to a chain missing raw outputs for operations {:?}", report.skipped);
        }

        let scale = (self.config.maintain_scale && backend.scale() > 1).then(|| 1.0 / backend.scale() as f32);
        let mut operation = AppliedOperation::new(kind, &self.model, scale, masks);
        let base = Arc::clone(file.base());

        let Some(raw) = self.infer_step(backend.as_mut(), &base, &mut operation, &input, job)? else {
            log::info!("⏹️  {} cancelled, chain unchanged", kind);
            return Ok(None);
        };
        let raw_path = operation.raw_output_path().map(Path::to_path_buf);

        let mut next = file.clone();
        let committed = finish_step(&raw, &operation, &input).and_then(|output| {
            next.push_operation(operation);
            next.render(&output, &self.cache).map(|_| ())
        });
        if let Err(e) = committed {
            discard(raw_path.iter());
            return Err(e);
        }

        *file = next;
        log::info!("✅ {} complete: {}", kind, file.basename());
        Ok(Some(file.path().to_path_buf()))
    }

    /// Edit operation `index` of `file` and regenerate the chain from there
    ///
    /// Operations before `index` replay from their cached raw outputs. From `index` on,
    /// an operation is re-inferred only if its mask selection changed; otherwise only
    /// blending and scaling are redone. Operations whose raw output has gone missing are
    /// skipped and listed in the report. Returns `Ok(None)` if the job was cancelled, in
    /// which case `file` is unchanged.
    ///
    /// # Errors
    /// - `index` out of range or invalid edit
    /// - Unknown mask labels
    /// - Backend, inference, image read or write failures
    pub fn rerun_operation_chain(
        &self,
        file: &mut OutputFile,
        index: usize,
        edit: OperationEdit,
        job: &Job,
    ) -> Result<Option<ReplayReport>> {
        let _span = span!(Level::INFO, "chain_rerun", index = index).entered();
        let mut next = file.clone();
        edit.apply(next.operation_mut(index)?)?;

        let (image, mut report) = next.input_at(index, &self.cache)?;
        let mut written = Vec::new();
        match self.regenerate_from(&mut next, index, image, &mut report, &mut written, job) {
            Ok(true) => {
                *file = next;
                if !report.is_complete() {
                    log::warn!("Chain regenerated without operations {:?}", report.skipped);
                }
                Ok(Some(report))
            },
            Ok(false) => {
                log::info!("⏹️  Rerun cancelled, chain unchanged");
                discard(written.iter());
                Ok(None)
            },
            Err(e) => {
                discard(written.iter());
                Err(e)
            },
        }
    }

    /// Run `from..` of `file`'s chain on `image` and render the result
    ///
    /// Returns `false` if cancelled. Raw outputs written along the way are pushed to
    /// `written` so the caller can drop them if the edit is abandoned.
    fn regenerate_from(
        &self,
        file: &mut OutputFile,
        from: usize,
        mut image: PixelBuffer,
        report: &mut ReplayReport,
        written: &mut Vec<PathBuf>,
        job: &Job,
    ) -> Result<bool> {
        let base = Arc::clone(file.base());
        let mut backends: HashMap<String, Box<dyn InferenceBackend>> = HashMap::new();

        for index in from..file.operations().len() {
            let operation = file.operation_mut(index)?;
            let raw = if operation.needs_inference() {
                base.masks().resolve(&operation.masks)?;
                let backend = match backends.entry(operation.model_path.clone()) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => {
                        let model = ModelDescriptor::new(&self.config.model_root, entry.key());
                        entry.insert(self.load_backend(&model)?)
                    },
                };
                log::info!("🔁 Re-running {} for operation {}", operation.model, index);
                let Some(raw) = self.infer_step(backend.as_mut(), &base, operation, &image, job)? else {
                    return Ok(false);
                };
                written.extend(operation.raw_output_path().map(Path::to_path_buf));
                raw
            } else {
                match OutputFile::load_raw(operation, &self.cache) {
                    Some(raw) => raw,
                    None => {
                        report.skipped.push(index);
                        continue;
                    },
                }
            };
            image = finish_step(&raw, operation, &image)?;
        }

        file.render(&image, &self.cache)?;
        Ok(true)
    }

    /// Tile `input` through `backend` and cache the raw output on `operation`
    fn infer_step(
        &self,
        backend: &mut dyn InferenceBackend,
        base: &BaseFile,
        operation: &mut AppliedOperation,
        input: &PixelBuffer,
        job: &Job,
    ) -> Result<Option<PixelBuffer>> {
        let mask = self.mask_field(base, &operation.masks, input.dimensions())?;
        let Some(raw) = self.processor.process(input, backend, mask.as_ref(), job)? else {
            return Ok(None);
        };
        let path = self.cache.save_raw(&raw, base, operation)?;
        operation.record_raw_output(path);
        Ok(Some(raw))
    }

    /// Combined weight field for `masks`, resized to an image of `(width, height)`
    fn mask_field(&self, base: &BaseFile, masks: &[MaskRef], (width, height): (usize, usize)) -> Result<Option<Array2<f32>>> {
        let layers = base.masks().resolve(masks)?;
        let Some(field) = combine_masks(&layers)? else {
            return Ok(None);
        };
        if field.dim() == (height, width) {
            return Ok(Some(field));
        }
        log::debug!(
            "Resizing mask field {}x{} -> {}x{}",
            field.ncols(),
            field.nrows(),
            width,
            height
        );
        Ok(Some(resize_nearest_2d(field.view(), height, width)))
    }

    fn load_backend(&self, model: &ModelDescriptor) -> Result<Box<dyn InferenceBackend>> {
        let _span = span!(Level::DEBUG, "model_load", model = %model.name()).entered();
        let mut backend = self.factory.create_backend(self.config.backend, model)?;
        if let Some(load_time) = backend.initialize(&self.config)? {
            log::debug!("Loaded {} in {:.2}ms (scale x{})", model.name(), load_time.as_secs_f64() * 1000.0, backend.scale());
        }
        Ok(backend)
    }
}

fn discard<'a>(paths: impl Iterator<Item = &'a PathBuf>) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            log::debug!("Could not remove abandoned raw output {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::{MockBackendFactory, MockBehavior};
    use crate::masks::Mask;
    use crate::services::io::ImageIOService;
    use crate::types::{BitDepth, BoundingBox};
    use tempfile::TempDir;

    fn constant(width: usize, height: usize, value: u16) -> PixelBuffer {
        PixelBuffer::from_fn(width, height, BitDepth::Eight, |_, _, _| value).unwrap()
    }

    fn setup(behavior: MockBehavior, maintain_scale: bool) -> (TempDir, ModelRunner, MockBackendFactory, Arc<BaseFile>) {
        let dir = TempDir::new().unwrap();
        let config = EnhanceConfig::builder()
            .tile_size(16)
            .tile_padding(4)
            .maintain_scale(maintain_scale)
            .cache_dir(dir.path().join("cache"))
            .build()
            .unwrap();
        let factory = MockBackendFactory::new(behavior);
        let runner = ModelRunner::new("1x/mock.onnx", config, Arc::new(factory.clone())).unwrap();

        let path = dir.path().join("photo.png");
        ImageIOService::save_image(&constant(24, 20, 100), &path, None, 100).unwrap();
        let mut base = BaseFile::new(path);
        let weights = Array2::from_shape_fn((20, 24), |(_, x)| if x < 12 { 1.0 } else { 0.0 });
        base.masks_mut().add(Mask::new("left", weights, BoundingBox::new(0.0, 0.0, 12.0, 20.0), 0.9));
        (dir, runner, factory, Arc::new(base))
    }

    #[test]
    fn test_run_appends_operation_and_renders() {
        let (_dir, runner, _factory, base) = setup(MockBehavior::Identity, false);
        let file = runner
            .run(base, OperationKind::Sharpen, Vec::new(), &Job::new("sharpen"))
            .unwrap()
            .unwrap();

        assert_eq!(file.operations().len(), 1);
        let op = &file.operations()[0];
        assert_eq!(op.model, "1x_mock");
        assert_eq!(op.strength(), Some(0.8));
        assert!(op.raw_output_path().unwrap().exists());
        assert!(file.path().starts_with(runner.cache().cache_dir()));
        assert_eq!(file.load_current(runner.cache()).unwrap(), constant(24, 20, 100));
    }

    #[test]
    fn test_maintain_scale_restores_size() {
        let (_dir, runner, _factory, base) = setup(MockBehavior::Upscale(2), true);
        let file = runner
            .run(base, OperationKind::Upscale, Vec::new(), &Job::new("upscale"))
            .unwrap()
            .unwrap();
        let op = &file.operations()[0];
        assert_eq!(op.scale, Some(0.5));
        assert!(op.supports_strength());

        let raw = runner.cache().load(op.raw_output_path().unwrap()).unwrap();
        assert_eq!(raw.dimensions(), (48, 40));
        assert_eq!(file.load_current(runner.cache()).unwrap().dimensions(), (24, 20));
    }

    #[test]
    fn test_masked_run_leaves_outside_untouched() {
        let (_dir, runner, _factory, base) = setup(MockBehavior::Brighten(0.2), false);
        let file = runner
            .run(base, OperationKind::Denoise, vec![MaskRef::new("left", false)], &Job::new("denoise"))
            .unwrap()
            .unwrap();
        let render = file.load_current(runner.cache()).unwrap();
        assert!(render.pixels()[[10, 2, 0]] > 130);
        assert_eq!(render.pixels()[[10, 20, 0]], 100);
    }

    #[test]
    fn test_unknown_mask_fails_before_inference() {
        let (_dir, runner, factory, base) = setup(MockBehavior::Identity, false);
        let result = runner.run(base, OperationKind::Sharpen, vec![MaskRef::new("sky", false)], &Job::new("x"));
        assert!(result.is_err());
        assert_eq!(factory.inference_count(), 0);
    }

    #[test]
    fn test_cancelled_run_changes_nothing() {
        let (_dir, runner, _factory, base) = setup(MockBehavior::Identity, false);
        let mut file = OutputFile::fork(base);
        let job = Job::new("cancelled");
        job.cancel();

        let result = runner.run_on_existing(&mut file, OperationKind::Sharpen, Vec::new(), &job).unwrap();
        assert!(result.is_none());
        assert!(file.operations().is_empty());
        assert!(runner.cache().entries().unwrap().is_empty());
    }

    #[test]
    fn test_failed_run_changes_nothing() {
        let (_dir, runner, _factory, base) = setup(MockBehavior::FailAfter(1), false);
        let mut file = OutputFile::fork(Arc::clone(&base));
        let result = runner.run_on_existing(&mut file, OperationKind::Sharpen, Vec::new(), &Job::new("fail"));
        assert!(result.is_err());
        assert!(file.operations().is_empty());
        assert_eq!(file.path(), base.path());
    }

    #[test]
    fn test_strength_edit_reuses_raw_output() {
        let (_dir, runner, factory, base) = setup(MockBehavior::Brighten(0.2), false);
        let mut file = runner
            .run(base, OperationKind::Sharpen, Vec::new(), &Job::new("sharpen"))
            .unwrap()
            .unwrap();
        let before = factory.inference_count();
        let first = file.load_current(runner.cache()).unwrap().pixels()[[0, 0, 0]];

        let report = runner
            .rerun_operation_chain(&mut file, 0, OperationEdit::strength(Some(0.0)), &Job::new("edit"))
            .unwrap()
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(factory.inference_count(), before);
        assert!(first > 100);
        assert_eq!(file.load_current(runner.cache()).unwrap(), constant(24, 20, 100));
    }

    #[test]
    fn test_mask_edit_reruns_inference() {
        let (_dir, runner, factory, base) = setup(MockBehavior::Brighten(0.2), false);
        let mut file = runner
            .run(base, OperationKind::Sharpen, Vec::new(), &Job::new("sharpen"))
            .unwrap()
            .unwrap();
        let before = factory.inference_count();

        runner
            .rerun_operation_chain(
                &mut file,
                0,
                OperationEdit::masks(vec![MaskRef::new("left", true)]),
                &Job::new("edit"),
            )
            .unwrap()
            .unwrap();
        assert!(factory.inference_count() > before);
        assert!(!file.operations()[0].needs_inference());

        let render = file.load_current(runner.cache()).unwrap();
        assert_eq!(render.pixels()[[5, 2, 1]], 100);
        assert!(render.pixels()[[5, 20, 1]] > 130);
    }

    #[test]
    fn test_invalid_edit_is_rejected_atomically() {
        let (_dir, runner, _factory, base) = setup(MockBehavior::Identity, false);
        let mut file = runner
            .run(base, OperationKind::Sharpen, Vec::new(), &Job::new("sharpen"))
            .unwrap()
            .unwrap();
        let path = file.path().to_path_buf();

        assert!(runner
            .rerun_operation_chain(&mut file, 0, OperationEdit::strength(Some(2.0)), &Job::new("edit"))
            .is_err());
        assert!(runner
            .rerun_operation_chain(&mut file, 3, OperationEdit::default(), &Job::new("edit"))
            .is_err());
        assert_eq!(file.path(), path);
        assert_eq!(file.operations()[0].strength(), Some(0.8));
    }
}
