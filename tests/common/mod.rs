//! Shared fixtures for integration tests

#![allow(dead_code)]

use enhance::{
    backends::test_utils::{gradient_image, MockBackendFactory, MockBehavior},
    BaseFile, BitDepth, BoundingBox, EnhanceConfig, ImageIOService, Job, Mask, ModelRunner, ProgressReporter,
    ProgressUpdate, Result,
};
use ndarray::Array2;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const WIDTH: usize = 40;
pub const HEIGHT: usize = 28;

/// Temporary workspace with a gradient source image carrying a left-half "subject" mask
pub struct Workspace {
    pub dir: TempDir,
    pub base: Arc<BaseFile>,
}

impl Workspace {
    pub fn new() -> Result<Self> {
        Self::with_extension("png")
    }

    /// Workspace whose source image is written as `photo.<extension>`
    pub fn with_extension(extension: &str) -> Result<Self> {
        init_logging();
        let dir = TempDir::new()?;
        let path = dir.path().join("photo").with_extension(extension);
        ImageIOService::save_image(&gradient_image(WIDTH, HEIGHT, BitDepth::Eight)?, &path, None, 100)?;

        let mut base = BaseFile::new(path);
        let weights = Array2::from_shape_fn((HEIGHT, WIDTH), |(_, x)| if x < WIDTH / 2 { 1.0 } else { 0.0 });
        base.masks_mut().add(Mask::new(
            "subject",
            weights,
            BoundingBox::new(0.0, 0.0, (WIDTH / 2) as f32, HEIGHT as f32),
            0.95,
        ));
        Ok(Self {
            dir,
            base: Arc::new(base),
        })
    }

    pub fn cache_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("cache")
    }

    /// Runner for `model_key` whose backends behave as `behavior`
    pub fn runner(&self, model_key: &str, behavior: MockBehavior, maintain_scale: bool) -> Result<(ModelRunner, MockBackendFactory)> {
        let config = EnhanceConfig::builder()
            .tile_size(16)
            .tile_padding(4)
            .maintain_scale(maintain_scale)
            .cache_dir(self.cache_dir())
            .model_root(self.dir.path().join("models"))
            .build()?;
        let factory = MockBackendFactory::new(behavior);
        let runner = ModelRunner::new(model_key, config, Arc::new(factory.clone()))?;
        Ok((runner, factory))
    }
}

/// Whether two images on disk decode to identical pixels
pub fn same_pixels(a: &Path, b: &Path) -> Result<bool> {
    Ok(ImageIOService::load_image(a)? == ImageIOService::load_image(b)?)
}

/// Route `log` output through the test harness so warnings show up on failures
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Progress reporter that cancels its job once `tiles` tiles have completed
pub struct CancelAfter {
    tiles: usize,
    job: Mutex<Option<Arc<Job>>>,
}

impl CancelAfter {
    /// A job wired to cancel itself after `tiles` tiles
    pub fn job(label: &str, tiles: usize) -> Arc<Job> {
        let reporter = Arc::new(Self {
            tiles,
            job: Mutex::new(None),
        });
        let job = Arc::new(Job::with_reporter(label, reporter.clone()));
        *reporter.job.lock().expect("lock") = Some(Arc::clone(&job));
        job
    }
}

impl ProgressReporter for CancelAfter {
    fn report_progress(&self, update: &ProgressUpdate) {
        if update.completed >= self.tiles {
            if let Some(job) = self.job.lock().ok().and_then(|j| j.clone()) {
                job.cancel();
            }
        }
    }

    fn report_error(&self, _label: &str, _error: &str) {}
}
