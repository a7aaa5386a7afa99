//! Source images and the operation chains rendered from them
//!
//! An [`OutputFile`]'s `path` is the render of exactly its operation list. It only
//! changes through `commit_path`, and every edit path below works on a copy of the file
//! that is committed only once its new render is on disk.

use crate::{
    cache::RenderCache,
    error::{EnhanceError, Result},
    masks::MaskSet,
    operation::AppliedOperation,
    postprocess::finish_step,
    services::io::ImageIOService,
    types::PixelBuffer,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{span, Level};

/// A pristine source image and the subject masks detected on it
#[derive(Debug, Clone)]
pub struct BaseFile {
    path: PathBuf,
    masks: MaskSet,
}

impl BaseFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            masks: MaskSet::new(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn basename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Lowercase extension without the dot
    #[must_use]
    pub fn extension(&self) -> Option<String> {
        self.path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
    }

    #[must_use]
    pub fn masks(&self) -> &MaskSet {
        &self.masks
    }

    pub fn masks_mut(&mut self) -> &mut MaskSet {
        &mut self.masks
    }

    /// # Errors
    /// - Missing or undecodable source
    pub fn load(&self) -> Result<PixelBuffer> {
        ImageIOService::load_image(&self.path)
    }
}

/// Outcome of a chain replay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Indices of operations whose raw output was missing and whose effect was dropped
    pub skipped: Vec<usize>,
}

impl ReplayReport {
    /// Whether every operation contributed to the render
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// An ordered chain of operations applied to a [`BaseFile`]
#[derive(Debug, Clone)]
pub struct OutputFile {
    base: Arc<BaseFile>,
    operations: Vec<AppliedOperation>,
    path: PathBuf,
    saved: bool,
}

impl OutputFile {
    /// An operation-less copy of `base`, rendering as the base itself
    #[must_use]
    pub fn fork(base: Arc<BaseFile>) -> Self {
        let path = base.path().to_path_buf();
        Self {
            base,
            operations: Vec::new(),
            path,
            saved: false,
        }
    }

    #[must_use]
    pub fn base(&self) -> &Arc<BaseFile> {
        &self.base
    }

    #[must_use]
    pub fn operations(&self) -> &[AppliedOperation] {
        &self.operations
    }

    /// Current render of the whole chain
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn basename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Whether the current render has been copied out with [`save_to`](Self::save_to)
    #[must_use]
    pub fn is_saved(&self) -> bool {
        self.saved
    }

    /// # Errors
    /// - Missing or undecodable render
    pub fn load_current(&self, cache: &RenderCache) -> Result<PixelBuffer> {
        cache.load(&self.path)
    }

    /// Append an operation; the caller must [`render`](Self::render) afterwards
    pub(crate) fn push_operation(&mut self, operation: AppliedOperation) {
        self.operations.push(operation);
    }

    pub(crate) fn operation_mut(&mut self, index: usize) -> Result<&mut AppliedOperation> {
        let len = self.operations.len();
        self.operations
            .get_mut(index)
            .ok_or_else(|| EnhanceError::invalid_config(format!("No operation {index} (chain has {len})")))
    }

    /// Write `image` as the render of the current chain and point `path` at it
    ///
    /// # Errors
    /// - Encoding or write failures; `path` is left unchanged
    pub fn render(&mut self, image: &PixelBuffer, cache: &RenderCache) -> Result<&Path> {
        let path = cache.save_render(image, &self.base, &self.operations)?;
        self.commit_path(path);
        Ok(&self.path)
    }

    /// Point the file at a new render, which has not been saved out yet
    fn commit_path(&mut self, path: PathBuf) {
        self.path = path;
        self.saved = false;
    }

    /// Copy the current render into `dir` under its cache name
    ///
    /// # Errors
    /// - Copy failures
    pub fn save_to<P: AsRef<Path>>(&mut self, dir: P) -> Result<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| EnhanceError::file_io_error("create output directory", dir, &e))?;
        let target = dir.join(self.basename());
        fs::copy(&self.path, &target).map_err(|e| EnhanceError::file_io_error("copy render", &target, &e))?;
        self.saved = true;
        log::info!("📁 Saved {}", target.display());
        Ok(target)
    }

    /// Rebuild the image entering operation `index` from cached raw outputs
    ///
    /// Operations whose raw output is missing are skipped with a warning and listed in
    /// the returned report.
    ///
    /// # Errors
    /// - `index` past the end of the chain
    /// - Unreadable base file
    pub fn input_at(&self, index: usize, cache: &RenderCache) -> Result<(PixelBuffer, ReplayReport)> {
        if index > self.operations.len() {
            return Err(EnhanceError::invalid_config(format!(
                "No operation {index} (chain has {})",
                self.operations.len()
            )));
        }
        let mut report = ReplayReport::default();
        let image = self.replay_range(self.base.load()?, 0..index, cache, &mut report)?;
        Ok((image, report))
    }

    /// Apply operations `range` to `image` from their cached raw outputs
    pub(crate) fn replay_range(
        &self,
        mut image: PixelBuffer,
        range: std::ops::Range<usize>,
        cache: &RenderCache,
        report: &mut ReplayReport,
    ) -> Result<PixelBuffer> {
        let _span = span!(Level::INFO, "chain_replay", from = range.start, to = range.end).entered();
        for index in range {
            let Some(operation) = self.operations.get(index) else {
                break;
            };
            let Some(raw) = Self::load_raw(operation, cache) else {
                report.skipped.push(index);
                continue;
            };
            image = finish_step(&raw, operation, &image)?;
        }
        Ok(image)
    }

    pub(crate) fn load_raw(operation: &AppliedOperation, cache: &RenderCache) -> Option<PixelBuffer> {
        let Some(path) = operation.raw_output_path() else {
            log::warn!("No raw output recorded for {}{}, skipping", operation.kind, operation.path_extra());
            return None;
        };
        if !path.exists() {
            log::warn!("Raw output not found: {}, skipping", path.display());
            return None;
        }
        match cache.load(path) {
            Ok(raw) => Some(raw),
            Err(e) => {
                log::warn!("Could not read raw output {}: {e}, skipping", path.display());
                None
            },
        }
    }

    /// Re-render the whole chain from the base using cached raw outputs
    ///
    /// Used after strength edits: no inference runs.
    ///
    /// # Errors
    /// - Unreadable base file or render write failures; the file is left unchanged
    pub fn reapply_strength(&mut self, cache: &RenderCache) -> Result<ReplayReport> {
        let (image, report) = self.input_at(self.operations.len(), cache)?;
        self.render(&image, cache)?;
        if !report.is_complete() {
            log::warn!("Replay dropped {} operations: {:?}", report.skipped.len(), report.skipped);
        }
        Ok(report)
    }

    /// Change one operation's strength and replay the chain
    ///
    /// # Errors
    /// - Unknown index or out-of-range strength
    /// - Replay failures; the file is left unchanged
    pub fn set_strength(&mut self, index: usize, strength: Option<f32>, cache: &RenderCache) -> Result<ReplayReport> {
        let mut next = self.clone();
        next.operation_mut(index)?.set_strength(strength)?;
        let report = next.reapply_strength(cache)?;
        *self = next;
        Ok(report)
    }

    /// Truncate the chain to its first `index` operations and re-render
    ///
    /// An index at or past the end leaves the file untouched.
    ///
    /// # Errors
    /// - Replay failures; the file is left unchanged
    pub fn remove_operations_from(&mut self, index: usize, cache: &RenderCache) -> Result<ReplayReport> {
        if index >= self.operations.len() {
            return Ok(ReplayReport::default());
        }
        let mut next = self.clone();
        next.operations.truncate(index);
        let report = if next.operations.is_empty() {
            let base_path = next.base.path().to_path_buf();
            next.commit_path(base_path);
            ReplayReport::default()
        } else {
            next.reapply_strength(cache)?
        };
        *self = next;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::gradient_image;
    use crate::models::ModelDescriptor;
    use crate::operation::OperationKind;
    use crate::types::BitDepth;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        cache: RenderCache,
        file: OutputFile,
    }

    /// A two-step sharpen chain whose raw outputs are constant images
    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let cache = RenderCache::new(dir.path().join("cache")).unwrap();
        let base_path = dir.path().join("base.png");
        let source = PixelBuffer::from_fn(4, 4, BitDepth::Eight, |_, _, _| 100).unwrap();
        ImageIOService::save_image(&source, &base_path, None, 100).unwrap();

        let mut file = OutputFile::fork(Arc::new(BaseFile::new(base_path)));
        let model = ModelDescriptor::new("models", "1x/sharpen.onnx");
        for value in [200, 0] {
            let raw = PixelBuffer::from_fn(4, 4, BitDepth::Eight, |_, _, _| value).unwrap();
            let mut op = AppliedOperation::new(OperationKind::Sharpen, &model, None, Vec::new());
            op.record_raw_output(cache.save_raw(&raw, file.base(), &op).unwrap());
            file.push_operation(op);
        }
        file.reapply_strength(&cache).unwrap();
        Fixture { _dir: dir, cache, file }
    }

    fn value(file: &OutputFile, cache: &RenderCache) -> u16 {
        file.load_current(cache).unwrap().pixels()[[0, 0, 0]]
    }

    #[test]
    fn test_fork_renders_as_base() {
        let base = Arc::new(BaseFile::new("/photos/a.jpg"));
        let file = OutputFile::fork(Arc::clone(&base));
        assert_eq!(file.path(), Path::new("/photos/a.jpg"));
        assert!(file.operations().is_empty());
        assert!(!file.is_saved());
        assert_eq!(base.stem(), "a");
        assert_eq!(base.extension().as_deref(), Some("jpg"));
    }

    #[test]
    fn test_replay_composes_steps() {
        let f = fixture();
        // 0.8 * 200 + 0.2 * 100 = 180, then 0.8 * 0 + 0.2 * 180 = 36
        assert_eq!(value(&f.file, &f.cache), 36);
    }

    #[test]
    fn test_set_strength_replays() {
        let mut f = fixture();
        let before = f.file.path().to_path_buf();
        f.file.set_strength(1, Some(0.5), &f.cache).unwrap();
        assert_eq!(value(&f.file, &f.cache), 90);
        assert_ne!(f.file.path(), before);
        assert_eq!(f.file.operations()[1].strength(), Some(0.5));
    }

    #[test]
    fn test_invalid_strength_leaves_file_untouched() {
        let mut f = fixture();
        let before = f.file.path().to_path_buf();
        assert!(f.file.set_strength(0, Some(2.0), &f.cache).is_err());
        assert!(f.file.set_strength(5, Some(0.5), &f.cache).is_err());
        assert_eq!(f.file.path(), before);
        assert_eq!(f.file.operations()[0].strength(), Some(0.8));
    }

    #[test]
    fn test_missing_raw_output_is_skipped_and_reported() {
        let mut f = fixture();
        fs::remove_file(f.file.operations()[0].raw_output_path().unwrap()).unwrap();
        let report = f.file.reapply_strength(&f.cache).unwrap();
        assert_eq!(report.skipped, vec![0]);
        // Only the second step applies: 0.8 * 0 + 0.2 * 100 = 20
        assert_eq!(value(&f.file, &f.cache), 20);
    }

    #[test]
    fn test_input_at() {
        let f = fixture();
        let (input, report) = f.file.input_at(1, &f.cache).unwrap();
        assert!(report.is_complete());
        assert_eq!(input.pixels()[[1, 1, 2]], 180);
        assert!(f.file.input_at(3, &f.cache).is_err());
    }

    #[test]
    fn test_remove_operations_from() {
        let mut f = fixture();
        f.file.remove_operations_from(1, &f.cache).unwrap();
        assert_eq!(f.file.operations().len(), 1);
        assert_eq!(value(&f.file, &f.cache), 180);

        f.file.remove_operations_from(0, &f.cache).unwrap();
        assert!(f.file.operations().is_empty());
        assert_eq!(f.file.path(), f.file.base().path());
    }

    #[test]
    fn test_truncation_clears_saved_flag() {
        let mut f = fixture();
        let out = TempDir::new().unwrap();
        f.file.save_to(out.path()).unwrap();
        f.file.remove_operations_from(1, &f.cache).unwrap();
        assert!(!f.file.is_saved());

        f.file.save_to(out.path()).unwrap();
        f.file.remove_operations_from(0, &f.cache).unwrap();
        assert!(!f.file.is_saved());
        assert_eq!(f.file.path(), f.file.base().path());
    }

    #[test]
    fn test_save_to_marks_saved_until_next_render() {
        let mut f = fixture();
        let out = TempDir::new().unwrap();
        let target = f.file.save_to(out.path()).unwrap();
        assert!(target.exists());
        assert_eq!(target.file_name(), f.file.path().file_name());
        assert!(f.file.is_saved());

        let image = gradient_image(4, 4, BitDepth::Eight).unwrap();
        f.file.render(&image, &f.cache).unwrap();
        assert!(!f.file.is_saved());
    }
}
