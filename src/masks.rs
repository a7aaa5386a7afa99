//! Subject masks, per-operation mask selection and mask-field combination

use crate::{
    error::{EnhanceError, Result},
    services::progress::Job,
    types::{BoundingBox, PixelBuffer},
};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// Weight field for one detected subject, aligned to its source image
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    label: String,
    unique_label: String,
    weights: Array2<f32>,
    bbox: BoundingBox,
    score: f32,
}

impl Mask {
    #[must_use]
    pub fn new<S: Into<String>>(label: S, weights: Array2<f32>, bbox: BoundingBox, score: f32) -> Self {
        let label = label.into();
        Self {
            unique_label: label.clone(),
            label,
            weights,
            bbox,
            score,
        }
    }

    /// Detector label, shared by every subject of the same kind
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Label that identifies this mask within its [`MaskSet`]
    #[must_use]
    pub fn unique_label(&self) -> &str {
        &self.unique_label
    }

    #[must_use]
    pub fn weights(&self) -> &Array2<f32> {
        &self.weights
    }

    #[must_use]
    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    #[must_use]
    pub fn score(&self) -> f32 {
        self.score
    }

    /// `(width, height)` of the weight field
    #[must_use]
    pub fn dimensions(&self) -> (usize, usize) {
        let (height, width) = self.weights.dim();
        (width, height)
    }

    /// Weights scaled into `[0, 1]`; fields with a maximum above 1 are divided by it
    #[must_use]
    pub fn normalized(&self) -> Array2<f32> {
        let max = self.weights.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if max > 1.0 {
            self.weights.mapv(|v| v / max)
        } else {
            self.weights.clone()
        }
    }

    /// Snapshot of this mask for attaching to one operation
    #[must_use]
    pub fn reference(&self, inverted: bool) -> MaskRef {
        MaskRef::new(self.unique_label.clone(), inverted)
    }
}

/// Mask selection recorded on an operation
///
/// Each operation owns its own `inverted` flag, so toggling it on one operation never
/// affects another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MaskRef {
    pub label: String,
    pub inverted: bool,
}

impl MaskRef {
    pub fn new<S: Into<String>>(label: S, inverted: bool) -> Self {
        Self {
            label: label.into(),
            inverted,
        }
    }
}

/// A mask together with the polarity it is applied with
#[derive(Debug, Clone, Copy)]
pub struct MaskLayer<'a> {
    pub mask: &'a Mask,
    pub inverted: bool,
}

/// Masks detected on one source image, keyed by unique label
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaskSet {
    masks: Vec<Mask>,
}

impl MaskSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mask, assigning `label`, `label_1`, `label_2`, … for repeated subjects
    ///
    /// Returns the unique label given to the mask.
    pub fn add(&mut self, mut mask: Mask) -> String {
        let count = self.masks.iter().filter(|m| m.label == mask.label).count();
        mask.unique_label = if count == 0 {
            mask.label.clone()
        } else {
            format!("{}_{count}", mask.label)
        };
        let unique = mask.unique_label.clone();
        self.masks.push(mask);
        unique
    }

    #[must_use]
    pub fn get(&self, unique_label: &str) -> Option<&Mask> {
        self.masks.iter().find(|m| m.unique_label == unique_label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mask> {
        self.masks.iter()
    }

    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        self.masks.iter().map(Mask::unique_label).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.masks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    pub fn clear(&mut self) {
        self.masks.clear();
    }

    /// Look up every referenced mask
    ///
    /// # Errors
    /// - A reference names a label not in this set
    pub fn resolve<'a>(&'a self, refs: &[MaskRef]) -> Result<Vec<MaskLayer<'a>>> {
        refs.iter()
            .map(|r| {
                self.get(&r.label)
                    .map(|mask| MaskLayer {
                        mask,
                        inverted: r.inverted,
                    })
                    .ok_or_else(|| {
                        EnhanceError::invalid_config(format!("Unknown mask label '{}'", r.label))
                    })
            })
            .collect()
    }
}

/// Merge mask layers into one weight field
///
/// Inside layers are unioned with an elementwise maximum, starting from all ones when
/// there are none. Every inverted layer then removes its region through an elementwise
/// minimum with `1 - weight`. An empty list means no masking and yields `None`.
///
/// # Errors
/// - Layers with differing dimensions
pub fn combine_masks(layers: &[MaskLayer<'_>]) -> Result<Option<Array2<f32>>> {
    let Some(first) = layers.first() else {
        return Ok(None);
    };
    let shape = first.mask.weights().dim();
    if let Some(bad) = layers.iter().find(|l| l.mask.weights().dim() != shape) {
        return Err(EnhanceError::invalid_config(format!(
            "Mask '{}' is {:?}, expected {:?}",
            bad.mask.unique_label(),
            bad.mask.weights().dim(),
            shape
        )));
    }

    let mut inside = layers.iter().filter(|l| !l.inverted).peekable();
    let mut combined = if inside.peek().is_some() {
        let mut union = Array2::<f32>::zeros(shape);
        for layer in inside {
            Zip::from(&mut union)
                .and(&layer.mask.normalized())
                .for_each(|acc, &w| *acc = acc.max(w));
        }
        union
    } else {
        Array2::<f32>::ones(shape)
    };

    for layer in layers.iter().filter(|l| l.inverted) {
        Zip::from(&mut combined)
            .and(&layer.mask.normalized())
            .for_each(|acc, &w| *acc = acc.min(1.0 - w));
    }

    Ok(Some(combined))
}

/// A detected subject
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub bbox: BoundingBox,
}

/// Segmentation of one detected subject
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub label: String,
    pub weights: Array2<f32>,
    pub score: f32,
    pub bbox: BoundingBox,
}

/// Finds labelled subjects in an image
pub trait SubjectDetector: Send {
    /// # Errors
    /// - Detector model failures
    fn detect(&mut self, image: &PixelBuffer) -> Result<Vec<Detection>>;
}

/// Produces a weight field for each detected subject
pub trait Segmenter: Send {
    /// # Errors
    /// - Segmenter model failures
    fn segment(&mut self, image: &PixelBuffer, detections: &[Detection]) -> Result<Vec<Segment>>;
}

/// Detection followed by segmentation, filling a [`MaskSet`]
pub struct MaskGenerator<D, S> {
    detector: D,
    segmenter: S,
}

impl<D: SubjectDetector, S: Segmenter> MaskGenerator<D, S> {
    pub fn new(detector: D, segmenter: S) -> Self {
        Self { detector, segmenter }
    }

    /// Detect and segment subjects, replacing `masks` when anything is found
    ///
    /// Returns the number of masks added, `Some(0)` when nothing was detected (the set is
    /// then left alone), or `None` when cancelled between the two steps.
    ///
    /// # Errors
    /// - Detector or segmenter failures
    /// - Segments whose dimensions differ from the image
    pub fn generate(&mut self, image: &PixelBuffer, masks: &mut MaskSet, job: &Job) -> Result<Option<usize>> {
        job.start(2);

        let detections = self.detector.detect(image)?;
        job.advance(1);
        log::debug!("Detected {} subjects", detections.len());
        if job.is_cancelled() {
            return Ok(None);
        }
        if detections.is_empty() {
            return Ok(Some(0));
        }

        let segments = self.segmenter.segment(image, &detections)?;
        let expected = (image.height(), image.width());
        if let Some(bad) = segments.iter().find(|s| s.weights.dim() != expected) {
            return Err(EnhanceError::processing(format!(
                "Segment '{}' is {:?}, expected {:?}",
                bad.label,
                bad.weights.dim(),
                expected
            )));
        }

        let added = segments.len();
        if added > 0 {
            masks.clear();
            for segment in segments {
                let label = masks.add(Mask::new(segment.label, segment.weights, segment.bbox, segment.score));
                log::debug!("Added mask '{label}'");
            }
        }
        job.advance(1);
        log::info!("🎭 Generated {added} masks");
        Ok(Some(added))
    }
}
