//! Operation records for an output file's chain

use crate::{
    error::{EnhanceError, Result},
    masks::MaskRef,
    models::ModelDescriptor,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Kind of model transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Sharpen,
    Denoise,
    Upscale,
}

impl OperationKind {
    pub const ALL: [Self; 3] = [Self::Sharpen, Self::Denoise, Self::Upscale];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sharpen => "sharpen",
            Self::Denoise => "denoise",
            Self::Upscale => "upscale",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationKind {
    type Err = EnhanceError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                EnhanceError::invalid_config(format!(
                    "Unknown operation '{s}' (expected sharpen, denoise or upscale)"
                ))
            })
    }
}

/// One step of an output file's chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedOperation {
    pub kind: OperationKind,
    /// Model display name
    pub model: String,
    /// Model key relative to the model root, used to re-run the step
    pub model_path: String,
    strength: Option<f32>,
    /// Post-inference resize ratio; below 1 restores the pre-upscale size
    pub scale: Option<f32>,
    pub masks: Vec<MaskRef>,
    raw_output_path: Option<PathBuf>,
    #[serde(default)]
    raw_masks: Vec<MaskRef>,
}

impl AppliedOperation {
    /// Strength given to operations that support blending when none is requested
    pub const DEFAULT_STRENGTH: f32 = 0.8;

    /// Record a new step; a scale that is not a positive finite ratio is dropped
    #[must_use]
    pub fn new(kind: OperationKind, model: &ModelDescriptor, scale: Option<f32>, masks: Vec<MaskRef>) -> Self {
        let scale = scale.filter(|s| {
            let valid = s.is_finite() && *s > 0.0;
            if !valid {
                log::warn!("Ignoring invalid scale {s} for {kind} with {}", model.name());
            }
            valid
        });
        let mut operation = Self {
            kind,
            model: model.name().to_string(),
            model_path: model.key().to_string(),
            strength: None,
            scale,
            masks,
            raw_output_path: None,
            raw_masks: Vec::new(),
        };
        if operation.supports_strength() {
            operation.strength = Some(Self::DEFAULT_STRENGTH);
        }
        operation
    }

    /// Builder form of [`set_strength`](Self::set_strength)
    ///
    /// # Errors
    /// - Strength outside `[0, 1]`
    pub fn with_strength(mut self, strength: Option<f32>) -> Result<Self> {
        self.set_strength(strength)?;
        Ok(self)
    }

    #[must_use]
    pub fn strength(&self) -> Option<f32> {
        self.strength
    }

    /// Set the blend strength; `None` means full effect
    ///
    /// # Errors
    /// - Strength outside `[0, 1]` or not finite
    pub fn set_strength(&mut self, strength: Option<f32>) -> Result<()> {
        if let Some(s) = strength {
            if !(0.0..=1.0).contains(&s) {
                return Err(EnhanceError::config_value_error("strength", s, "0.0-1.0", Some(Self::DEFAULT_STRENGTH)));
            }
        }
        self.strength = strength;
        Ok(())
    }

    /// Whether strength blending applies to this operation at all
    ///
    /// Sharpen and denoise always blend; upscale only when followed by a downscale.
    #[must_use]
    pub fn supports_strength(&self) -> bool {
        match self.kind {
            OperationKind::Sharpen | OperationKind::Denoise => true,
            OperationKind::Upscale => self.downscales(),
        }
    }

    /// Strength to blend with, or `None` when the raw output is used as is
    #[must_use]
    pub fn effective_strength(&self) -> Option<f32> {
        self.strength
            .filter(|&s| self.supports_strength() && s < 1.0)
    }

    /// Cached unblended, unscaled model output
    #[must_use]
    pub fn raw_output_path(&self) -> Option<&Path> {
        self.raw_output_path.as_deref()
    }

    /// Record where the raw output for the current mask selection was cached
    pub fn record_raw_output(&mut self, path: PathBuf) {
        self.raw_output_path = Some(path);
        self.raw_masks = self.masks.clone();
    }

    /// Whether the cached raw output cannot be reused
    ///
    /// True when nothing is cached or the mask selection changed since it was produced.
    #[must_use]
    pub fn needs_inference(&self) -> bool {
        self.raw_output_path.is_none() || !self.same_masks(&self.raw_masks)
    }

    /// Whether the step shrinks its output, matching what [`apply_scale`](crate::postprocess::apply_scale) does
    #[must_use]
    pub fn downscales(&self) -> bool {
        self.scale.is_some_and(|s| s > 0.0 && s < 1.0)
    }

    pub fn inside_masks(&self) -> impl Iterator<Item = &MaskRef> {
        self.masks.iter().filter(|m| !m.inverted)
    }

    pub fn outside_masks(&self) -> impl Iterator<Item = &MaskRef> {
        self.masks.iter().filter(|m| m.inverted)
    }

    /// Whether `masks` selects the same regions with the same polarity, in any order
    #[must_use]
    pub fn same_masks(&self, masks: &[MaskRef]) -> bool {
        let current: BTreeSet<&MaskRef> = self.masks.iter().collect();
        let other: BTreeSet<&MaskRef> = masks.iter().collect();
        current == other
    }

    /// Filename fragment describing this step
    ///
    /// `_<op>_<model>[_s<pct>][_d<N>X][_m<labels>][_minv<labels>]`
    #[must_use]
    pub fn path_extra(&self) -> String {
        let mut extra = format!("_{}_{}", self.kind, self.model);
        if let Some(s) = self.strength.filter(|&s| s < 1.0) {
            extra.push_str(&format!("_s{}", (s * 100.0).round() as u32));
        }
        if let Some(scale) = self.scale.filter(|&s| s > 0.0 && s < 1.0) {
            extra.push_str(&format!("_d{}X", (1.0 / scale).round() as u32));
        }
        let inside: Vec<&str> = self.inside_masks().map(|m| m.label.as_str()).collect();
        if !inside.is_empty() {
            extra.push_str(&format!("_m{}", inside.join("_")));
        }
        let outside: Vec<&str> = self.outside_masks().map(|m| m.label.as_str()).collect();
        if !outside.is_empty() {
            extra.push_str(&format!("_minv{}", outside.join("_")));
        }
        extra
    }
}
