#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]

//! # Enhance
//!
//! Tiled neural image enhancement (sharpen, denoise, upscale) with ONNX Runtime and Tract
//! backends, mask-gated blending, and operation chains that can be edited and replayed
//! without re-running inference.
//!
//! ## Features
//!
//! - **Tiled Inference**: images of any size are cut into overlapping tiles, each run
//!   through the model and stitched back seamlessly
//! - **Masks**: subject masks restrict where a model applies; inverted masks exclude regions
//! - **Operation Chains**: every output remembers the steps that produced it, with cached raw
//!   model outputs so strength edits only re-blend
//! - **Strength & Scale**: partial effect via linear blending, and "maintain original size"
//!   downscaling after upscaling models
//! - **Multiple Backends**: ONNX Runtime (GPU acceleration) and Tract (Pure Rust)
//! - **Metadata**: allow-listed EXIF fields survive JPEG round trips
//! - **CLI Integration**: Optional command-line interface (enable with `cli` feature)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use enhance::{
//!     BaseFile, DefaultBackendFactory, EnhanceConfig, Job, ModelRunner, OperationEdit,
//!     OperationKind,
//! };
//! use std::sync::Arc;
//!
//! # fn example() -> anyhow::Result<()> {
//! let config = EnhanceConfig::builder()
//!     .tile_size(512)
//!     .tile_padding(32)
//!     .maintain_scale(true)
//!     .build()?;
//! let runner = ModelRunner::new("4x/realesrgan.onnx", config, Arc::new(DefaultBackendFactory))?;
//!
//! let base = Arc::new(BaseFile::new("photo.jpg"));
//! let job = Job::new("upscale photo.jpg");
//! if let Some(mut file) = runner.run(base, OperationKind::Upscale, Vec::new(), &job)? {
//!     // Re-blend at 50% without running the model again
//!     runner.rerun_operation_chain(&mut file, 0, OperationEdit::strength(Some(0.5)), &job)?;
//!     file.save_to("out")?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature Flags
//!
//! - `onnx` (default): ONNX Runtime backend with GPU acceleration support
//! - `tract` (default): Pure Rust backend
//! - `cli` (default): Command-line interface and progress reporting
//! - `tracing-json`, `tracing-files`: extra log outputs for the CLI
//!
//! ### Library-Only Usage
//!
//! ```toml
//! [dependencies]
//! enhance = { version = "0.1", default-features = false, features = ["tract"] }
//! ```

pub mod backends;
pub mod cache;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod error;
pub mod inference;
pub mod masks;
pub mod models;
pub mod operation;
pub mod output_file;
pub mod postprocess;
pub mod processor;
pub mod runner;
pub mod services;
#[cfg(feature = "cli")]
pub mod tracing_config;
pub mod types;
pub mod utils;

// Public API exports
#[cfg(feature = "onnx")]
pub use backends::OnnxBackend;
#[cfg(feature = "tract")]
pub use backends::TractBackend;
pub use cache::{format_size, RenderCache, DEFAULT_MAX_AGE};
pub use config::{EnhanceConfig, EnhanceConfigBuilder, ExecutionProvider};
pub use error::{EnhanceError, Result};
pub use inference::{BackendFactory, BackendType, DefaultBackendFactory, InferenceBackend};
pub use masks::{combine_masks, Mask, MaskGenerator, MaskRef, MaskSet, Segmenter, SubjectDetector};
pub use models::{ModelCatalog, ModelDescriptor, ModelEntry};
pub use operation::{AppliedOperation, OperationKind};
pub use output_file::{BaseFile, OutputFile, ReplayReport};
pub use postprocess::{apply_scale, apply_strength_blending};
pub use processor::{TileGrid, TileProcessor};
pub use runner::{ModelRunner, OperationEdit};
pub use services::{
    ConsoleProgressReporter, ImageFileFormat, ImageIOService, Job, JobHistory, JobOutcome, JobRecord,
    NoOpProgressReporter, OperationQueue, ProgressReporter, ProgressUpdate,
};
pub use types::{BitDepth, BoundingBox, PixelBuffer};

#[cfg(feature = "cli")]
pub use tracing_config::{events, init_cli_tracing, spans, TracingConfig, TracingFormat, TracingOutput};
