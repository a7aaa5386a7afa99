//! Enhance CLI Tool
//!
//! Runs one model over one image, optionally re-blends it at a custom strength, and saves
//! the render next to the input or into an output directory.

use super::config::CliConfigBuilder;
use crate::{
    cache::{RenderCache, DEFAULT_MAX_AGE},
    inference::{BackendType, DefaultBackendFactory},
    models::{ModelCatalog, CATALOG_FILE},
    operation::OperationKind,
    output_file::BaseFile,
    runner::{ModelRunner, OperationEdit},
    services::{
        progress::{JobOutcome, JobRecord, ProgressReporter, ProgressUpdate},
        OperationQueue,
    },
    tracing_config::{events, init_cli_tracing, spans},
};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

/// Neural image enhancement CLI tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "enhance")]
pub struct Cli {
    /// Input image (JPEG, PNG or TIFF)
    #[arg(value_name = "INPUT", required_unless_present = "list_models")]
    pub input: Option<PathBuf>,

    /// Model path relative to the model root (e.g. 4x/realesrgan.onnx)
    #[arg(short, long, required_unless_present = "list_models")]
    pub model: Option<String>,

    /// Operation the model performs
    #[arg(short = 'O', long, value_enum, default_value_t = CliOperation::Sharpen)]
    pub operation: CliOperation,

    /// Tile edge length fed to the model
    #[arg(long, default_value_t = 512)]
    pub tile_size: usize,

    /// Context padding on each side of a tile
    #[arg(long, default_value_t = 32)]
    pub tile_padding: usize,

    /// Downscale upscaler output back to the input size
    #[arg(long)]
    pub maintain_scale: bool,

    /// Blend strength (0.0-1.0) applied after inference [default: 0.8 where supported]
    #[arg(short, long)]
    pub strength: Option<f32>,

    /// Directory holding model files and models.json
    #[arg(long, value_name = "DIR")]
    pub model_root: Option<PathBuf>,

    /// Directory to save the result in [default: next to the input]
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Inference backend
    #[arg(short, long, value_enum, default_value_t = CliBackend::default())]
    pub backend: CliBackend,

    /// Execution provider for the ONNX backend (auto, cpu, cuda, coreml)
    #[arg(short, long, default_value = "auto")]
    pub execution_provider: String,

    /// Number of threads (0 = auto-detect)
    #[arg(short, long, default_value_t = 0)]
    pub threads: usize,

    /// JPEG quality (0-100)
    #[arg(long, default_value_t = 100)]
    pub jpeg_quality: u8,

    /// Use custom cache directory
    #[arg(long, value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// List models in the catalog and exit
    #[arg(long)]
    pub list_models: bool,

    /// Enable verbose logging (-v: DEBUG, -vv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliOperation {
    Sharpen,
    Denoise,
    Upscale,
}

impl From<CliOperation> for OperationKind {
    fn from(operation: CliOperation) -> Self {
        match operation {
            CliOperation::Sharpen => Self::Sharpen,
            CliOperation::Denoise => Self::Denoise,
            CliOperation::Upscale => Self::Upscale,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliBackend {
    Onnx,
    Tract,
}

impl Default for CliBackend {
    fn default() -> Self {
        match BackendType::default() {
            BackendType::Onnx => Self::Onnx,
            BackendType::Tract => Self::Tract,
        }
    }
}

impl From<CliBackend> for BackendType {
    fn from(backend: CliBackend) -> Self {
        match backend {
            CliBackend::Onnx => Self::Onnx,
            CliBackend::Tract => Self::Tract,
        }
    }
}

/// Progress bar over the tiles of the running job
struct IndicatifReporter {
    bar: ProgressBar,
}

impl IndicatifReporter {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        bar.set_style(style);
        Self { bar }
    }
}

impl ProgressReporter for IndicatifReporter {
    fn report_progress(&self, update: &ProgressUpdate) {
        self.bar.set_length(update.total as u64);
        self.bar.set_position(update.completed as u64);
        self.bar.set_message(update.label.clone());
    }

    fn report_completion(&self, record: &JobRecord) {
        match &record.outcome {
            JobOutcome::Completed => self.bar.finish_with_message(format!("✅ {}", record.label)),
            JobOutcome::Cancelled => self.bar.abandon_with_message(format!("⏹️ {} cancelled", record.label)),
            JobOutcome::Failed(_) => self.bar.abandon(),
        }
    }

    fn report_error(&self, label: &str, error: &str) {
        self.bar.println(format!("❌ {label}: {error}"));
    }
}

pub async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (_guard, session_id) = init_cli_tracing(cli.verbose).context("Failed to initialize tracing")?;

    CliConfigBuilder::validate_cli(&cli).context("Invalid CLI arguments")?;
    let config = CliConfigBuilder::from_cli(&cli)?;

    if cli.list_models {
        return list_models(&config.model_root);
    }

    let (Some(input), Some(model)) = (cli.input.clone(), cli.model.clone()) else {
        anyhow::bail!("An input image and --model are required");
    };

    let cache = RenderCache::from_config(&config).context("Failed to open cache directory")?;
    if let Err(e) = cache.purge_expired(DEFAULT_MAX_AGE) {
        warn!("Could not purge expired cache files: {e}");
    }

    let kind = OperationKind::from(cli.operation);
    let runner = Arc::new(
        ModelRunner::new(&model, config.clone(), Arc::new(DefaultBackendFactory))
            .context("Failed to create model runner")?,
    );
    if !runner.model().exists() {
        anyhow::bail!("Model not found: {}", runner.model().path().display());
    }

    let session = spans::session(&session_id, runner.model().name(), kind.as_str());
    let start_time = Instant::now();
    let saved = match enhance_file(&cli, runner, kind, input.clone())
        .instrument(session)
        .await
    {
        Ok(saved) => saved,
        Err(e) => {
            events::error_with_context(&*e, &input.display().to_string());
            return Err(e);
        },
    };

    match saved {
        Some(path) => events::progress(
            &format!("Saved {} in {:.2}s", path.display(), start_time.elapsed().as_secs_f64()),
            "📁",
        ),
        None => warn!("Cancelled, nothing saved for {}", input.display()),
    }
    Ok(())
}

async fn enhance_file(cli: &Cli, runner: Arc<ModelRunner>, kind: OperationKind, input: PathBuf) -> Result<Option<PathBuf>> {
    let queue = OperationQueue::with_reporter(runner.config().history_capacity, Arc::new(IndicatifReporter::new()));
    let job = queue.job(format!("{kind} {}", input.display()));

    let token = job.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling after the current tile");
            token.cancel();
        }
    });

    let base = Arc::new(BaseFile::new(&input));
    let strength = cli.strength;
    let file = queue
        .submit(job, move |job| {
            let _span = spans::file_processing(base.path()).entered();
            let Some(mut file) = runner.run(base, kind, Vec::new(), job)? else {
                return Ok(None);
            };
            if let Some(strength) = strength {
                let supported = file.operations().first().is_some_and(|op| op.supports_strength());
                if !supported {
                    warn!("{kind} without --maintain-scale has no strength, ignoring --strength");
                } else if runner
                    .rerun_operation_chain(&mut file, 0, OperationEdit::strength(Some(strength)), job)?
                    .is_none()
                {
                    return Ok(None);
                }
            }
            Ok(Some(file))
        })
        .await
        .context("Enhancement failed")?;

    let Some(mut file) = file else {
        return Ok(None);
    };
    let output_dir = match &cli.output_dir {
        Some(dir) => dir.clone(),
        None => input
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    let saved = file.save_to(&output_dir).context("Failed to save result")?;
    Ok(Some(saved))
}

fn list_models(model_root: &std::path::Path) -> Result<()> {
    let path = model_root.join(CATALOG_FILE);
    let mut catalog = ModelCatalog::load(&path).context("Failed to read model catalog")?;
    let installed = catalog.refresh_installed(model_root);

    if catalog.is_empty() {
        println!("No models listed in {}", path.display());
        return Ok(());
    }

    println!("📋 Models in {} ({} installed):", path.display(), installed);
    println!();
    for (key, entry) in catalog.iter() {
        let marker = if entry.installed { "✅" } else { "  " };
        println!("{marker} {key}");
        println!("     {} by {}", entry.name, entry.author);
        if !entry.operation.is_empty() {
            println!("     operations: {}", entry.operation.join(", "));
        }
        if !entry.description.is_empty() {
            println!("     {}", entry.description);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_invocation() {
        let cli = Cli::parse_from(["enhance", "photo.png", "--model", "1x/deblur.onnx"]);
        assert_eq!(cli.input, Some(PathBuf::from("photo.png")));
        assert_eq!(cli.operation, CliOperation::Sharpen);
        assert_eq!(cli.tile_size, 512);
        assert_eq!(cli.tile_padding, 32);
        assert!(cli.strength.is_none());
    }

    #[test]
    fn test_list_models_needs_no_input() {
        let cli = Cli::parse_from(["enhance", "--list-models"]);
        assert!(cli.list_models);
        assert!(Cli::try_parse_from(["enhance", "photo.png"]).is_err());
    }

    #[test]
    fn test_operation_mapping() {
        let cli = Cli::parse_from(["enhance", "a.jpg", "-m", "x.onnx", "-O", "upscale", "-s", "0.5"]);
        assert_eq!(OperationKind::from(cli.operation), OperationKind::Upscale);
        assert_eq!(cli.strength, Some(0.5));
    }
}
