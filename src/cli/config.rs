//! Configuration conversion utilities for CLI arguments

use crate::cli::main_impl::Cli;
use crate::config::{default_cache_dir, EnhanceConfig};
use anyhow::{Context, Result};

/// Convert CLI arguments to an [`EnhanceConfig`]
pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    /// Build the library configuration from CLI arguments
    pub(crate) fn from_cli(cli: &Cli) -> Result<EnhanceConfig> {
        let execution_provider = cli
            .execution_provider
            .parse()
            .context("Invalid --execution-provider")?;

        let mut builder = EnhanceConfig::builder()
            .tile_size(cli.tile_size)
            .tile_padding(cli.tile_padding)
            .maintain_scale(cli.maintain_scale)
            .skip_empty_tiles(true)
            .backend(cli.backend.into())
            .execution_provider(execution_provider)
            .intra_threads(cli.threads)
            .jpeg_quality(cli.jpeg_quality)
            .cache_dir(cli.cache_dir.clone().unwrap_or_else(default_cache_dir));
        if let Some(root) = &cli.model_root {
            builder = builder.model_root(root.clone());
        }

        builder.build().context("Invalid configuration")
    }

    /// Check arguments that the configuration itself does not cover
    pub(crate) fn validate_cli(cli: &Cli) -> Result<()> {
        if let Some(strength) = cli.strength {
            if !(0.0..=1.0).contains(&strength) {
                anyhow::bail!("--strength must be between 0.0 and 1.0, got {strength}");
            }
        }
        if let Some(input) = &cli.input {
            if !input.is_file() {
                anyhow::bail!("Input file not found: {}", input.display());
            }
        }
        if let Some(dir) = &cli.output_dir {
            if dir.is_file() {
                anyhow::bail!(
                    "Output path exists and is a file, not a directory: {}",
                    dir.display()
                );
            }
        }
        Ok(())
    }
}
