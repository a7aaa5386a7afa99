//! Enhance CLI Tool
//!
//! Command-line interface for tiled neural sharpening, denoising and upscaling with
//! ONNX Runtime and Tract backends.

use enhance::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}
