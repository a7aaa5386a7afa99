//! Strength blending and scale adjustment applied after inference
//!
//! Every step of a chain goes raw output → strength blend against the step's input →
//! scale adjustment, in that order.

use crate::{
    error::Result,
    operation::AppliedOperation,
    types::PixelBuffer,
    utils::resample::{resize_area, resize_bicubic},
};
use ndarray::Zip;

/// Blend raw model output with the image the operation was applied to
///
/// A no-op unless the operation supports strength and its strength is below 1. The
/// reference is bicubic-resized and depth-converted to match the output first.
///
/// # Errors
/// - Pixel conversion failures
pub fn apply_strength_blending(
    output: &PixelBuffer,
    operation: &AppliedOperation,
    reference: &PixelBuffer,
) -> Result<PixelBuffer> {
    match operation.effective_strength() {
        Some(strength) => blend(output, reference, strength),
        None => Ok(output.clone()),
    }
}

/// `strength * output + (1 - strength) * reference`, per sample
///
/// # Errors
/// - Pixel conversion failures
pub fn blend(output: &PixelBuffer, reference: &PixelBuffer, strength: f32) -> Result<PixelBuffer> {
    let reference = if reference.depth() == output.depth() {
        reference.to_planar()
    } else {
        reference.with_depth(output.depth()).to_planar()
    };
    let (width, height) = output.dimensions();
    let reference = if reference.dim().2 == height && reference.dim().3 == width {
        reference
    } else {
        log::debug!(
            "Resizing blend reference {}x{} -> {}x{}",
            reference.dim().3,
            reference.dim().2,
            width,
            height
        );
        resize_bicubic(reference.view(), height, width)
    };

    let mut blended = output.to_planar();
    Zip::from(&mut blended)
        .and(&reference)
        .for_each(|o, &r| *o = strength * *o + (1.0 - strength) * r);
    PixelBuffer::from_planar(&blended, output.depth())
}

/// Downscale by the operation's ratio using area averaging
///
/// A no-op when the operation has no scale or a ratio of 1 or more. Target dimensions
/// are rounded and never drop below one pixel.
///
/// # Errors
/// - Pixel conversion failures
pub fn apply_scale(image: &PixelBuffer, operation: &AppliedOperation) -> Result<PixelBuffer> {
    let Some(scale) = operation.scale.filter(|&s| s > 0.0 && s < 1.0) else {
        return Ok(image.clone());
    };
    let (width, height) = image.dimensions();
    let target_width = ((width as f32 * scale).round() as usize).max(1);
    let target_height = ((height as f32 * scale).round() as usize).max(1);
    log::debug!("Scaling {width}x{height} -> {target_width}x{target_height} (x{scale})");

    let resized = resize_area(image.to_planar().view(), target_height, target_width);
    PixelBuffer::from_planar(&resized, image.depth())
}

/// Post-process one raw output: blend against `input`, then rescale
///
/// # Errors
/// - Pixel conversion failures
pub fn finish_step(raw: &PixelBuffer, operation: &AppliedOperation, input: &PixelBuffer) -> Result<PixelBuffer> {
    let blended = apply_strength_blending(raw, operation, input)?;
    apply_scale(&blended, operation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::gradient_image;
    use crate::models::ModelDescriptor;
    use crate::operation::OperationKind;
    use crate::types::BitDepth;

    fn op(kind: OperationKind, scale: Option<f32>, strength: Option<f32>) -> AppliedOperation {
        AppliedOperation::new(kind, &ModelDescriptor::new("models", "x/m.onnx"), scale, Vec::new())
            .with_strength(strength)
            .unwrap()
    }

    fn constant(width: usize, height: usize, value: u16) -> PixelBuffer {
        PixelBuffer::from_fn(width, height, BitDepth::Eight, |_, _, _| value).unwrap()
    }

    #[test]
    fn test_full_strength_returns_output() {
        let output = gradient_image(8, 8, BitDepth::Eight).unwrap();
        let input = constant(8, 8, 0);
        let blended = apply_strength_blending(&output, &op(OperationKind::Sharpen, None, Some(1.0)), &input).unwrap();
        assert_eq!(blended, output);
    }

    #[test]
    fn test_zero_strength_returns_input() {
        let output = constant(8, 8, 200);
        let input = gradient_image(8, 8, BitDepth::Eight).unwrap();
        let blended = apply_strength_blending(&output, &op(OperationKind::Denoise, None, Some(0.0)), &input).unwrap();
        assert_eq!(blended, input);
    }

    #[test]
    fn test_zero_strength_resizes_input() {
        let output = constant(8, 8, 200);
        let input = constant(4, 4, 40);
        let blended = apply_strength_blending(
            &output,
            &op(OperationKind::Upscale, Some(0.5), Some(0.0)),
            &input,
        )
        .unwrap();
        assert_eq!(blended, constant(8, 8, 40));
    }

    #[test]
    fn test_blend_is_monotonic() {
        let output = constant(4, 4, 200);
        let input = constant(4, 4, 100);
        let mut previous = 100;
        for step in 0..=10 {
            let strength = step as f32 / 10.0;
            let value = blend(&output, &input, strength).unwrap().pixels()[[0, 0, 0]];
            assert!(value >= previous);
            previous = value;
        }
        assert_eq!(blend(&output, &input, 0.5).unwrap().pixels()[[2, 2, 1]], 150);
    }

    #[test]
    fn test_plain_upscale_never_blends() {
        let output = constant(4, 4, 200);
        let input = constant(4, 4, 0);
        let upscale = op(OperationKind::Upscale, None, Some(0.3));
        assert_eq!(apply_strength_blending(&output, &upscale, &input).unwrap(), output);
    }

    #[test]
    fn test_blend_converts_reference_depth() {
        let output = PixelBuffer::from_fn(2, 2, BitDepth::Sixteen, |_, _, _| 65535).unwrap();
        let input = constant(2, 2, 0);
        let blended = blend(&output, &input, 0.5).unwrap();
        assert_eq!(blended.depth(), BitDepth::Sixteen);
        assert_eq!(blended.pixels()[[0, 0, 0]], 32768);
    }

    #[test]
    fn test_scale_area_average() {
        let image = PixelBuffer::from_fn(4, 2, BitDepth::Eight, |_, x, _| if x % 2 == 0 { 0 } else { 100 }).unwrap();
        let scaled = apply_scale(&image, &op(OperationKind::Upscale, Some(0.5), None)).unwrap();
        assert_eq!(scaled.dimensions(), (2, 1));
        assert!(scaled.pixels().iter().all(|&v| v == 50));
    }

    #[test]
    fn test_scale_noop_and_minimum_size() {
        let image = gradient_image(3, 3, BitDepth::Eight).unwrap();
        assert_eq!(apply_scale(&image, &op(OperationKind::Sharpen, None, None)).unwrap(), image);
        assert_eq!(apply_scale(&image, &op(OperationKind::Upscale, Some(1.0), None)).unwrap(), image);
        let tiny = apply_scale(&image, &op(OperationKind::Upscale, Some(0.1), None)).unwrap();
        assert_eq!(tiny.dimensions(), (1, 1));
    }
}
