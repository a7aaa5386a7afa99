//! Tiled inference properties that must hold for any image size and tiling

mod common;

use common::CancelAfter;
use enhance::{
    backends::test_utils::{gradient_image, MockBackend},
    combine_masks, BitDepth, Job, MaskRef, MaskSet, PixelBuffer, Result, TileGrid, TileProcessor,
};
use ndarray::Array2;

const SIZES: [(usize, usize); 5] = [(7, 5), (16, 16), (33, 17), (50, 64), (97, 41)];
const TILINGS: [(usize, usize); 4] = [(16, 0), (16, 4), (32, 8), (64, 16)];

#[test]
fn test_identity_model_is_seamless() -> Result<()> {
    for (width, height) in SIZES {
        let image = gradient_image(width, height, BitDepth::Eight)?;
        for (tile, padding) in TILINGS {
            let processor = TileProcessor::new(tile, padding)?;
            let mut backend = MockBackend::identity();
            let output = processor
                .process(&image, &mut backend, None, &Job::new("identity"))?
                .expect("not cancelled");
            assert_eq!(output, image, "{width}x{height} with tile {tile}, padding {padding}");
        }
    }
    Ok(())
}

#[test]
fn test_upscale_matches_whole_image_upscale() -> Result<()> {
    for (width, height) in SIZES {
        let image = gradient_image(width, height, BitDepth::Eight)?;
        for (tile, padding) in TILINGS {
            let processor = TileProcessor::new(tile, padding)?;
            let mut backend = MockBackend::upscale(2);
            let output = processor
                .process(&image, &mut backend, None, &Job::new("upscale"))?
                .expect("not cancelled");
            assert_eq!(output.dimensions(), (width * 2, height * 2));
            let expected = PixelBuffer::from_fn(width * 2, height * 2, BitDepth::Eight, |y, x, c| {
                image.pixels()[[y / 2, x / 2, c]]
            })?;
            assert_eq!(output, expected, "{width}x{height} with tile {tile}, padding {padding}");
        }
    }
    Ok(())
}

#[test]
fn test_tile_count_matches_grid() -> Result<()> {
    let image = gradient_image(97, 41, BitDepth::Eight)?;
    let processor = TileProcessor::new(32, 8)?;
    let mut backend = MockBackend::identity();
    processor.process(&image, &mut backend, None, &Job::new("count"))?;

    let grid = TileGrid::new(97, 41, 32, 8)?;
    assert_eq!(backend.inference_count(), grid.tile_count());
    assert_eq!(grid.actual_tile_size(), 16);
    Ok(())
}

#[test]
fn test_unmasked_pixels_keep_source_values() -> Result<()> {
    let (width, height) = (50, 40);
    let image = gradient_image(width, height, BitDepth::Eight)?;
    let weights = Array2::from_shape_fn((height, width), |(y, _)| if y < 10 { 1.0 } else { 0.0 });
    let mut masks = MaskSet::new();
    masks.add(enhance::Mask::new("top", weights, enhance::BoundingBox::new(0.0, 0.0, 50.0, 10.0), 1.0));
    let field = combine_masks(&masks.resolve(&[MaskRef::new("top", false)])?)?.expect("one mask");

    let processor = TileProcessor::new(16, 4)?;
    let mut backend = MockBackend::brighten(0.2);
    let output = processor
        .process(&image, &mut backend, Some(&field), &Job::new("masked"))?
        .expect("not cancelled");

    for y in 0..height {
        for x in 0..width {
            let before = image.pixels()[[y, x, 0]];
            let after = output.pixels()[[y, x, 0]];
            if y < 10 {
                assert!(after > before || before == 255, "({x}, {y}) not enhanced");
            } else {
                assert_eq!(after, before, "({x}, {y}) changed outside the mask");
            }
        }
    }

    let grid = TileGrid::new(width, height, 16, 4)?;
    assert!(backend.inference_count() < grid.tile_count());
    Ok(())
}

#[test]
fn test_all_zero_mask_runs_no_inference() -> Result<()> {
    let image = gradient_image(30, 30, BitDepth::Eight)?;
    let mask = Array2::<f32>::zeros((30, 30));
    let processor = TileProcessor::new(16, 4)?;
    let mut backend = MockBackend::brighten(0.5);
    let output = processor
        .process(&image, &mut backend, Some(&mask), &Job::new("empty"))?
        .expect("not cancelled");
    assert_eq!(backend.inference_count(), 0);
    assert_eq!(output, image);
    Ok(())
}

#[test]
fn test_cancellation_stops_between_tiles() -> Result<()> {
    let image = gradient_image(64, 64, BitDepth::Eight)?;
    let job = CancelAfter::job("cancel", 3);

    let processor = TileProcessor::new(16, 4)?;
    let mut backend = MockBackend::identity();
    let output = processor.process(&image, &mut backend, None, &job)?;

    assert!(output.is_none());
    assert_eq!(backend.inference_count(), 3);
    assert_eq!(job.completed(), 3);
    assert!(job.total() > 3);
    Ok(())
}

#[test]
fn test_sixteen_bit_identity_within_one() -> Result<()> {
    let image = gradient_image(37, 23, BitDepth::Sixteen)?;
    let processor = TileProcessor::new(16, 4)?;
    let mut backend = MockBackend::identity();
    let output = processor
        .process(&image, &mut backend, None, &Job::new("deep"))?
        .expect("not cancelled");
    assert_eq!(output.depth(), BitDepth::Sixteen);
    assert!(output
        .pixels()
        .iter()
        .zip(image.pixels().iter())
        .all(|(&a, &b)| a.abs_diff(b) <= 1));
    Ok(())
}
