//! Tiled inference with seamless reconstruction
//!
//! Large images are reflect-padded to a multiple of the tile size, cut into overlapping
//! tiles that carry `tile_padding` pixels of context on every side, run through the
//! model one tile at a time and stitched back onto a canvas at model scale. The context
//! border of every tile output is discarded, which is what hides the seams.
//!
//! When a mask field is supplied the model output is blended with a bicubic upscale of
//! the source, and tiles whose own area carries no mask weight skip inference entirely.

use crate::{
    config::{validate_tiling, EnhanceConfig},
    error::{EnhanceError, Result},
    inference::InferenceBackend,
    services::progress::Job,
    types::PixelBuffer,
    utils::resample::{pad_constant, pad_constant_2d, pad_reflect, resize_bicubic, resize_nearest_2d},
};
use instant::Instant;
use ndarray::{s, Array2, Array4, Zip};
use std::ops::Range;
use tracing::{span, Level};

/// Padding and partition plan for one image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    tile_size: usize,
    tile_padding: usize,
    width: usize,
    height: usize,
    pad_left: usize,
    pad_right: usize,
    pad_top: usize,
    pad_bottom: usize,
    columns: usize,
    rows: usize,
}

impl TileGrid {
    /// Plan the tiling of a `width x height` image
    ///
    /// # Errors
    /// - Zero width or height
    /// - Invalid tile size / padding pair
    pub fn new(width: usize, height: usize, tile_size: usize, tile_padding: usize) -> Result<Self> {
        validate_tiling(tile_size, tile_padding)?;
        if width == 0 || height == 0 {
            return Err(EnhanceError::invalid_config(format!(
                "Degenerate image dimensions {width}x{height}"
            )));
        }

        let x_pad = (tile_size - width % tile_size) % tile_size;
        let y_pad = (tile_size - height % tile_size) % tile_size;
        let actual = tile_size - 2 * tile_padding;

        Ok(Self {
            tile_size,
            tile_padding,
            width,
            height,
            pad_left: x_pad / 2,
            pad_right: x_pad - x_pad / 2,
            pad_top: y_pad / 2,
            pad_bottom: y_pad - y_pad / 2,
            columns: (width + x_pad).div_ceil(actual),
            rows: (height + y_pad).div_ceil(actual),
        })
    }

    /// Total columns of padding added to reach a multiple of the tile size
    #[must_use]
    pub fn x_pad(&self) -> usize {
        self.pad_left + self.pad_right
    }

    /// Total rows of padding added to reach a multiple of the tile size
    #[must_use]
    pub fn y_pad(&self) -> usize {
        self.pad_top + self.pad_bottom
    }

    #[must_use]
    pub fn pad_left(&self) -> usize {
        self.pad_left
    }

    #[must_use]
    pub fn pad_top(&self) -> usize {
        self.pad_top
    }

    #[must_use]
    pub fn padded_width(&self) -> usize {
        self.width + self.x_pad()
    }

    #[must_use]
    pub fn padded_height(&self) -> usize {
        self.height + self.y_pad()
    }

    /// Edge length of the region each tile contributes to the output
    #[must_use]
    pub fn actual_tile_size(&self) -> usize {
        self.tile_size - 2 * self.tile_padding
    }

    #[must_use]
    pub fn columns(&self) -> usize {
        self.columns
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub fn tile_count(&self) -> usize {
        self.columns * self.rows
    }

    /// Region of the padded image a tile contributes, before scaling
    #[must_use]
    pub fn output_region(&self, row: usize, col: usize) -> (Range<usize>, Range<usize>) {
        let actual = self.actual_tile_size();
        let ys = row * actual..((row + 1) * actual).min(self.padded_height());
        let xs = col * actual..((col + 1) * actual).min(self.padded_width());
        (ys, xs)
    }

    /// Context window along one axis, clamped to the padded image
    fn window(&self, index: usize, padded_len: usize) -> (usize, usize) {
        let actual = self.actual_tile_size();
        let start = (index * actual).saturating_sub(self.tile_padding);
        let end = ((index + 1) * actual + self.tile_padding).min(padded_len);
        (start, end)
    }

    /// Reflection padding `(before, after)` that brings a short window up to tile size
    fn edge_padding(&self, start: usize, len: usize) -> (usize, usize) {
        if len >= self.tile_size {
            (0, 0)
        } else if start == 0 {
            (self.tile_size - len, 0)
        } else {
            (0, (self.tile_size - len).min(len.saturating_sub(1)))
        }
    }

    /// Cut one `tile_size x tile_size` model input out of the padded image
    ///
    /// Short edge windows are reflect-padded; whatever reflection cannot cover is
    /// zero-filled on the bottom/right.
    #[must_use]
    pub fn extract_tile(&self, padded: &Array4<f32>, row: usize, col: usize) -> Array4<f32> {
        let (y0, y1) = self.window(row, self.padded_height());
        let (x0, x1) = self.window(col, self.padded_width());
        let window = padded.slice(s![.., .., y0..y1, x0..x1]);

        let (top, bottom) = self.edge_padding(y0, y1 - y0);
        let (left, right) = self.edge_padding(x0, x1 - x0);
        let tile = pad_reflect(window, top, bottom, left, right);

        let (_, _, height, width) = tile.dim();
        if height < self.tile_size || width < self.tile_size {
            pad_constant(
                tile.view(),
                0,
                self.tile_size.saturating_sub(height),
                0,
                self.tile_size.saturating_sub(width),
                0.0,
            )
        } else {
            tile
        }
    }
}

/// Runs a model over an image tile by tile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileProcessor {
    tile_size: usize,
    tile_padding: usize,
    skip_empty_tiles: bool,
}

impl TileProcessor {
    /// # Errors
    /// - Invalid tile size / padding pair
    pub fn new(tile_size: usize, tile_padding: usize) -> Result<Self> {
        validate_tiling(tile_size, tile_padding)?;
        Ok(Self {
            tile_size,
            tile_padding,
            skip_empty_tiles: true,
        })
    }

    /// # Errors
    /// - Invalid tile size / padding pair
    pub fn from_config(config: &EnhanceConfig) -> Result<Self> {
        Ok(Self::new(config.tile_size, config.tile_padding)?
            .with_skip_empty_tiles(config.skip_empty_tiles))
    }

    /// Toggle the empty-tile shortcut; output is identical either way
    #[must_use]
    pub fn with_skip_empty_tiles(mut self, skip: bool) -> Self {
        self.skip_empty_tiles = skip;
        self
    }

    #[must_use]
    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    #[must_use]
    pub fn tile_padding(&self) -> usize {
        self.tile_padding
    }

    /// Run `backend` over `image`, optionally gated by a mask field
    ///
    /// The mask, if any, must have the image's `(height, width)`. Progress is reported
    /// to `job` after every tile, and the job's cancellation flag is polled at the same
    /// points.
    ///
    /// Returns `Ok(None)` when cancelled; nothing partial is ever returned.
    ///
    /// # Errors
    /// - Degenerate image or mask/image shape mismatch
    /// - Backend inference failures
    /// - Model output not `[1, 3, tile*scale, tile*scale]`
    pub fn process(
        &self,
        image: &PixelBuffer,
        backend: &mut dyn InferenceBackend,
        mask: Option<&Array2<f32>>,
        job: &Job,
    ) -> Result<Option<PixelBuffer>> {
        let (width, height) = image.dimensions();
        let _span = span!(
            Level::INFO,
            "tile_processing",
            width = width,
            height = height,
            tile_size = self.tile_size,
            tile_padding = self.tile_padding
        )
        .entered();

        let grid = TileGrid::new(width, height, self.tile_size, self.tile_padding)?;
        let scale = backend.scale();
        if scale == 0 {
            return Err(EnhanceError::model("Model reports a scale of zero"));
        }
        if let Some(mask) = mask {
            if mask.dim() != (height, width) {
                return Err(EnhanceError::invalid_config(format!(
                    "Mask field {:?} does not match image {}x{}",
                    mask.dim(),
                    width,
                    height
                )));
            }
        }

        let start = Instant::now();
        log::debug!(
            "🧩 Tiling {}x{} image into {}x{} tiles (tile {}, padding {}, scale x{})",
            width,
            height,
            grid.columns(),
            grid.rows(),
            self.tile_size,
            self.tile_padding,
            scale
        );

        let padded = pad_reflect(
            image.to_tensor().view(),
            grid.pad_top,
            grid.pad_bottom,
            grid.pad_left,
            grid.pad_right,
        );
        let padded_mask = mask.map(|m| {
            pad_constant_2d(
                m.view(),
                grid.pad_top,
                grid.pad_bottom,
                grid.pad_left,
                grid.pad_right,
                0.0,
            )
        });

        let out_height = grid.padded_height() * scale;
        let out_width = grid.padded_width() * scale;
        let mut canvas = Array4::<f32>::zeros((1, 3, out_height, out_width));

        // Source upscaled to canvas size and mask upscaled to match, for blending
        let blend = padded_mask.as_ref().map(|m| {
            (
                resize_bicubic(padded.view(), out_height, out_width),
                resize_nearest_2d(m.view(), out_height, out_width),
            )
        });

        job.start(grid.tile_count());
        if job.is_cancelled() {
            log::info!("Tile processing cancelled before the first tile");
            return Ok(None);
        }

        let scaled_tile = grid.actual_tile_size() * scale;
        let scaled_padding = self.tile_padding * scale;
        let expected = (1, 3, self.tile_size * scale, self.tile_size * scale);
        let mut skipped = 0usize;

        for row in 0..grid.rows() {
            for col in 0..grid.columns() {
                let oy = row * scaled_tile;
                let ox = col * scaled_tile;
                let th = scaled_tile.min(out_height - oy);
                let tw = scaled_tile.min(out_width - ox);

                let (ys, xs) = grid.output_region(row, col);
                let empty = self.skip_empty_tiles
                    && padded_mask
                        .as_ref()
                        .is_some_and(|m| !m.slice(s![ys, xs]).iter().any(|&v| v > 0.0));

                match (&blend, empty) {
                    (Some((original, _)), true) => {
                        canvas
                            .slice_mut(s![.., .., oy..oy + th, ox..ox + tw])
                            .assign(&original.slice(s![.., .., oy..oy + th, ox..ox + tw]));
                        skipped += 1;
                    },
                    _ => {
                        let tile = grid.extract_tile(&padded, row, col);
                        let output = backend.infer(&tile)?;
                        if output.dim() != expected {
                            return Err(EnhanceError::inference(format!(
                                "Model returned {:?} for a {}px tile, expected {:?}",
                                output.dim(),
                                self.tile_size,
                                expected
                            )));
                        }
                        canvas
                            .slice_mut(s![.., .., oy..oy + th, ox..ox + tw])
                            .assign(&output.slice(s![
                                ..,
                                ..,
                                scaled_padding..scaled_padding + th,
                                scaled_padding..scaled_padding + tw
                            ]));
                    },
                }

                job.advance(1);
                if job.is_cancelled() {
                    log::info!(
                        "Tile processing cancelled after {}/{} tiles",
                        job.completed(),
                        grid.tile_count()
                    );
                    return Ok(None);
                }
            }
        }

        if let Some((original, mask_up)) = &blend {
            for c in 0..3 {
                Zip::from(canvas.slice_mut(s![0, c, .., ..]))
                    .and(mask_up)
                    .and(original.slice(s![0, c, .., ..]))
                    .for_each(|out, &m, &orig| *out = m * *out + (1.0 - m) * orig);
            }
        }

        let top = grid.pad_top * scale;
        let left = grid.pad_left * scale;
        let cropped = canvas.slice(s![
            ..,
            ..,
            top..top + height * scale,
            left..left + width * scale
        ]);
        let result = PixelBuffer::from_tensor(&cropped.to_owned(), image.depth())?;

        log::debug!(
            "✅ Processed {} tiles ({} skipped) in {}ms",
            grid.tile_count(),
            skipped,
            start.elapsed().as_millis()
        );
        Ok(Some(result))
    }
}
