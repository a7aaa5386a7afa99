//! Padding and resampling kernels on `[N, C, H, W]` tensors
//!
//! All resamplers are separable: a per-axis tap table is built once and applied along
//! width, then height.

use ndarray::{s, Array2, Array4, ArrayView2, ArrayView4};

/// Cubic convolution coefficient, matching the common bicubic convention
const CUBIC_A: f32 = -0.75;

/// Source taps `(index, weight)` for each output position along one axis
type Taps = Vec<Vec<(usize, f32)>>;

/// Mirror an out-of-range index back into `0..len` without repeating the edge sample
///
/// Indices further out than one period keep mirroring, so arbitrarily wide pads work on
/// small inputs.
#[must_use]
pub fn reflect_index(index: isize, len: usize) -> usize {
    if len <= 1 {
        return 0;
    }
    let len = len as isize;
    let period = 2 * (len - 1);
    let folded = index.rem_euclid(period);
    if folded >= len {
        (period - folded) as usize
    } else {
        folded as usize
    }
}

/// Pad the two spatial axes by reflection
#[must_use]
pub fn pad_reflect(
    input: ArrayView4<'_, f32>,
    top: usize,
    bottom: usize,
    left: usize,
    right: usize,
) -> Array4<f32> {
    let (batch, channels, height, width) = input.dim();
    Array4::from_shape_fn(
        (batch, channels, height + top + bottom, width + left + right),
        |(b, c, y, x)| {
            let sy = reflect_index(y as isize - top as isize, height);
            let sx = reflect_index(x as isize - left as isize, width);
            input[[b, c, sy, sx]]
        },
    )
}

/// Pad the two spatial axes with a constant value
#[must_use]
pub fn pad_constant(
    input: ArrayView4<'_, f32>,
    top: usize,
    bottom: usize,
    left: usize,
    right: usize,
    value: f32,
) -> Array4<f32> {
    let (batch, channels, height, width) = input.dim();
    let mut output = Array4::from_elem(
        (batch, channels, height + top + bottom, width + left + right),
        value,
    );
    output
        .slice_mut(s![.., .., top..top + height, left..left + width])
        .assign(&input);
    output
}

/// Constant padding for single-channel weight fields
#[must_use]
pub fn pad_constant_2d(
    input: ArrayView2<'_, f32>,
    top: usize,
    bottom: usize,
    left: usize,
    right: usize,
    value: f32,
) -> Array2<f32> {
    let (height, width) = input.dim();
    let mut output = Array2::from_elem((height + top + bottom, width + left + right), value);
    output
        .slice_mut(s![top..top + height, left..left + width])
        .assign(&input);
    output
}

fn cubic_weight(t: f32) -> f32 {
    let t = t.abs();
    if t <= 1.0 {
        ((CUBIC_A + 2.0) * t - (CUBIC_A + 3.0)) * t * t + 1.0
    } else if t < 2.0 {
        ((CUBIC_A * t - 5.0 * CUBIC_A) * t + 8.0 * CUBIC_A) * t - 4.0 * CUBIC_A
    } else {
        0.0
    }
}

fn cubic_taps(in_len: usize, out_len: usize) -> Taps {
    let ratio = in_len as f32 / out_len as f32;
    let last = in_len.saturating_sub(1) as isize;
    (0..out_len)
        .map(|o| {
            let src = (o as f32 + 0.5) * ratio - 0.5;
            let base = src.floor();
            let t = src - base;
            let base = base as isize;
            [
                (base - 1, cubic_weight(t + 1.0)),
                (base, cubic_weight(t)),
                (base + 1, cubic_weight(1.0 - t)),
                (base + 2, cubic_weight(2.0 - t)),
            ]
            .into_iter()
            .map(|(i, w)| (i.clamp(0, last) as usize, w))
            .collect()
        })
        .collect()
}

fn area_taps(in_len: usize, out_len: usize) -> Taps {
    let ratio = in_len as f64 / out_len as f64;
    (0..out_len)
        .map(|o| {
            let start = o as f64 * ratio;
            let end = ((o + 1) as f64 * ratio).min(in_len as f64);
            let span = end - start;
            let first = start.floor() as usize;
            let last = (end.ceil() as usize).min(in_len);
            (first..last)
                .filter_map(|i| {
                    let overlap = end.min(i as f64 + 1.0) - start.max(i as f64);
                    (overlap > 0.0).then(|| (i, (overlap / span) as f32))
                })
                .collect()
        })
        .collect()
}

fn apply_width(input: ArrayView4<'_, f32>, taps: &Taps) -> Array4<f32> {
    let (batch, channels, height, _) = input.dim();
    Array4::from_shape_fn((batch, channels, height, taps.len()), |(b, c, y, x)| {
        taps.get(x).map_or(0.0, |row| {
            row.iter().map(|&(sx, w)| input[[b, c, y, sx]] * w).sum()
        })
    })
}

fn apply_height(input: ArrayView4<'_, f32>, taps: &Taps) -> Array4<f32> {
    let (batch, channels, _, width) = input.dim();
    Array4::from_shape_fn((batch, channels, taps.len(), width), |(b, c, y, x)| {
        taps.get(y).map_or(0.0, |row| {
            row.iter().map(|&(sy, w)| input[[b, c, sy, x]] * w).sum()
        })
    })
}

/// Bicubic resize with half-pixel centers and clamped borders
#[must_use]
pub fn resize_bicubic(input: ArrayView4<'_, f32>, out_height: usize, out_width: usize) -> Array4<f32> {
    let (_, _, height, width) = input.dim();
    if height == out_height && width == out_width {
        return input.to_owned();
    }
    let horizontal = apply_width(input, &cubic_taps(width, out_width));
    apply_height(horizontal.view(), &cubic_taps(height, out_height))
}

/// Area-averaging resize, used for downscaling without aliasing
#[must_use]
pub fn resize_area(input: ArrayView4<'_, f32>, out_height: usize, out_width: usize) -> Array4<f32> {
    let (_, _, height, width) = input.dim();
    if height == out_height && width == out_width {
        return input.to_owned();
    }
    let horizontal = apply_width(input, &area_taps(width, out_width));
    apply_height(horizontal.view(), &area_taps(height, out_height))
}

/// Nearest-neighbour resize of a weight field (`floor(dst * in / out)` sampling)
#[must_use]
pub fn resize_nearest_2d(input: ArrayView2<'_, f32>, out_height: usize, out_width: usize) -> Array2<f32> {
    let (height, width) = input.dim();
    if height == out_height && width == out_width {
        return input.to_owned();
    }
    Array2::from_shape_fn((out_height, out_width), |(y, x)| {
        let sy = (y * height / out_height).min(height.saturating_sub(1));
        let sx = (x * width / out_width).min(width.saturating_sub(1));
        input[[sy, sx]]
    })
}
