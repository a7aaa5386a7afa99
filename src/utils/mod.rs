//! Shared numeric utilities

pub mod resample;

pub use resample::{
    pad_constant, pad_constant_2d, pad_reflect, reflect_index, resize_area, resize_bicubic,
    resize_nearest_2d,
};
