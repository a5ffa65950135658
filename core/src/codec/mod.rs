//! Image decoding into linear-light premultiplied buffers.

pub mod image;

pub use image::{PremulImage, decode_premultiplied, linear_to_srgb, srgb_to_linear};

pub type Result<T> = crate::Result<T>;
