//! Fit-into-box math and high-quality resizing over premultiplied buffers.

use anyhow::{anyhow, ensure};
use fast_image_resize as fir;

use crate::codec::PremulImage;
use crate::types::ImageDimensions;

use super::Result;

/// Bounds for the fit-to-container display mode: the image fits entirely
/// inside `container`, preserving aspect ratio, touching the box on at
/// least one edge when the source exceeds it. Sources already inside the
/// container are returned unchanged. Dimensions truncate toward zero.
pub fn fit_bounds(image: ImageDimensions, container: ImageDimensions) -> ImageDimensions {
    if container.is_zero() || image.fits_inside(container) {
        return image;
    }

    let scale =
        (container.w as f64 / image.w as f64).min(container.h as f64 / image.h as f64);
    ImageDimensions::new((scale * image.w as f64) as u32, (scale * image.h as f64) as u32)
}

/// Resizes a premultiplied linear buffer with the Catmull-Rom kernel.
///
/// The resizer's own alpha handling stays disabled: the pixels are already
/// premultiplied, so convolving the raw channels is the correct operation.
pub fn resize_premultiplied(source: &PremulImage, target: ImageDimensions) -> Result<PremulImage> {
    let src = source.dimensions();
    ensure!(!src.is_zero(), "source image has zero dimensions");
    ensure!(!target.is_zero(), "target dimensions must be non-zero");

    if src == target {
        return Ok(source.clone());
    }

    let mut src_bytes = Vec::with_capacity(source.pixels().len() * 2);
    for value in source.pixels() {
        src_bytes.extend_from_slice(&value.to_ne_bytes());
    }

    let src_view = fir::images::ImageRef::new(src.w, src.h, &src_bytes, fir::PixelType::U16x4)
        .map_err(|err| anyhow!("failed to prepare source image: {err}"))?;

    let mut dst_image = fir::images::Image::new(target.w, target.h, fir::PixelType::U16x4);

    let options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::CatmullRom))
        .use_alpha(false);

    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src_view, &mut dst_image, Some(&options))
        .map_err(|err| anyhow!("resize failed: {err}"))?;

    let dst_bytes = dst_image.into_vec();
    let pixels = dst_bytes
        .chunks_exact(2)
        .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
        .collect();

    Ok(PremulImage::new(target, pixels))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> PremulImage {
        let mut pixels = Vec::with_capacity((width * height * 4) as usize);
        let wd = width.saturating_sub(1).max(1);
        let hd = height.saturating_sub(1).max(1);
        for y in 0..height {
            for x in 0..width {
                let r = (x as u64 * 65535 / wd as u64) as u16;
                let g = (y as u64 * 65535 / hd as u64) as u16;
                pixels.extend_from_slice(&[r, g, 0, 65535]);
            }
        }
        PremulImage::new(ImageDimensions::new(width, height), pixels)
    }

    #[test]
    fn oversized_images_scale_down_with_truncation() {
        let fitted = fit_bounds(ImageDimensions::new(3000, 2000), ImageDimensions::new(800, 600));
        assert_eq!(fitted, ImageDimensions::new(800, 533));
    }

    #[test]
    fn images_inside_the_box_are_unchanged() {
        let image = ImageDimensions::new(640, 480);
        assert_eq!(fit_bounds(image, ImageDimensions::new(800, 600)), image);
        assert_eq!(fit_bounds(image, image), image);
    }

    #[test]
    fn zero_container_means_natural_size() {
        let image = ImageDimensions::new(640, 480);
        assert_eq!(fit_bounds(image, ImageDimensions::ZERO), image);
    }

    #[test]
    fn tall_images_touch_the_box_height() {
        let fitted = fit_bounds(ImageDimensions::new(1000, 4000), ImageDimensions::new(800, 600));
        assert_eq!(fitted, ImageDimensions::new(150, 600));
    }

    #[test]
    fn resizes_to_expected_dimensions() {
        let src = gradient(8, 8);
        let out = resize_premultiplied(&src, ImageDimensions::new(4, 4)).expect("resize");
        assert_eq!(out.dimensions(), ImageDimensions::new(4, 4));
        assert_eq!(out.pixels().len(), 4 * 4 * 4);
    }

    #[test]
    fn downscale_preserves_gradient_shape() {
        let src = gradient(8, 8);
        let out = resize_premultiplied(&src, ImageDimensions::new(4, 4)).expect("resize");

        let first = &out.pixels()[..4];
        let last_start = out.pixels().len() - 4;
        let last = &out.pixels()[last_start..];
        assert!(first[0] < last[0], "red should increase across the gradient");
        assert!(first[1] < last[1], "green should increase across the gradient");
    }

    #[test]
    fn identity_resize_is_a_copy() {
        let src = gradient(5, 5);
        let out = resize_premultiplied(&src, ImageDimensions::new(5, 5)).expect("resize");
        assert_eq!(out.pixels(), src.pixels());
    }
}
