//! Decoding into [`PremulImage`] buffers.
//!
//! All filtering downstream of the decoder happens in linear light with
//! premultiplied alpha: sources decode to straight-alpha sRGB, are converted
//! once here, and only the display-surface conversion applies the sRGB
//! transfer again. Unassociated alpha is multiplied in before any filtering
//! can see it.

use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, anyhow};
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder as _, ImageFormat, ImageReader, RgbaImage};
use moxcms::{ColorProfile, Layout, TransformOptions};
use tracing::warn;

use crate::types::ImageDimensions;

use super::Result;

/// Linear-light premultiplied RGBA, 16 bits per channel.
#[derive(Clone, PartialEq, Eq)]
pub struct PremulImage {
    dimensions: ImageDimensions,
    pixels: Vec<u16>,
}

impl fmt::Debug for PremulImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PremulImage({})", self.dimensions)
    }
}

impl PremulImage {
    pub fn new(dimensions: ImageDimensions, pixels: Vec<u16>) -> Self {
        debug_assert_eq!(pixels.len(), dimensions.w as usize * dimensions.h as usize * 4);
        Self { dimensions, pixels }
    }

    pub fn width(&self) -> u32 {
        self.dimensions.w
    }

    pub fn height(&self) -> u32 {
        self.dimensions.h
    }

    pub fn dimensions(&self) -> ImageDimensions {
        self.dimensions
    }

    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }

    /// Converts straight-alpha sRGB pixels into the linear premultiplied
    /// working format.
    pub fn from_srgb(rgba: &RgbaImage) -> PremulImage {
        let lut = srgb_to_linear_lut();
        let (w, h) = rgba.dimensions();
        let mut pixels = Vec::with_capacity(w as usize * h as usize * 4);

        for px in rgba.pixels() {
            let [r, g, b, a] = px.0;
            let alpha = a as u32;
            for channel in [r, g, b] {
                let linear = lut[channel as usize] as u32;
                pixels.push((linear * alpha / 255) as u16);
            }
            // Alpha is linear already; widen 0..=255 to the full u16 range.
            pixels.push((alpha * 65535 / 255) as u16);
        }

        PremulImage::new(ImageDimensions::new(w, h), pixels)
    }

    /// Same conversion for colour channels and straight alpha supplied
    /// separately, as the colour-managed decode path produces them.
    fn premultiply_rgb(
        dimensions: ImageDimensions,
        rgb: &[u8],
        alpha: impl Iterator<Item = u8>,
    ) -> PremulImage {
        let lut = srgb_to_linear_lut();
        let mut pixels =
            Vec::with_capacity(dimensions.w as usize * dimensions.h as usize * 4);

        for (px, a) in rgb.chunks_exact(3).zip(alpha) {
            let coverage = a as u32;
            for channel in px {
                let linear = lut[*channel as usize] as u32;
                pixels.push((linear * coverage / 255) as u16);
            }
            pixels.push((coverage * 65535 / 255) as u16);
        }

        PremulImage::new(dimensions, pixels)
    }

    /// Converts back to straight-alpha 8-bit sRGB for the display surface.
    pub fn to_display_rgba(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pixels.len());

        for px in self.pixels.chunks_exact(4) {
            let alpha = px[3] as f32 / 65535.0;
            if alpha == 0.0 {
                out.extend_from_slice(&[0, 0, 0, 0]);
                continue;
            }
            for channel in &px[..3] {
                let linear = (*channel as f32 / 65535.0) / alpha;
                let srgb = linear_to_srgb(linear.clamp(0.0, 1.0));
                out.push((srgb * 255.0 + 0.5) as u8);
            }
            out.push((alpha * 255.0 + 0.5) as u8);
        }

        out
    }
}

/// The sRGB transfer function, applied only on the way to the display.
pub fn linear_to_srgb(v: f32) -> f32 {
    if v <= 0.003_130_8 { 12.92 * v } else { 1.055 * v.powf(1.0 / 2.4) - 0.055 }
}

/// Inverse transfer, used when entering linear light.
pub fn srgb_to_linear(v: f32) -> f32 {
    if v <= 0.04045 { v / 12.92 } else { ((v + 0.055) / 1.055).powf(2.4) }
}

fn srgb_to_linear_lut() -> &'static [u16; 256] {
    static LUT: OnceLock<[u16; 256]> = OnceLock::new();
    LUT.get_or_init(|| {
        let mut lut = [0u16; 256];
        for (i, slot) in lut.iter_mut().enumerate() {
            *slot = (srgb_to_linear(i as f32 / 255.0) * 65535.0 + 0.5) as u16;
        }
        lut
    })
}

/// Decodes an on-disk image into the linear premultiplied working format.
///
/// JPEG, PNG, WebP, GIF (first frame), and BMP are supported. EXIF
/// orientation is applied and embedded ICC profiles are converted to sRGB
/// before the linearisation step.
pub fn decode_premultiplied(path: &Path) -> Result<PremulImage> {
    let data =
        std::fs::read(path).with_context(|| format!("reading image {}", path.display()))?;
    decode_bytes(path, &data)
}

fn decode_bytes(path: &Path, data: &[u8]) -> Result<PremulImage> {
    if data.is_empty() {
        return Err(anyhow!("empty image data for {}", path.display()));
    }

    let reader = if let Some(format) = infer_format(path) {
        ImageReader::with_format(Cursor::new(data), format)
    } else {
        ImageReader::new(Cursor::new(data)).with_guessed_format().context("guessing image format")?
    };

    let mut decoder = reader
        .into_decoder()
        .with_context(|| format!("constructing decoder for {}", path.display()))?;

    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let icc_profile = decoder.icc_profile().unwrap_or(None);

    let mut decoded = DynamicImage::from_decoder(decoder)
        .with_context(|| format!("decoding image {}", path.display()))?;

    if orientation != Orientation::NoTransforms {
        decoded.apply_orientation(orientation);
    }

    let rgba = decoded.into_rgba8();

    if let Some(profile) = icc_profile {
        match premultiply_color_managed(&rgba, &profile) {
            Ok(image) => return Ok(image),
            Err(err) => {
                warn!("failed to apply ICC profile for {}: {err}", path.display());
            }
        }
    }

    Ok(PremulImage::from_srgb(&rgba))
}

fn infer_format(path: &Path) -> Option<ImageFormat> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .and_then(|ext| ImageFormat::from_extension(&ext))
}

/// Applies an embedded ICC profile on the way into linear light. The
/// transform only ever sees colour channels; alpha is carried around it
/// and multiplied in while the working buffer is built, so three-channel
/// profiles and RGBA sources take the same path and no second full-frame
/// RGBA copy exists.
fn premultiply_color_managed(rgba: &RgbaImage, profile_bytes: &[u8]) -> Result<PremulImage> {
    let source = ColorProfile::new_from_slice(profile_bytes)
        .map_err(|err| anyhow!("invalid ICC profile: {err}"))?;
    let display = ColorProfile::new_srgb();
    let transform = source
        .create_transform_8bit(Layout::Rgb, &display, Layout::Rgb, TransformOptions::default())
        .map_err(|err| anyhow!("building ICC transform: {err}"))?;

    let raw = rgba.as_raw();
    let mut rgb = Vec::with_capacity(raw.len() / 4 * 3);
    for px in raw.chunks_exact(4) {
        rgb.extend_from_slice(&px[..3]);
    }

    let mut managed = vec![0u8; rgb.len()];
    transform
        .transform(&rgb, &mut managed)
        .map_err(|err| anyhow!("running ICC transform: {err}"))?;

    let dimensions = ImageDimensions::new(rgba.width(), rgba.height());
    let alpha = raw.iter().skip(3).step_by(4).copied();
    Ok(PremulImage::premultiply_rgb(dimensions, &managed, alpha))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba};

    fn sample_image() -> RgbaImage {
        ImageBuffer::from_fn(2, 2, |x, y| match (x, y) {
            (0, 0) => Rgba([255, 0, 0, 255]),
            (1, 0) => Rgba([0, 255, 0, 255]),
            (0, 1) => Rgba([0, 0, 255, 255]),
            _ => Rgba([255, 255, 0, 128]),
        })
    }

    fn write_sample(dir: &Path, name: &str, format: ImageFormat) -> std::path::PathBuf {
        let path = dir.join(name);
        let dynamic = DynamicImage::ImageRgba8(sample_image());
        let mut cursor = Cursor::new(Vec::new());
        dynamic.write_to(&mut cursor, format).expect("encode sample");
        std::fs::write(&path, cursor.into_inner()).unwrap();
        path
    }

    #[test]
    fn decodes_png_into_premultiplied_linear() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(dir.path(), "page.png", ImageFormat::Png);

        let img = decode_premultiplied(&path).expect("decode png");
        assert_eq!(img.dimensions(), ImageDimensions::new(2, 2));

        // Fully saturated opaque red: full-scale linear red, full alpha.
        let first = &img.pixels()[..4];
        assert_eq!(first, &[65535, 0, 0, 65535]);
    }

    #[test]
    fn premultiplies_translucent_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(dir.path(), "page.png", ImageFormat::Png);

        let img = decode_premultiplied(&path).expect("decode png");
        let last = &img.pixels()[12..16];

        // Alpha 128 scales the premultiplied channels to roughly half.
        let full = srgb_to_linear_lut()[255] as u32;
        let expected = (full * 128 / 255) as u16;
        assert_eq!(last[0], expected);
        assert_eq!(last[1], expected);
        assert_eq!(last[2], 0);
        assert_eq!(last[3], (128u32 * 65535 / 255) as u16);
    }

    #[test]
    fn display_conversion_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(dir.path(), "page.png", ImageFormat::Png);

        let img = decode_premultiplied(&path).expect("decode png");
        let display = img.to_display_rgba();

        assert_eq!(&display[..4], &[255, 0, 0, 255]);
        // The translucent corner survives un-premultiplication within
        // rounding error.
        assert!(display[12].abs_diff(255) <= 1);
        assert!(display[13].abs_diff(255) <= 1);
        assert_eq!(display[15], 128);
    }

    #[test]
    fn decodes_jpeg_and_webp() {
        let dir = tempfile::tempdir().unwrap();
        for (name, format) in
            [("page.jpg", ImageFormat::Jpeg), ("page.webp", ImageFormat::WebP)]
        {
            let path = write_sample(dir.path(), name, format);
            let img = decode_premultiplied(&path).expect("decode");
            assert_eq!(img.dimensions(), ImageDimensions::new(2, 2));
        }
    }

    #[test]
    fn icc_profiles_are_applied_entering_linear_light() {
        let source: RgbaImage = ImageBuffer::from_pixel(1, 1, Rgba([200, 100, 50, 128]));
        let profile = ColorProfile::new_display_p3().encode().expect("encode profile");

        let managed = premultiply_color_managed(&source, &profile).expect("icc conversion");
        let plain = PremulImage::from_srgb(&source);

        // Alpha passes around the transform untouched.
        assert_eq!(managed.pixels()[3], (128u32 * 65535 / 255) as u16);
        // Display-P3 primaries land on different sRGB values.
        assert_ne!(&managed.pixels()[..3], &plain.pixels()[..3]);
    }

    #[test]
    fn transfer_functions_invert_each_other() {
        for i in 0..=100 {
            let v = i as f32 / 100.0;
            let round = srgb_to_linear(linear_to_srgb(v));
            assert!((round - v).abs() < 1e-4, "{v} -> {round}");
        }
    }

    #[test]
    fn rejects_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.png");
        std::fs::write(&path, b"").unwrap();
        let err = decode_premultiplied(&path).unwrap_err();
        assert!(err.to_string().contains("empty image data"));
    }
}
