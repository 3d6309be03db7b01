//! Re-encodes downloaded pages to the canonical format: RGB JPEG, scaled
//! down (aspect ratio kept) to fit the configured maximum dimensions.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageResult, Rgb, RgbImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeOptions {
    pub max_width: u32,
    pub max_height: u32,
    pub jpeg_quality: u8,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            max_width: 1200,
            max_height: 1800,
            jpeg_quality: 85,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

pub const OUTPUT_EXTENSION: &str = "jpg";

/// Flatten transparency onto white so pages with alpha don't turn black.
fn flatten(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, px) in rgba.enumerate_pixels() {
        let a = px[3] as u32;
        let blend = |c: u8| ((c as u32 * a + 255 * (255 - a)) / 255) as u8;
        out.put_pixel(x, y, Rgb([blend(px[0]), blend(px[1]), blend(px[2])]));
    }
    out
}

/// Decode `bytes`, cap dimensions and encode as JPEG. Fails on anything the
/// decoder does not accept, which callers treat as a corrupt page.
pub fn normalize_image(bytes: &[u8], options: &NormalizeOptions) -> ImageResult<NormalizedImage> {
    let img = image::load_from_memory(bytes)?;
    let (w, h) = img.dimensions();
    let img = if w > options.max_width || h > options.max_height {
        img.resize(options.max_width, options.max_height, FilterType::Lanczos3)
    } else {
        img
    };

    let rgb = flatten(&img);
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, options.jpeg_quality.clamp(1, 100)).encode_image(&rgb)?;
    Ok(NormalizedImage {
        bytes: out,
        width: rgb.width(),
        height: rgb.height(),
    })
}
