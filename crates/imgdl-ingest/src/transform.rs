//! Image transformer
//!
//! Decode, reject small images, center-crop to a square, resize to the
//! target edge and re-encode as JPEG. Pure and deterministic: the same input
//! bytes and options always produce the same output bytes.

use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use imgdl_common::TransformedImage;
use jpeg_encoder::{ColorType, Encoder};
use thiserror::Error;

use crate::config::IngestConfig;

/// Per-run transform settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformOptions {
    /// Smallest accepted decoded width and height
    pub min_size: u32,
    /// Output edge length
    pub target_size: u32,
    pub jpeg_quality: u8,
}

impl TransformOptions {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            min_size: config.min_size,
            target_size: config.target_size(),
            jpeg_quality: config.jpeg_quality,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("cannot decode image: {0}")]
    Undecodable(String),

    #[error("image too small: {width}x{height}")]
    TooSmall { width: u32, height: u32 },

    #[error("cannot encode image: {0}")]
    Encode(String),
}

/// Turn raw downloaded bytes into a square JPEG of `target_size` pixels
pub fn transform(
    bytes: &[u8],
    options: &TransformOptions,
) -> Result<TransformedImage, TransformError> {
    let decoded =
        image::load_from_memory(bytes).map_err(|e| TransformError::Undecodable(e.to_string()))?;

    let (width, height) = (decoded.width(), decoded.height());
    if width < options.min_size || height < options.min_size {
        return Err(TransformError::TooSmall { width, height });
    }

    let target = options.target_size;
    let square = center_crop(&decoded).resize_exact(target, target, FilterType::CatmullRom);
    let rgb = flatten_on_white(&square);
    let encoded = encode_jpeg(&rgb, options.jpeg_quality)?;

    Ok(TransformedImage {
        encoded_bytes: Bytes::from(encoded),
        width: rgb.width(),
        height: rgb.height(),
        original_width: width,
        original_height: height,
    })
}

/// Largest centered square; odd leftovers go to the right and bottom
fn center_crop(image: &DynamicImage) -> DynamicImage {
    let (width, height) = (image.width(), image.height());
    let edge = width.min(height);
    image.crop_imm((width - edge) / 2, (height - edge) / 2, edge, edge)
}

/// Drop alpha by compositing onto opaque white
fn flatten_on_white(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }
    let rgba = image.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let blend = |c: u8| -> u8 {
            let (c, a) = (u32::from(c), u32::from(a));
            ((c * a + 255 * (255 - a) + 127) / 255) as u8
        };
        image::Rgb([blend(r), blend(g), blend(b)])
    })
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, TransformError> {
    let width = u16::try_from(image.width())
        .map_err(|_| TransformError::Encode(format!("width {} exceeds JPEG limit", image.width())))?;
    let height = u16::try_from(image.height()).map_err(|_| {
        TransformError::Encode(format!("height {} exceeds JPEG limit", image.height()))
    })?;

    let mut buf = Vec::new();
    let mut encoder = Encoder::new(&mut buf, quality);
    encoder.set_optimized_huffman_tables(true);
    encoder
        .encode(image.as_raw(), width, height, ColorType::Rgb)
        .map_err(|e| TransformError::Encode(e.to_string()))?;
    Ok(buf)
}
